//! Meta-engine key layout.
//!
//! All per-cell durable records live in the meta engine under a reserved
//! local prefix, keyed by cell id. Cell ids and log indices are encoded
//! big-endian so a range scan over a cell's log iterates entries in index
//! order.
//!
//! Layout:
//!
//! ```text
//! 0x01 0x01                          store identity
//! 0x01 0x02 <id8> 0x01 <index8>      raft log entry
//! 0x01 0x02 <id8> 0x02               raft local state
//! 0x01 0x02 <id8> 0x03               raft apply state
//! 0x01 0x03 <id8> 0x01               cell local state (peer state + descriptor)
//! ```

const LOCAL_PREFIX: u8 = 0x01;
const IDENT_SUFFIX: u8 = 0x01;
const RAFT_PREFIX: u8 = 0x02;
const CELL_META_PREFIX: u8 = 0x03;

const RAFT_LOG_SUFFIX: u8 = 0x01;
const RAFT_STATE_SUFFIX: u8 = 0x02;
const APPLY_STATE_SUFFIX: u8 = 0x03;
const CELL_STATE_SUFFIX: u8 = 0x01;

/// Key of the store identity record.
pub fn store_ident_key() -> Vec<u8> {
    vec![LOCAL_PREFIX, IDENT_SUFFIX]
}

fn cell_prefix(area: u8, cell_id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(11);
    key.push(LOCAL_PREFIX);
    key.push(area);
    key.extend_from_slice(&cell_id.to_be_bytes());
    key
}

/// Key of one raft log entry.
pub fn raft_log_key(cell_id: u64, index: u64) -> Vec<u8> {
    let mut key = raft_log_prefix(cell_id);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

/// Prefix shared by every raft log entry of a cell.
pub fn raft_log_prefix(cell_id: u64) -> Vec<u8> {
    let mut key = cell_prefix(RAFT_PREFIX, cell_id);
    key.push(RAFT_LOG_SUFFIX);
    key
}

/// Key of the cell's raft local state.
pub fn raft_state_key(cell_id: u64) -> Vec<u8> {
    let mut key = cell_prefix(RAFT_PREFIX, cell_id);
    key.push(RAFT_STATE_SUFFIX);
    key
}

/// Key of the cell's raft apply state.
pub fn apply_state_key(cell_id: u64) -> Vec<u8> {
    let mut key = cell_prefix(RAFT_PREFIX, cell_id);
    key.push(APPLY_STATE_SUFFIX);
    key
}

/// Key of the cell's local state (peer state plus cell descriptor).
pub fn cell_state_key(cell_id: u64) -> Vec<u8> {
    let mut key = cell_prefix(CELL_META_PREFIX, cell_id);
    key.push(CELL_STATE_SUFFIX);
    key
}

/// Inclusive lower bound of the cell-state key space, for startup scans.
pub fn cell_meta_min_key() -> Vec<u8> {
    vec![LOCAL_PREFIX, CELL_META_PREFIX]
}

/// Exclusive upper bound of the cell-state key space.
pub fn cell_meta_max_key() -> Vec<u8> {
    vec![LOCAL_PREFIX, CELL_META_PREFIX + 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_keys_sort_by_index() {
        let a = raft_log_key(7, 1);
        let b = raft_log_key(7, 2);
        let c = raft_log_key(7, 256);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn log_keys_share_cell_prefix() {
        let prefix = raft_log_prefix(7);
        assert!(raft_log_key(7, 42).starts_with(&prefix));
        assert!(!raft_log_key(8, 42).starts_with(&prefix));
    }

    #[test]
    fn state_keys_differ() {
        assert_ne!(raft_state_key(7), apply_state_key(7));
        assert_ne!(raft_state_key(7), cell_state_key(7));
    }
}
