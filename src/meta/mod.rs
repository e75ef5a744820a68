//! Cell metadata: descriptors, epochs, peers, and durable local states.
//!
//! A cell is a contiguous key range replicated by a consensus group; a peer
//! is one replica of it. The durable records here are what the meta engine
//! persists per cell: the raft local state (hard state + last log index),
//! the apply state (how far user-data application has progressed) and the
//! cell local state (peer lifecycle + descriptor).

pub mod keys;

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, Result};

/// Log index and term an initialized cell starts from. The bootstrap and
/// split paths seed new cells at this point so that the first appended
/// entry is distinguishable from "no log at all".
pub const RAFT_INIT_LOG_INDEX: u64 = 5;

/// Term paired with [`RAFT_INIT_LOG_INDEX`].
pub const RAFT_INIT_LOG_TERM: u64 = 5;

/// Monotonic counters identifying a cell's shape and membership generation.
///
/// `version` advances on range changes (split), `conf_version` on
/// membership changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellEpoch {
    pub conf_version: u64,
    pub version: u64,
}

/// One replica of a cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: u64,
    pub store_id: u64,
}

impl Peer {
    pub fn new(id: u64, store_id: u64) -> Self {
        Self { id, store_id }
    }
}

/// A contiguous key range and its replica set.
///
/// `end_key` is exclusive; an empty `end_key` means "to the end of the
/// keyspace". A cell with an empty peer set is uninitialized: it exists
/// only because a raft message for its group arrived before its snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub id: u64,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub epoch: CellEpoch,
    pub peers: Vec<Peer>,
}

impl Cell {
    /// Find the peer hosted on the given store.
    pub fn find_store_peer(&self, store_id: u64) -> Option<Peer> {
        self.peers.iter().copied().find(|p| p.store_id == store_id)
    }

    /// Find a peer by its id.
    pub fn find_peer(&self, peer_id: u64) -> Option<Peer> {
        self.peers.iter().copied().find(|p| p.id == peer_id)
    }

    /// Check if the key falls inside this cell's range.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.start_key.as_slice() && (self.end_key.is_empty() || key < self.end_key.as_slice())
    }
}

/// Lifecycle of a peer on this store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    /// Serving normally.
    Normal,
    /// A received snapshot is being installed into the data engine.
    Applying,
    /// The peer was destroyed; the marker guards against resurrection.
    Tombstone,
}

/// Durable record pairing a peer lifecycle state with the cell descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellLocalState {
    pub state: PeerState,
    pub cell: Cell,
}

/// The persisted portion of the consensus hard state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardStateRecord {
    pub term: u64,
    pub vote: u64,
    pub commit: u64,
}

impl HardStateRecord {
    pub fn is_empty(&self) -> bool {
        self.term == 0 && self.vote == 0 && self.commit == 0
    }
}

impl From<&raft::eraftpb::HardState> for HardStateRecord {
    fn from(hs: &raft::eraftpb::HardState) -> Self {
        Self {
            term: hs.term,
            vote: hs.vote,
            commit: hs.commit,
        }
    }
}

impl From<HardStateRecord> for raft::eraftpb::HardState {
    fn from(rec: HardStateRecord) -> Self {
        let mut hs = raft::eraftpb::HardState::default();
        hs.term = rec.term;
        hs.vote = rec.vote;
        hs.commit = rec.commit;
        hs
    }
}

/// Durable raft-local state: hard state plus the last log index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftLocalState {
    pub hard_state: HardStateRecord,
    pub last_index: u64,
}

/// The `(index, term)` below which log entries have been compacted away.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncatedState {
    pub index: u64,
    pub term: u64,
}

/// Durable record of apply progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftApplyState {
    pub applied_index: u64,
    pub applied_index_term: u64,
    pub truncated: TruncatedState,
}

/// Store identity, written once at bootstrap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreIdent {
    pub cluster_id: u64,
    pub store_id: u64,
}

/// Encode a durable record with the crate's meta codec.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(Error::corrupt)
}

/// Decode a durable record; failures are corruption, not I/O.
pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(Error::corrupt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(start: &[u8], end: &[u8]) -> Cell {
        Cell {
            id: 1,
            start_key: start.to_vec(),
            end_key: end.to_vec(),
            epoch: CellEpoch::default(),
            peers: vec![Peer::new(1, 1)],
        }
    }

    #[test]
    fn contains_key_respects_bounds() {
        let c = cell(b"b", b"d");
        assert!(!c.contains_key(b"a"));
        assert!(c.contains_key(b"b"));
        assert!(c.contains_key(b"c"));
        assert!(!c.contains_key(b"d"));
    }

    #[test]
    fn empty_end_key_is_unbounded() {
        let c = cell(b"b", b"");
        assert!(c.contains_key(b"zzzz"));
        assert!(!c.contains_key(b"a"));
    }

    #[test]
    fn local_state_round_trips() {
        let state = CellLocalState {
            state: PeerState::Applying,
            cell: cell(b"a", b"z"),
        };
        let bytes = encode(&state).unwrap();
        let back: CellLocalState = decode(&bytes).unwrap();
        assert_eq!(state, back);
    }
}
