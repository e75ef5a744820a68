//! Common test utilities.
//!
//! Shared fixtures for the integration tests: in-memory engines, cell
//! descriptors, storage and replica harnesses with hand-held worker
//! channels so tests can run background tasks deterministically.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver};
use parking_lot::RwLock;
use raft::eraftpb::Entry;

use cellstore::apply::{new_delegate_map, ApplyTask, DelegateMap};
use cellstore::cell::replicate::{PeerContext, PeerReplicate};
use cellstore::cell::storage::{InvokeContext, PeerStorage};
use cellstore::cmd::{Cmd, CmdRequest, CmdResponse, Notifier, Request, RequestHeader};
use cellstore::config::StoreConfig;
use cellstore::engine::MemEngine;
use cellstore::key_range::KeyRangeIndex;
use cellstore::meta::{Cell, CellEpoch, Peer};
use cellstore::worker::pd::PdTask;
use cellstore::worker::snap::SnapTask;
use uuid::Uuid;

/// Install a tracing subscriber honoring `RUST_LOG`; safe to call from
/// every test.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Build a cell descriptor from `(peer_id, store_id)` pairs.
pub fn new_cell(id: u64, start: &[u8], end: &[u8], peers: &[(u64, u64)]) -> Cell {
    Cell {
        id,
        start_key: start.to_vec(),
        end_key: end.to_vec(),
        epoch: CellEpoch {
            conf_version: 1,
            version: 1,
        },
        peers: peers.iter().map(|&(id, store)| Peer::new(id, store)).collect(),
    }
}

/// Build a log entry carrying raw payload bytes.
pub fn new_entry(index: u64, term: u64, data: &[u8]) -> Entry {
    let mut entry = Entry::default();
    entry.index = index;
    entry.term = term;
    entry.data = data.to_vec().into();
    entry
}

/// A data command envelope for `cell`, returning the response receiver.
pub fn new_data_cmd(
    cell: &Cell,
    store_id: u64,
    requests: Vec<Request>,
    read_quorum: bool,
) -> (Cmd, Receiver<CmdResponse>, Uuid) {
    let peer = cell.find_store_peer(store_id).unwrap_or_default();
    let header = RequestHeader {
        cell_id: cell.id,
        peer,
        epoch: cell.epoch,
        uuid: *Uuid::new_v4().as_bytes(),
        read_quorum,
    };
    let uuid = Uuid::from_bytes(header.uuid);
    let request = CmdRequest {
        header,
        requests,
        admin: None,
    };
    let (tx, rx): (Notifier, Receiver<CmdResponse>) = unbounded();
    (Cmd::new(request, tx), rx, uuid)
}

/// Engines plus the hand-held ends of every worker channel a storage or
/// replica needs.
pub struct Harness {
    pub meta_engine: Arc<MemEngine>,
    pub data_engine: Arc<MemEngine>,
    pub delegates: DelegateMap,
    pub peer_cache: Arc<RwLock<HashMap<u64, Peer>>>,
    pub key_ranges: Arc<RwLock<KeyRangeIndex>>,
    pub apply_rx: Receiver<ApplyTask>,
    pub snap_rx: Receiver<SnapTask>,
    pub pd_rx: Receiver<PdTask>,
    pub ctx: PeerContext,
}

impl Harness {
    pub fn new(store_id: u64) -> Self {
        Self::with_config(store_id, StoreConfig::default())
    }

    pub fn with_config(store_id: u64, cfg: StoreConfig) -> Self {
        let meta_engine = MemEngine::new();
        let data_engine = MemEngine::new();
        let delegates = new_delegate_map();
        let peer_cache = Arc::new(RwLock::new(HashMap::new()));
        let key_ranges = Arc::new(RwLock::new(KeyRangeIndex::new()));
        let (apply_tx, apply_rx) = unbounded();
        let (snap_tx, snap_rx) = unbounded();
        let (pd_tx, pd_rx) = unbounded();

        let ctx = PeerContext {
            store_id,
            cfg: Arc::new(cfg),
            meta_engine: meta_engine.clone(),
            data_engine: data_engine.clone(),
            delegates: delegates.clone(),
            apply_scheds: vec![apply_tx],
            snap_sched: snap_tx,
            pd_sched: pd_tx,
            peer_cache: peer_cache.clone(),
            key_ranges: key_ranges.clone(),
        };

        Self {
            meta_engine,
            data_engine,
            delegates,
            peer_cache,
            key_ranges,
            apply_rx,
            snap_rx,
            pd_rx,
            ctx,
        }
    }

    /// Open the durable state of `cell` as a standalone storage.
    pub fn storage(&self, cell: Cell) -> PeerStorage {
        PeerStorage::new(
            self.meta_engine.clone(),
            self.data_engine.clone(),
            cell,
            self.ctx.snap_sched.clone(),
            self.ctx.cfg.max_snap_tries,
        )
        .expect("storage open failed")
    }

    /// Create the replica of an already-seeded cell.
    pub fn replicate(&self, cell: Cell) -> PeerReplicate {
        PeerReplicate::create(&self.ctx, cell).expect("replica creation failed")
    }
}

/// Run the full persistence dance for a batch of appended entries, the
/// way one ready batch would.
pub fn append_entries(ps: &mut PeerStorage, entries: &[Entry]) {
    let mut ctx = InvokeContext::new(ps);
    ps.append_entries(&mut ctx, entries).expect("append failed");
    ps.persist(&ctx).expect("persist failed");
    ps.do_apply_snap(&mut ctx).expect("context install failed");
}

/// Poll `cond` until it holds or `timeout` elapses.
#[track_caller]
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("condition not met within {timeout:?}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_cell_builds_peers() {
        let cell = new_cell(1, b"a", b"z", &[(10, 1), (11, 2)]);
        assert_eq!(cell.peers.len(), 2);
        assert_eq!(cell.find_store_peer(2), Some(Peer::new(11, 2)));
    }

    #[test]
    fn new_entry_carries_payload() {
        let entry = new_entry(7, 3, b"payload");
        assert_eq!(entry.index, 7);
        assert_eq!(entry.term, 3);
        assert_eq!(&entry.data[..], b"payload");
    }
}
