//! Placement-driver client boundary.
//!
//! The placement driver allocates cell and peer ids and receives
//! heartbeats; it is an external coordinator reached over RPC, so only its
//! contract lives here. [`LoopbackPd`] is an in-process stand-in used by
//! tests and bootstrap tooling.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::meta::{Cell, Peer};

/// Answer to an ask-split request: ids for the right half.
#[derive(Debug, Clone)]
pub struct AskSplitResponse {
    pub new_cell_id: u64,
    pub new_peer_ids: Vec<u64>,
}

/// The placement-driver RPC surface this core consumes.
pub trait PdClient: Send + Sync {
    /// Allocate a cell id and one peer id per existing replica for a
    /// split of `cell`.
    fn ask_split(&self, cell: &Cell) -> anyhow::Result<AskSplitResponse>;

    /// Report a cell and its current leader.
    fn cell_heartbeat(&self, cell: Cell, leader: Peer) -> anyhow::Result<()>;

    /// Report both halves of a finished split.
    fn report_split(&self, left: Cell, right: Cell) -> anyhow::Result<()>;
}

/// In-process id allocator recording every call it receives.
#[derive(Default)]
pub struct LoopbackPd {
    next_id: AtomicU64,
    heartbeats: Mutex<Vec<(Cell, Peer)>>,
    splits: Mutex<Vec<(Cell, Cell)>>,
}

impl LoopbackPd {
    pub fn new(first_id: u64) -> Self {
        Self {
            next_id: AtomicU64::new(first_id),
            heartbeats: Mutex::new(Vec::new()),
            splits: Mutex::new(Vec::new()),
        }
    }

    pub fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Cells heartbeated so far, most recent last.
    pub fn heartbeats(&self) -> Vec<(Cell, Peer)> {
        self.heartbeats.lock().clone()
    }

    /// Splits reported so far.
    pub fn reported_splits(&self) -> Vec<(Cell, Cell)> {
        self.splits.lock().clone()
    }
}

impl PdClient for LoopbackPd {
    fn ask_split(&self, cell: &Cell) -> anyhow::Result<AskSplitResponse> {
        let new_cell_id = self.alloc_id();
        let new_peer_ids = cell.peers.iter().map(|_| self.alloc_id()).collect();
        Ok(AskSplitResponse {
            new_cell_id,
            new_peer_ids,
        })
    }

    fn cell_heartbeat(&self, cell: Cell, leader: Peer) -> anyhow::Result<()> {
        self.heartbeats.lock().push((cell, leader));
        Ok(())
    }

    fn report_split(&self, left: Cell, right: Cell) -> anyhow::Result<()> {
        self.splits.lock().push((left, right));
        Ok(())
    }
}
