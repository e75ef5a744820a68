//! Pending linearizable reads.
//!
//! Reads proposed through the read-index machinery wait here until the
//! consensus library emits their read state. The ready count tracks read
//! states that arrived while the peer could not yet serve reads (its
//! applied term lagging its current term); those reads stay queued and are
//! drained after the next apply batch completes, or failed as stale when
//! leadership is lost.

use std::sync::atomic::{AtomicI64, Ordering};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::cmd::Cmd;

/// A bounded concurrent FIFO of pending read commands plus an atomic
/// ready count. The proposal path pushes; only the cell's raft worker
/// pops.
pub struct ReadIndexQueue {
    cell_id: u64,
    tx: Sender<Cmd>,
    rx: Receiver<Cmd>,
    ready_cnt: AtomicI64,
}

impl ReadIndexQueue {
    pub fn new(cell_id: u64, capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            cell_id,
            tx,
            rx,
            ready_cnt: AtomicI64::new(0),
        }
    }

    /// Queue a read. Returns the command on a full queue so the caller
    /// can fail it back to the client.
    pub fn push(&self, cmd: Cmd) -> Result<(), Cmd> {
        match self.tx.try_send(cmd) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(cmd)) | Err(TrySendError::Disconnected(cmd)) => Err(cmd),
        }
    }

    /// Pop the head pending read, if any.
    pub fn pop(&self) -> Option<Cmd> {
        self.rx.try_recv().ok()
    }

    pub fn incr_ready(&self) -> i64 {
        self.ready_cnt.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn decr_ready(&self) -> i64 {
        self.ready_cnt.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn reset_ready(&self) {
        self.ready_cnt.store(0, Ordering::SeqCst);
    }

    pub fn get_ready(&self) -> i64 {
        self.ready_cnt.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn cell_id(&self) -> u64 {
        self.cell_id
    }
}
