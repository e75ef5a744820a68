//! Outbound raft message boundary.
//!
//! The wire transport is an external collaborator; the core only needs a
//! seam to hand messages to. Delivery is at-most-once with no ordering
//! beyond what the consensus protocol itself tolerates.

use crossbeam_channel::{unbounded, Receiver, Sender};
use raft::eraftpb::Message;

use crate::core::error::{Error, Result};
use crate::meta::{CellEpoch, Peer};

/// A raft message addressed between two peers of one cell. The epoch lets
/// the receiving store reject messages from a stale cell generation.
#[derive(Debug, Clone)]
pub struct CellMessage {
    pub cell_id: u64,
    pub from: Peer,
    pub to: Peer,
    pub epoch: CellEpoch,
    pub message: Message,
}

/// Seam the per-cell drivers hand outbound messages to.
pub trait Transport: Send + Sync {
    fn send(&self, msg: CellMessage) -> Result<()>;
}

/// Channel-backed transport for tests and in-process wiring.
pub struct ChannelTransport {
    tx: Sender<CellMessage>,
}

impl ChannelTransport {
    pub fn new() -> (Self, Receiver<CellMessage>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, msg: CellMessage) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| Error::engine("transport channel closed"))
    }
}
