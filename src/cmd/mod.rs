//! Command model: request/response envelopes and pending proposals.
//!
//! Commands enter the core already routed to a cell. The envelope carries
//! the proposer's view of the cell epoch so stale requests can be rejected
//! before they reach consensus, and a uuid so the asynchronous apply
//! pipeline can resolve the matching pending proposal. Responses travel
//! back over a per-command channel.

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::error::Error;
use crate::meta::{Cell, CellEpoch, Peer, TruncatedState};

/// A single data operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Get { key: Vec<u8> },
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Result of a single data operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Get { value: Option<Vec<u8>> },
    Put,
    Delete,
}

/// Membership change kind carried by a change-peer admin command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfChangeKind {
    AddNode,
    RemoveNode,
}

impl From<ConfChangeKind> for raft::eraftpb::ConfChangeType {
    fn from(kind: ConfChangeKind) -> Self {
        match kind {
            ConfChangeKind::AddNode => raft::eraftpb::ConfChangeType::AddNode,
            ConfChangeKind::RemoveNode => raft::eraftpb::ConfChangeType::RemoveNode,
        }
    }
}

/// Administrative commands replicated through the cell's log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AdminRequest {
    /// Add or remove one peer.
    ChangePeer {
        change_type: ConfChangeKind,
        peer: Peer,
    },
    /// Split the cell at `split_key`. The right half takes `new_cell_id`
    /// and its peers take `new_peer_ids`, one per existing peer.
    Split {
        new_cell_id: u64,
        split_key: Vec<u8>,
        new_peer_ids: Vec<u64>,
    },
    /// Advance the truncated state; entries at or below `compact_index`
    /// become unavailable.
    CompactLog { compact_index: u64, compact_term: u64 },
}

/// Result of an applied admin command, reported back to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AdminResponse {
    ChangePeer { cell: Cell },
    Split { left: Cell, right: Cell },
    CompactLog { state: TruncatedState },
}

/// Request envelope for one cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestHeader {
    pub cell_id: u64,
    pub peer: Peer,
    pub epoch: CellEpoch,
    /// Proposal identifier, matched against pending proposals at apply time.
    pub uuid: [u8; 16],
    /// True for linearizable reads served through the read-index machinery.
    pub read_quorum: bool,
}

/// A routed command: either a batch of data requests or one admin request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdRequest {
    pub header: RequestHeader,
    pub requests: Vec<Request>,
    pub admin: Option<AdminRequest>,
}

impl CmdRequest {
    pub fn uuid(&self) -> Uuid {
        Uuid::from_bytes(self.header.uuid)
    }

    pub fn is_admin(&self) -> bool {
        self.admin.is_some()
    }

    pub fn is_change_peer(&self) -> bool {
        matches!(self.admin, Some(AdminRequest::ChangePeer { .. }))
    }

    pub fn is_read(&self) -> bool {
        !self.is_admin() && self.requests.iter().all(|r| matches!(r, Request::Get { .. }))
    }
}

/// Response envelope.
#[derive(Debug)]
pub struct CmdResponse {
    pub uuid: Uuid,
    pub term: u64,
    pub error: Option<Error>,
    pub responses: Vec<Response>,
    pub admin: Option<AdminResponse>,
}

impl CmdResponse {
    pub fn ok(uuid: Uuid, term: u64, responses: Vec<Response>) -> Self {
        Self {
            uuid,
            term,
            error: None,
            responses,
            admin: None,
        }
    }

    pub fn admin(uuid: Uuid, term: u64, admin: AdminResponse) -> Self {
        Self {
            uuid,
            term,
            error: None,
            responses: Vec::new(),
            admin: Some(admin),
        }
    }

    pub fn error(uuid: Uuid, term: u64, error: Error) -> Self {
        Self {
            uuid,
            term,
            error: Some(error),
            responses: Vec::new(),
            admin: None,
        }
    }

    /// Stale-command response for a proposal that lost its term, lost its
    /// leader, or was superseded.
    pub fn stale(uuid: Uuid, term: u64) -> Self {
        Self::error(uuid, term, Error::StaleCommand { term })
    }

    pub fn cell_not_found(uuid: Uuid, term: u64, cell_id: u64) -> Self {
        Self::error(uuid, term, Error::CellNotFound { cell_id })
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Channel end a command's response is delivered on.
pub type Notifier = Sender<CmdResponse>;

/// A command in flight: the routed request plus its response channel.
#[derive(Debug)]
pub struct Cmd {
    pub request: CmdRequest,
    notifier: Notifier,
}

impl Cmd {
    pub fn new(request: CmdRequest, notifier: Notifier) -> Self {
        Self { request, notifier }
    }

    pub fn uuid(&self) -> Uuid {
        self.request.uuid()
    }

    /// Deliver the response. A dropped receiver means the client gave up
    /// waiting; that is not an error here.
    pub fn respond(self, resp: CmdResponse) {
        let _ = self.notifier.send(resp);
    }

    pub fn respond_stale(self, term: u64) {
        let uuid = self.uuid();
        self.respond(CmdResponse::stale(uuid, term));
    }

    pub fn respond_cell_not_found(self, cell_id: u64, term: u64) {
        let uuid = self.uuid();
        self.respond(CmdResponse::cell_not_found(uuid, term, cell_id));
    }
}

/// Build a request header for a fresh proposal.
pub fn new_header(cell_id: u64, peer: Peer, epoch: CellEpoch) -> RequestHeader {
    RequestHeader {
        cell_id,
        peer,
        epoch,
        uuid: *Uuid::new_v4().as_bytes(),
        read_quorum: false,
    }
}
