//! Asynchronous application of committed entries.
//!
//! Each cell has one `ApplyDelegate` living in the shared delegate map.
//! The raft worker enqueues batches of committed entries; an apply worker
//! executes them against the data engine in strict log order and reports
//! an [`AsyncApplyResult`] back to the store loop. Pending proposals are
//! resolved here, matched by uuid and term; anything that can no longer
//! apply is answered as stale.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use raft::eraftpb::{ConfChange, Entry, EntryType};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::cell::storage::write_initial_cell_state;
use crate::cmd::{
    AdminRequest, AdminResponse, Cmd, CmdRequest, CmdResponse, Request, Response,
};
use crate::core::error::Error;
use crate::engine::KvEngine;
use crate::meta::keys::cell_state_key;
use crate::meta::{decode, encode, Cell, CellLocalState, Peer, PeerState, RaftApplyState, TruncatedState};

/// Delegates shared between the raft workers (proposal registration) and
/// the apply workers (entry execution).
pub type DelegateMap = Arc<Mutex<HashMap<u64, ApplyDelegate>>>;

pub fn new_delegate_map() -> DelegateMap {
    Arc::new(Mutex::new(HashMap::new()))
}

/// A registered proposal awaiting its entry.
struct PendingCmd {
    term: u64,
    cmd: Cmd,
}

/// Write amplification and size drift produced by one apply batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyMetrics {
    pub written_bytes: u64,
    pub written_keys: u64,
    /// Net size change of the cell's range; feeds the split check trigger.
    pub size_diff_hint: i64,
    pub delete_keys_hint: u64,
}

/// Side effect of an applied admin command, demultiplexed by the store.
#[derive(Debug, Clone)]
pub enum ExecResult {
    ChangePeer {
        change: ConfChange,
        peer: Peer,
        cell: Cell,
    },
    SplitCell {
        left: Cell,
        right: Cell,
    },
    CompactLog {
        state: TruncatedState,
        prev_first_index: u64,
    },
}

/// Completion record of one apply batch.
#[derive(Debug, Clone)]
pub struct AsyncApplyResult {
    pub cell_id: u64,
    pub apply_state: RaftApplyState,
    pub applied_index_term: u64,
    pub metrics: ApplyMetrics,
    pub exec_result: Option<ExecResult>,
}

impl AsyncApplyResult {
    pub fn has_split_exec_result(&self) -> bool {
        matches!(self.exec_result, Some(ExecResult::SplitCell { .. }))
    }
}

/// The per-cell mutator of user data.
pub struct ApplyDelegate {
    pub cell: Cell,
    meta_engine: Arc<dyn KvEngine>,
    data_engine: Arc<dyn KvEngine>,
    apply_state: RaftApplyState,
    applied_index_term: u64,
    term: u64,
    pending_cmds: VecDeque<PendingCmd>,
    pending_change_peer: Option<PendingCmd>,
    tag: String,
}

impl ApplyDelegate {
    pub fn new(
        meta_engine: Arc<dyn KvEngine>,
        data_engine: Arc<dyn KvEngine>,
        cell: Cell,
        apply_state: RaftApplyState,
        applied_index_term: u64,
    ) -> Self {
        let tag = format!("[cell {}]", cell.id);
        Self {
            cell,
            meta_engine,
            data_engine,
            apply_state,
            applied_index_term,
            term: 0,
            pending_cmds: VecDeque::new(),
            pending_change_peer: None,
            tag,
        }
    }

    pub fn apply_state(&self) -> RaftApplyState {
        self.apply_state
    }

    /// Register a normal proposal.
    pub fn append_pending_cmd(&mut self, term: u64, cmd: Cmd) {
        self.pending_cmds.push_back(PendingCmd { term, cmd });
    }

    /// Register a change-peer proposal. At most one is pending per cell;
    /// the superseded proposal is answered as stale.
    pub fn set_pending_change_peer(&mut self, term: u64, cmd: Cmd) {
        if let Some(old) = self.pending_change_peer.take() {
            old.cmd.respond_stale(old.term);
        }
        self.pending_change_peer = Some(PendingCmd { term, cmd });
    }

    pub fn has_pending_change_peer(&self) -> bool {
        self.pending_change_peer.is_some()
    }

    /// Apply one batch of committed entries at `term`.
    pub fn apply_committed_entries(&mut self, term: u64, entries: Vec<Entry>) -> AsyncApplyResult {
        self.term = term;
        let mut metrics = ApplyMetrics::default();
        let mut exec_result = None;

        for entry in entries {
            debug_assert!(
                entry.index == self.apply_state.applied_index + 1,
                "{} apply gap: entry {} after applied {}",
                self.tag,
                entry.index,
                self.apply_state.applied_index
            );

            let res = match entry.entry_type() {
                EntryType::EntryNormal => self.apply_normal(&entry, &mut metrics),
                EntryType::EntryConfChange => self.apply_conf_change_entry(&entry),
                EntryType::EntryConfChangeV2 => {
                    warn!(target: "raftstore", cell = self.cell.id, "joint confchange unsupported, skipping");
                    None
                }
            };

            self.apply_state.applied_index = entry.index;
            self.applied_index_term = entry.term;
            if res.is_some() {
                exec_result = res;
            }
        }

        AsyncApplyResult {
            cell_id: self.cell.id,
            apply_state: self.apply_state,
            applied_index_term: self.applied_index_term,
            metrics,
            exec_result,
        }
    }

    fn apply_normal(&mut self, entry: &Entry, metrics: &mut ApplyMetrics) -> Option<ExecResult> {
        if entry.data.is_empty() {
            // A leader's no-op entry. Proposals from older terms can
            // never apply past it.
            self.drop_stale_pending();
            return None;
        }

        let req: CmdRequest = match decode(&entry.data) {
            Ok(req) => req,
            Err(e) => {
                error!(
                    target: "raftstore",
                    cell = self.cell.id,
                    index = entry.index,
                    error = %e,
                    "undecodable log entry"
                );
                panic!("{} undecodable log entry {}", self.tag, entry.index);
            }
        };

        match &req.admin {
            Some(admin) => self.exec_admin(&req, admin.clone()),
            None => {
                self.exec_data(&req, metrics);
                None
            }
        }
    }

    fn apply_conf_change_entry(&mut self, entry: &Entry) -> Option<ExecResult> {
        use prost::Message as _;
        let change = match ConfChange::decode(&entry.data[..]) {
            Ok(change) => change,
            Err(e) => {
                error!(
                    target: "raftstore",
                    cell = self.cell.id,
                    index = entry.index,
                    error = %e,
                    "undecodable confchange entry"
                );
                panic!("{} undecodable confchange entry {}", self.tag, entry.index);
            }
        };

        if change.context.is_empty() {
            // A confchange the consensus library refused; hand it back
            // with a zero node id so the raft state machine stays in sync.
            let mut noop = change;
            noop.node_id = 0;
            return Some(ExecResult::ChangePeer {
                change: noop,
                peer: Peer::default(),
                cell: self.cell.clone(),
            });
        }

        let req: CmdRequest = match decode(&change.context) {
            Ok(req) => req,
            Err(e) => {
                error!(
                    target: "raftstore",
                    cell = self.cell.id,
                    error = %e,
                    "undecodable confchange context"
                );
                panic!("{} undecodable confchange context", self.tag);
            }
        };
        let admin = req.admin.clone().expect("confchange carries admin request");
        self.exec_admin(&req, admin)
    }

    fn exec_data(&mut self, req: &CmdRequest, metrics: &mut ApplyMetrics) {
        let mut responses = Vec::with_capacity(req.requests.len());
        let mut failure: Option<Error> = None;

        for request in &req.requests {
            match self.exec_request(request, metrics) {
                Ok(resp) => responses.push(resp),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            // Data-engine write failures at apply time leave replicas
            // diverged; durability is a precondition.
            error!(target: "raftstore", cell = self.cell.id, error = %e, "apply write failed");
            panic!("{} apply write failed: {}", self.tag, e);
        }

        if let Some(cmd) = self.find_pending(req.uuid(), self.term) {
            let uuid = cmd.uuid();
            cmd.respond(CmdResponse::ok(uuid, self.term, responses));
        }
    }

    fn exec_request(
        &mut self,
        request: &Request,
        metrics: &mut ApplyMetrics,
    ) -> crate::core::error::Result<Response> {
        match request {
            Request::Get { key } => {
                let value = self.data_engine.get(key)?;
                Ok(Response::Get { value })
            }
            Request::Put { key, value } => {
                self.data_engine.set(key, value)?;
                let written = (key.len() + value.len()) as u64;
                metrics.written_bytes += written;
                metrics.written_keys += 1;
                metrics.size_diff_hint += written as i64;
                Ok(Response::Put)
            }
            Request::Delete { key } => {
                self.data_engine.delete(key)?;
                metrics.written_keys += 1;
                metrics.delete_keys_hint += 1;
                metrics.size_diff_hint -= key.len() as i64;
                Ok(Response::Delete)
            }
        }
    }

    fn exec_admin(&mut self, req: &CmdRequest, admin: AdminRequest) -> Option<ExecResult> {
        match admin {
            AdminRequest::ChangePeer { change_type, peer } => {
                self.exec_change_peer(req, change_type, peer)
            }
            AdminRequest::Split {
                new_cell_id,
                split_key,
                new_peer_ids,
            } => self.exec_split(req, new_cell_id, split_key, new_peer_ids),
            AdminRequest::CompactLog {
                compact_index,
                compact_term,
            } => self.exec_compact_log(req, compact_index, compact_term),
        }
    }

    fn exec_change_peer(
        &mut self,
        req: &CmdRequest,
        change_type: crate::cmd::ConfChangeKind,
        peer: Peer,
    ) -> Option<ExecResult> {
        let mut cell = self.cell.clone();
        cell.epoch.conf_version += 1;
        match change_type {
            crate::cmd::ConfChangeKind::AddNode => {
                if cell.find_peer(peer.id).is_none() {
                    cell.peers.push(peer);
                }
            }
            crate::cmd::ConfChangeKind::RemoveNode => {
                cell.peers.retain(|p| p.id != peer.id);
            }
        }

        if let Err(e) = self.persist_cell(&cell) {
            error!(target: "raftstore", cell = self.cell.id, error = %e, "persist cell failed");
            panic!("{} persist cell failed: {}", self.tag, e);
        }
        self.cell = cell.clone();

        let mut change = ConfChange::default();
        change.set_change_type(change_type.into());
        change.node_id = peer.id;

        self.respond_change_peer(req, &cell);
        Some(ExecResult::ChangePeer { change, peer, cell })
    }

    fn respond_change_peer(&mut self, req: &CmdRequest, cell: &Cell) {
        let Some(pending) = self.pending_change_peer.take() else {
            return;
        };
        if pending.cmd.uuid() != req.uuid() || pending.term != self.term {
            pending.cmd.respond_stale(pending.term);
            return;
        }
        let uuid = pending.cmd.uuid();
        pending.cmd.respond(CmdResponse::admin(
            uuid,
            self.term,
            AdminResponse::ChangePeer { cell: cell.clone() },
        ));
    }

    fn exec_split(
        &mut self,
        req: &CmdRequest,
        new_cell_id: u64,
        split_key: Vec<u8>,
        new_peer_ids: Vec<u64>,
    ) -> Option<ExecResult> {
        if !self.cell.contains_key(&split_key) || split_key == self.cell.start_key {
            warn!(target: "raftstore", cell = self.cell.id, "split key out of range, skipping split");
            if let Some(cmd) = self.find_pending(req.uuid(), self.term) {
                let uuid = cmd.uuid();
                cmd.respond(CmdResponse::error(
                    uuid,
                    self.term,
                    Error::corrupt("split key out of range"),
                ));
            }
            return None;
        }
        if new_peer_ids.len() != self.cell.peers.len() {
            warn!(target: "raftstore", cell = self.cell.id, "split peer id count mismatch, skipping split");
            return None;
        }

        let mut left = self.cell.clone();
        left.end_key = split_key.clone();
        left.epoch.version += 1;

        let mut right = self.cell.clone();
        right.id = new_cell_id;
        right.start_key = split_key;
        right.epoch.version += 1;
        for (peer, new_id) in right.peers.iter_mut().zip(new_peer_ids) {
            peer.id = new_id;
        }

        let persisted = self
            .persist_cell(&left)
            .and_then(|_| write_initial_cell_state(self.meta_engine.as_ref(), &right));
        if let Err(e) = persisted {
            error!(target: "raftstore", cell = self.cell.id, error = %e, "persist split failed");
            panic!("{} persist split failed: {}", self.tag, e);
        }
        self.cell = left.clone();

        if let Some(cmd) = self.find_pending(req.uuid(), self.term) {
            let uuid = cmd.uuid();
            cmd.respond(CmdResponse::admin(
                uuid,
                self.term,
                AdminResponse::Split {
                    left: left.clone(),
                    right: right.clone(),
                },
            ));
        }
        Some(ExecResult::SplitCell { left, right })
    }

    fn exec_compact_log(
        &mut self,
        req: &CmdRequest,
        compact_index: u64,
        compact_term: u64,
    ) -> Option<ExecResult> {
        let first_index = self.apply_state.truncated.index + 1;
        if compact_index <= self.apply_state.truncated.index {
            debug!(target: "raftstore", cell = self.cell.id, compact_index, "compact index already truncated");
            if let Some(cmd) = self.find_pending(req.uuid(), self.term) {
                cmd.respond_stale(self.term);
            }
            return None;
        }

        let state = TruncatedState {
            index: compact_index,
            term: compact_term,
        };
        self.apply_state.truncated = state;

        if let Some(cmd) = self.find_pending(req.uuid(), self.term) {
            let uuid = cmd.uuid();
            cmd.respond(CmdResponse::admin(
                uuid,
                self.term,
                AdminResponse::CompactLog { state },
            ));
        }
        Some(ExecResult::CompactLog {
            state,
            prev_first_index: first_index,
        })
    }

    fn persist_cell(&self, cell: &Cell) -> crate::core::error::Result<()> {
        let record = CellLocalState {
            state: PeerState::Normal,
            cell: cell.clone(),
        };
        self.meta_engine
            .set(&cell_state_key(cell.id), &encode(&record)?)
    }

    /// Pop pending proposals up to and including the one matching `uuid`.
    /// Skipped proposals were superseded by another leader's log and are
    /// answered as stale; a uuid match with the wrong term is stale too.
    fn find_pending(&mut self, uuid: Uuid, term: u64) -> Option<Cmd> {
        while let Some(head) = self.pending_cmds.pop_front() {
            if head.cmd.uuid() == uuid {
                if head.term == term {
                    return Some(head.cmd);
                }
                head.cmd.respond_stale(term);
                return None;
            }
            head.cmd.respond_stale(term);
        }
        None
    }

    /// Answer proposals from terms before the current one as stale.
    fn drop_stale_pending(&mut self) {
        let term = self.term;
        while let Some(head) = self.pending_cmds.front() {
            if head.term >= term {
                break;
            }
            let head = self.pending_cmds.pop_front().expect("checked front");
            head.cmd.respond_stale(term);
        }
        if let Some(pending) = &self.pending_change_peer {
            if pending.term < term {
                let pending = self.pending_change_peer.take().expect("checked pending");
                pending.cmd.respond_stale(term);
            }
        }
    }

    /// Fail everything still pending; the cell is going away.
    pub fn destroy(&mut self) {
        let term = self.term;
        while let Some(head) = self.pending_cmds.pop_front() {
            head.cmd.respond_stale(term);
        }
        if let Some(pending) = self.pending_change_peer.take() {
            pending.cmd.respond_stale(term);
        }
    }
}

// ============================================================================
// Apply worker
// ============================================================================

/// A batch of committed entries bound for one cell's delegate.
pub enum ApplyTask {
    Apply {
        cell_id: u64,
        term: u64,
        entries: Vec<Entry>,
    },
}

/// Executes apply tasks against the shared delegate map. Cells are pinned
/// to one worker by id, so batches for a cell never interleave.
pub struct ApplyRunner {
    delegates: DelegateMap,
    notifier: Sender<AsyncApplyResult>,
}

impl ApplyRunner {
    pub fn new(delegates: DelegateMap, notifier: Sender<AsyncApplyResult>) -> Self {
        Self {
            delegates,
            notifier,
        }
    }

    pub fn run(&self, task: ApplyTask) {
        match task {
            ApplyTask::Apply {
                cell_id,
                term,
                entries,
            } => {
                let mut delegates = self.delegates.lock();
                let Some(delegate) = delegates.get_mut(&cell_id) else {
                    // The cell was destroyed after the batch was enqueued.
                    debug!(target: "raftstore", cell = cell_id, "apply task for missing delegate dropped");
                    return;
                };
                let result = delegate.apply_committed_entries(term, entries);
                drop(delegates);
                let _ = self.notifier.send(result);
            }
        }
    }
}
