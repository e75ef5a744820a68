//! Per-cell driver.
//!
//! `PeerReplicate` owns the consensus node for one cell and bridges it to
//! everything else: proposals in, ready batches through persistence and
//! the transport, committed entries out to the apply pipeline, read
//! states to the pending-read queue, and admin effects back to the store.
//!
//! Every mutation of a cell happens on its raft worker; the only state
//! shared outward is behind the store's locked indexes and the delegate
//! map.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Sender;
use parking_lot::RwLock;
use raft::eraftpb::{ConfChange, Message};
use raft::{RawNode, StateRole};
use slog::o;
use tracing::{debug, error, info, warn};

use crate::cell::apply::{ApplyDelegate, ApplyTask, AsyncApplyResult, DelegateMap};
use crate::cell::read_queue::ReadIndexQueue;
use crate::cell::storage::{ApplySnapResult, InvokeContext, PeerStorage};
use crate::cmd::{AdminRequest, Cmd, CmdResponse, Request, Response};
use crate::core::config::StoreConfig;
use crate::core::error::{Error, Result};
use crate::engine::KvEngine;
use crate::meta::{encode, Cell, Peer, PeerState};
use crate::store::key_range::KeyRangeIndex;
use crate::transport::{CellMessage, Transport};
use crate::worker::pd::PdTask;
use crate::worker::snap::SnapTask;

/// The consensus library wants a logger; the core does its own logging.
fn silent_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, o!())
}

/// Shared peer address cache, keyed by peer id.
pub type PeerCache = Arc<RwLock<HashMap<u64, Peer>>>;

/// One cell's replica on this store.
pub struct PeerReplicate {
    pub cell_id: u64,
    pub peer: Peer,
    raw_node: RawNode<PeerStorage>,
    pub pending_reads: ReadIndexQueue,
    /// Last contact per peer, maintained on the leader.
    pub peer_heartbeats: HashMap<u64, Instant>,
    pub written_bytes: u64,
    pub written_keys: u64,
    pub size_diff_hint: i64,
    pub delete_keys_hint: u64,
    delegates: DelegateMap,
    apply_sched: Sender<ApplyTask>,
    snap_sched: Sender<SnapTask>,
    pd_sched: Sender<PdTask>,
    peer_cache: PeerCache,
    key_ranges: Arc<RwLock<KeyRangeIndex>>,
    data_engine: Arc<dyn KvEngine>,
    tag: String,
}

/// Everything a peer needs besides its cell: engines, schedulers and the
/// shared store indexes.
#[derive(Clone)]
pub struct PeerContext {
    pub store_id: u64,
    pub cfg: Arc<StoreConfig>,
    pub meta_engine: Arc<dyn KvEngine>,
    pub data_engine: Arc<dyn KvEngine>,
    pub delegates: DelegateMap,
    pub apply_scheds: Vec<Sender<ApplyTask>>,
    pub snap_sched: Sender<SnapTask>,
    pub pd_sched: Sender<PdTask>,
    pub peer_cache: PeerCache,
    pub key_ranges: Arc<RwLock<KeyRangeIndex>>,
}

impl PeerContext {
    /// The apply worker a cell is pinned to.
    pub fn apply_sched(&self, cell_id: u64) -> Sender<ApplyTask> {
        let idx = (cell_id as usize) % self.apply_scheds.len();
        self.apply_scheds[idx].clone()
    }
}

impl PeerReplicate {
    /// Create the replica of a known cell (bootstrap, split, or startup).
    pub fn create(ctx: &PeerContext, cell: Cell) -> Result<Self> {
        let Some(peer) = cell.find_store_peer(ctx.store_id) else {
            return Err(Error::corrupt(format!(
                "store {} holds no peer of cell {}",
                ctx.store_id, cell.id
            )));
        };
        Self::with_peer(ctx, cell, peer)
    }

    /// Create an uninitialized replica for a cell this store only knows
    /// from an incoming raft message; its state arrives later by snapshot.
    pub fn replicate(ctx: &PeerContext, cell_id: u64, peer_id: u64) -> Result<Self> {
        info!(
            target: "raftstore",
            cell = cell_id,
            peer = peer_id,
            "creating uninitialized replica"
        );
        let cell = Cell {
            id: cell_id,
            ..Default::default()
        };
        Self::with_peer(ctx, cell, Peer::new(peer_id, ctx.store_id))
    }

    fn with_peer(ctx: &PeerContext, cell: Cell, peer: Peer) -> Result<Self> {
        let cell_id = cell.id;
        let tag = format!("[cell {cell_id} peer {}]", peer.id);

        let storage = PeerStorage::new(
            ctx.meta_engine.clone(),
            ctx.data_engine.clone(),
            cell,
            ctx.snap_sched.clone(),
            ctx.cfg.max_snap_tries,
        )?;
        let applied = storage.applied_index();
        let delegate = ApplyDelegate::new(
            ctx.meta_engine.clone(),
            ctx.data_engine.clone(),
            storage.cell().clone(),
            storage.apply_state(),
            storage.applied_index_term(),
        );

        let raft_cfg = raft::Config {
            id: peer.id,
            election_tick: ctx.cfg.raft_election_ticks,
            heartbeat_tick: ctx.cfg.raft_heartbeat_ticks,
            max_size_per_msg: ctx.cfg.raft_max_size_per_msg,
            max_inflight_msgs: ctx.cfg.raft_max_inflight_msgs,
            applied,
            check_quorum: true,
            ..Default::default()
        };
        let raw_node = RawNode::new(&raft_cfg, storage, &silent_logger())
            .map_err(|e| Error::corrupt(format!("{tag} raft node init failed: {e}")))?;

        ctx.delegates.lock().insert(cell_id, delegate);

        Ok(Self {
            cell_id,
            peer,
            raw_node,
            pending_reads: ReadIndexQueue::new(cell_id, ctx.cfg.read_queue_capacity),
            peer_heartbeats: HashMap::new(),
            written_bytes: 0,
            written_keys: 0,
            size_diff_hint: 0,
            delete_keys_hint: 0,
            delegates: ctx.delegates.clone(),
            apply_sched: ctx.apply_sched(cell_id),
            snap_sched: ctx.snap_sched.clone(),
            pd_sched: ctx.pd_sched.clone(),
            peer_cache: ctx.peer_cache.clone(),
            key_ranges: ctx.key_ranges.clone(),
            data_engine: ctx.data_engine.clone(),
            tag,
        })
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn cell(&self) -> &Cell {
        self.raw_node.store().cell()
    }

    pub fn storage(&self) -> &PeerStorage {
        self.raw_node.store()
    }

    pub fn mut_storage(&mut self) -> &mut PeerStorage {
        self.raw_node.mut_store()
    }

    pub fn is_leader(&self) -> bool {
        self.raw_node.raft.state == StateRole::Leader
    }

    pub fn term(&self) -> u64 {
        self.raw_node.raft.term
    }

    pub fn leader_id(&self) -> u64 {
        self.raw_node.raft.leader_id
    }

    /// Linearizable reads are only safe once this leader has applied an
    /// entry of its own term; older values may still be in flight from
    /// the previous leader.
    pub fn ready_to_handle_read(&self) -> bool {
        self.storage().applied_index_term() == self.term()
    }

    // ------------------------------------------------------------------
    // Consensus plumbing
    // ------------------------------------------------------------------

    pub fn tick(&mut self) {
        self.raw_node.tick();
    }

    pub fn has_ready(&self) -> bool {
        self.raw_node.has_ready()
    }

    pub fn step(&mut self, msg: Message) -> Result<()> {
        self.raw_node
            .step(msg)
            .map_err(|e| Error::engine(format!("{} step failed: {e}", self.tag)))
    }

    /// Start an election; used by tests and single-replica bootstrap.
    pub fn campaign(&mut self) -> Result<()> {
        self.raw_node
            .campaign()
            .map_err(|e| Error::engine(format!("{} campaign failed: {e}", self.tag)))
    }

    // ------------------------------------------------------------------
    // Proposal submission
    // ------------------------------------------------------------------

    /// Submit a routed command: reject stale epochs, route linearizable
    /// reads through the read-index machinery, hand everything else to
    /// the consensus library and register the pending proposal.
    pub fn propose(&mut self, cmd: Cmd) {
        let term = self.term();
        let uuid = cmd.uuid();

        let req_epoch = cmd.request.header.epoch;
        let current = self.cell().epoch;
        if req_epoch.version < current.version || req_epoch.conf_version < current.conf_version {
            cmd.respond(CmdResponse::error(
                uuid,
                term,
                Error::StaleEpoch {
                    current_version: current.version,
                    request_version: req_epoch.version,
                },
            ));
            return;
        }

        if cmd.request.is_read() && cmd.request.header.read_quorum {
            self.propose_read_index(cmd);
            return;
        }

        let data = match encode(&cmd.request) {
            Ok(data) => data,
            Err(e) => {
                cmd.respond(CmdResponse::error(uuid, term, e));
                return;
            }
        };

        if cmd.request.is_change_peer() {
            let Some(AdminRequest::ChangePeer { change_type, peer }) = cmd.request.admin.clone()
            else {
                unreachable!("checked change peer");
            };
            let mut change = ConfChange::default();
            change.set_change_type(change_type.into());
            change.node_id = peer.id;
            change.context = data.into();
            match self.raw_node.propose_conf_change(vec![], change) {
                Ok(()) => self.register_proposal(term, cmd, true),
                Err(e) => {
                    debug!(target: "raftstore", cell = self.cell_id, error = %e, "confchange proposal rejected");
                    cmd.respond_stale(term);
                }
            }
        } else {
            match self.raw_node.propose(vec![], data) {
                Ok(()) => self.register_proposal(term, cmd, false),
                Err(e) => {
                    debug!(target: "raftstore", cell = self.cell_id, error = %e, "proposal rejected");
                    cmd.respond_stale(term);
                }
            }
        }
    }

    /// Register an accepted proposal with the cell's apply delegate.
    fn register_proposal(&mut self, term: u64, cmd: Cmd, is_conf_change: bool) {
        let mut delegates = self.delegates.lock();
        let Some(delegate) = delegates.get_mut(&self.cell_id) else {
            drop(delegates);
            cmd.respond_cell_not_found(self.cell_id, term);
            return;
        };
        if delegate.cell.id != self.cell_id {
            panic!("{} delegate bound to cell {}", self.tag, delegate.cell.id);
        }
        if is_conf_change {
            delegate.set_pending_change_peer(term, cmd);
        } else {
            delegate.append_pending_cmd(term, cmd);
        }
    }

    fn propose_read_index(&mut self, cmd: Cmd) {
        let term = self.term();
        let uuid = cmd.uuid();
        match self.pending_reads.push(cmd) {
            Ok(()) => {
                self.raw_node.read_index(uuid.as_bytes().to_vec());
            }
            Err(cmd) => {
                cmd.respond(CmdResponse::error(uuid, term, Error::TemporarilyUnavailable));
            }
        }
    }

    // ------------------------------------------------------------------
    // Ready processing
    // ------------------------------------------------------------------

    /// Drain one ready batch from the consensus library.
    ///
    /// Order matters: snapshot metadata first, then log appends, then the
    /// durable states, then the snapshot's live effects, then outbound
    /// messages, committed entries, read states, and last the soft-state
    /// reaction. Advancing the library closes the batch.
    pub fn handle_ready(&mut self, trans: &dyn Transport) -> Result<Option<ApplySnapResult>> {
        if !self.raw_node.has_ready() {
            return Ok(None);
        }

        let mut ready = self.raw_node.ready();
        let soft_state = ready.ss().map(|ss| ss.raft_state);
        let mut ctx = InvokeContext::new(self.raw_node.store());

        if !ready.snapshot().is_empty() {
            let snapshot = ready.snapshot().clone();
            self.raw_node
                .mut_store()
                .append_snapshot(&mut ctx, &snapshot)?;
        }

        let entries = ready.take_entries();
        if !entries.is_empty() {
            self.raw_node.store().append_entries(&mut ctx, &entries)?;
        }

        if let Some(hs) = ready.hs() {
            ctx.raft_state.hard_state = hs.into();
        }

        self.raw_node.store().persist(&ctx)?;
        let apply_snap_result = self.raw_node.mut_store().do_apply_snap(&mut ctx)?;
        if let Some(result) = &apply_snap_result {
            self.update_key_range(result);
        }

        self.send_messages(ready.take_messages(), trans);
        self.send_messages(ready.take_persisted_messages(), trans);

        let committed = ready.take_committed_entries();
        self.handle_committed_entries(committed)?;

        self.apply_read_states(ready.take_read_states());

        if let Some(role) = soft_state {
            self.on_role_changed(role);
        }

        let mut light = self.raw_node.advance_append(ready);
        if let Some(commit) = light.commit_index() {
            self.raw_node.mut_store().save_commit_index(commit)?;
        }
        self.send_messages(light.take_messages(), trans);
        let committed = light.take_committed_entries();
        self.handle_committed_entries(committed)?;

        Ok(apply_snap_result)
    }

    fn send_messages(&self, msgs: Vec<Message>, trans: &dyn Transport) {
        for msg in msgs {
            let to_id = msg.to;
            let Some(to) = self.lookup_peer(to_id) else {
                warn!(
                    target: "raftstore",
                    cell = self.cell_id,
                    to = to_id,
                    "dropping message for unknown peer"
                );
                continue;
            };
            let envelope = CellMessage {
                cell_id: self.cell_id,
                from: self.peer,
                to,
                epoch: self.cell().epoch,
                message: msg,
            };
            if let Err(e) = trans.send(envelope) {
                warn!(target: "raftstore", cell = self.cell_id, error = %e, "transport send failed");
            }
        }
    }

    fn lookup_peer(&self, peer_id: u64) -> Option<Peer> {
        self.cell()
            .find_peer(peer_id)
            .or_else(|| self.peer_cache.read().get(&peer_id).copied())
    }

    /// Hand committed entries to the apply pipeline, unless a snapshot is
    /// being installed; its data must land before anything applies on top.
    fn handle_committed_entries(
        &mut self,
        entries: Vec<raft::eraftpb::Entry>,
    ) -> Result<()> {
        if entries.is_empty() || self.storage().is_applying_snap() {
            return Ok(());
        }
        let term = self.term();
        self.apply_sched
            .send(ApplyTask::Apply {
                cell_id: self.cell_id,
                term,
                entries,
            })
            .map_err(|_| Error::engine("apply worker unavailable"))
    }

    /// Serve or defer the batch's read states.
    ///
    /// Each read state must match the head pending read by uuid; raft
    /// answers read-index requests in submission order, so a mismatch is
    /// a bookkeeping bug, not bad input.
    fn apply_read_states(&mut self, read_states: Vec<raft::ReadState>) {
        if self.ready_to_handle_read() {
            for state in read_states {
                let Some(cmd) = self.pending_reads.pop() else {
                    panic!("{} read state without pending read", self.tag);
                };
                if state.request_ctx[..] != cmd.uuid().as_bytes()[..] {
                    panic!("{} read state uuid mismatch", self.tag);
                }
                self.exec_read_cmd(cmd);
            }
        } else {
            for _ in read_states {
                self.pending_reads.incr_ready();
            }
        }
    }

    /// Only after the read states have been accounted can we tell which
    /// pending reads are actually stale.
    fn on_role_changed(&mut self, role: StateRole) {
        if role == StateRole::Leader {
            info!(target: "raftstore", cell = self.cell_id, "became leader");
            self.heartbeat_pd();
            return;
        }
        let ready = self.pending_reads.get_ready();
        if ready > 0 {
            // Uncommitted reads were dropped silently inside raft.
            let term = self.term();
            for _ in 0..ready {
                let Some(cmd) = self.pending_reads.pop() else {
                    break;
                };
                info!(target: "raftstore", cell = self.cell_id, "pending read is stale");
                cmd.respond_stale(term);
            }
            self.pending_reads.reset_ready();
        }
    }

    fn exec_read_cmd(&self, cmd: Cmd) {
        let term = self.term();
        let uuid = cmd.uuid();
        let mut responses = Vec::with_capacity(cmd.request.requests.len());
        for request in &cmd.request.requests {
            match request {
                Request::Get { key } => match self.data_engine.get(key) {
                    Ok(value) => responses.push(Response::Get { value }),
                    Err(e) => {
                        cmd.respond(CmdResponse::error(uuid, term, e));
                        return;
                    }
                },
                _ => {
                    cmd.respond(CmdResponse::error(
                        uuid,
                        term,
                        Error::corrupt("write request on the read path"),
                    ));
                    return;
                }
            }
        }
        cmd.respond(CmdResponse::ok(uuid, term, responses));
    }

    // ------------------------------------------------------------------
    // Post-apply
    // ------------------------------------------------------------------

    /// Install the outcome of one apply batch and drain reads that became
    /// serviceable while application was in flight.
    pub fn post_apply(&mut self, result: &AsyncApplyResult) {
        if self.storage().is_applying_snap() {
            panic!("{} post apply while applying snapshot", self.tag);
        }

        debug!(target: "raftstore", cell = self.cell_id, applied = result.apply_state.applied_index, "apply batch finished");

        self.mut_storage()
            .set_apply_state(result.apply_state, result.applied_index_term);
        self.raw_node
            .advance_apply_to(result.apply_state.applied_index);

        self.written_bytes += result.metrics.written_bytes;
        self.written_keys += result.metrics.written_keys;
        if result.has_split_exec_result() {
            // The old cell's shape no longer applies.
            self.delete_keys_hint = result.metrics.delete_keys_hint;
            self.size_diff_hint = result.metrics.size_diff_hint;
        } else {
            self.delete_keys_hint += result.metrics.delete_keys_hint;
            self.size_diff_hint += result.metrics.size_diff_hint;
        }

        let ready = self.pending_reads.get_ready();
        if ready > 0 && self.ready_to_handle_read() {
            for _ in 0..ready {
                let Some(cmd) = self.pending_reads.pop() else {
                    panic!("{} ready count exceeds pending reads", self.tag);
                };
                self.exec_read_cmd(cmd);
            }
            self.pending_reads.reset_ready();
        }
    }

    /// Rebalance the store's key-range index after a snapshot changed the
    /// cell's shape.
    pub fn update_key_range(&self, result: &ApplySnapResult) {
        info!(
            target: "raftstore",
            cell = self.cell_id,
            "cell changed after applying snapshot"
        );
        let mut ranges = self.key_ranges.write();
        if !result.prev_cell.peers.is_empty() {
            // The peer was initialized, so its range must be indexed.
            if !ranges.remove(&result.prev_cell) {
                panic!("{} previous range missing from index", self.tag);
            }
        }
        if let Err(e) = ranges.insert(&result.cell) {
            panic!("{} overlapping range after snapshot: {}", self.tag, e);
        }
    }

    // ------------------------------------------------------------------
    // Admin plumbing
    // ------------------------------------------------------------------

    /// Feed an applied membership change back into the consensus node.
    pub fn apply_conf_change(&mut self, change: &ConfChange) -> Result<()> {
        self.raw_node
            .apply_conf_change(change)
            .map(|_| ())
            .map_err(|e| Error::corrupt(format!("{} apply confchange failed: {e}", self.tag)))
    }

    /// Send an immediate heartbeat for this cell to the placement driver.
    pub fn heartbeat_pd(&self) {
        let task = PdTask::CellHeartbeat {
            cell: self.cell().clone(),
            leader: self.peer,
        };
        if let Err(e) = self.pd_sched.send(task) {
            error!(target: "raftstore", cell = self.cell_id, error = %e, "pd worker unavailable");
        }
    }

    /// Tear the replica down: fail anything pending, wipe the cell's meta
    /// records, persist the tombstone and schedule the data cleanup.
    pub fn destroy(&mut self) -> Result<()> {
        info!(target: "raftstore", cell = self.cell_id, peer = self.peer.id, "destroying replica");

        let term = self.term();
        while let Some(cmd) = self.pending_reads.pop() {
            cmd.respond_stale(term);
        }
        self.pending_reads.reset_ready();

        let cell = self.cell().clone();
        let initialized = self.storage().is_initialized();
        self.mut_storage().clear_meta()?;
        self.mut_storage().set_peer_state(PeerState::Tombstone)?;

        // An uninitialized peer never owned a range, so there is no data
        // of its own to clean up.
        if initialized {
            if let Err(e) = self.snap_sched.send(SnapTask::CleanupRange {
                cell_id: cell.id,
                start_key: cell.start_key,
                end_key: cell.end_key,
            }) {
                warn!(target: "raftstore", cell = self.cell_id, error = %e, "data cleanup not scheduled");
            }
        }
        Ok(())
    }
}
