//! Process-wide coordinator.
//!
//! The store owns every replica this process hosts, the shared caches
//! (peer addresses, key ranges), the worker pools and the PD boundary.
//! A single loop drives it: raft messages and client commands come in,
//! apply/snapshot/split-check completions come back, and a tick channel
//! advances every cell's consensus clock. Per-cell work stays inside
//! [`PeerReplicate`]; cross-cell effects (split, self-removal) land here.

pub mod bootstrap;
pub mod key_range;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::cell::apply::{
    new_delegate_map, ApplyDelegate, ApplyRunner, ApplyTask, AsyncApplyResult, DelegateMap,
    ExecResult,
};
use crate::cell::replicate::{PeerCache, PeerContext, PeerReplicate};
use crate::cmd::Cmd;
use crate::core::config::StoreConfig;
use crate::core::error::Result;
use crate::engine::KvEngine;
use crate::meta::keys::{cell_meta_max_key, cell_meta_min_key};
use crate::meta::{decode, Cell, CellLocalState, Peer, PeerState, StoreIdent};
use crate::pd::PdClient;
use crate::store::key_range::KeyRangeIndex;
use crate::transport::{CellMessage, Transport};
use crate::worker::pd::{PdRunner, PdTask};
use crate::worker::snap::{SnapResult, SnapRunner, SnapTask};
use crate::worker::split::{SplitCheckResult, SplitCheckRunner, SplitCheckTask};
use crate::worker::Worker;

/// Handles external producers use to feed a running store.
#[derive(Clone)]
pub struct StoreRouter {
    cmd_tx: Sender<Cmd>,
    msg_tx: Sender<CellMessage>,
}

impl StoreRouter {
    pub fn send_command(&self, cmd: Cmd) -> bool {
        self.cmd_tx.send(cmd).is_ok()
    }

    pub fn send_raft_message(&self, msg: CellMessage) -> bool {
        self.msg_tx.send(msg).is_ok()
    }
}

/// The per-store coordinator.
pub struct Store {
    cfg: Arc<StoreConfig>,
    ident: StoreIdent,
    meta_engine: Arc<dyn KvEngine>,
    trans: Arc<dyn Transport>,
    replicates: HashMap<u64, PeerReplicate>,
    peer_cache: PeerCache,
    key_ranges: Arc<RwLock<KeyRangeIndex>>,
    delegates: DelegateMap,
    ctx: PeerContext,
    pd_sched: Sender<PdTask>,
    snap_sched: Sender<SnapTask>,
    split_sched: Sender<SplitCheckTask>,
    cmd_tx: Sender<Cmd>,
    cmd_rx: Receiver<Cmd>,
    msg_tx: Sender<CellMessage>,
    msg_rx: Receiver<CellMessage>,
    apply_rx: Receiver<AsyncApplyResult>,
    snap_rx: Receiver<SnapResult>,
    split_rx: Receiver<SplitCheckResult>,
    apply_workers: Vec<Worker<ApplyTask>>,
    snap_worker: Worker<SnapTask>,
    split_worker: Worker<SplitCheckTask>,
    pd_worker: Worker<PdTask>,
}

impl Store {
    /// Build the store, spawn its workers and recover every cell the meta
    /// engine knows about.
    pub fn new(
        cfg: StoreConfig,
        ident: StoreIdent,
        meta_engine: Arc<dyn KvEngine>,
        data_engine: Arc<dyn KvEngine>,
        trans: Arc<dyn Transport>,
        pd_client: Arc<dyn PdClient>,
    ) -> Result<Self> {
        cfg.validate()?;
        let cfg = Arc::new(cfg);

        let delegates = new_delegate_map();
        let peer_cache: PeerCache = Arc::new(RwLock::new(HashMap::new()));
        let key_ranges = Arc::new(RwLock::new(KeyRangeIndex::new()));

        let (cmd_tx, cmd_rx) = unbounded();
        let (msg_tx, msg_rx) = unbounded();
        let (apply_tx, apply_rx) = unbounded();
        let (snap_tx, snap_rx) = unbounded();
        let (split_tx, split_rx) = unbounded();

        let mut apply_workers = Vec::with_capacity(cfg.apply_pool_size);
        for i in 0..cfg.apply_pool_size {
            let runner = ApplyRunner::new(delegates.clone(), apply_tx.clone());
            apply_workers.push(Worker::spawn(format!("apply-worker-{i}"), move |task| {
                runner.run(task)
            }));
        }

        let snap_runner = SnapRunner::new(meta_engine.clone(), data_engine.clone(), snap_tx);
        let snap_worker = Worker::spawn("snap-worker", move |task| snap_runner.run(task));

        let split_runner = SplitCheckRunner::new(
            data_engine.clone(),
            cfg.cell_split_size,
            cfg.cell_max_size,
            split_tx,
        );
        let split_worker = Worker::spawn("split-check-worker", move |task| split_runner.run(task));

        let pd_runner = PdRunner::new(pd_client, cmd_tx.clone());
        let pd_worker = Worker::spawn("pd-worker", move |task| pd_runner.run(task));

        let ctx = PeerContext {
            store_id: ident.store_id,
            cfg: cfg.clone(),
            meta_engine: meta_engine.clone(),
            data_engine,
            delegates: delegates.clone(),
            apply_scheds: apply_workers.iter().map(|w| w.scheduler()).collect(),
            snap_sched: snap_worker.scheduler(),
            pd_sched: pd_worker.scheduler(),
            peer_cache: peer_cache.clone(),
            key_ranges: key_ranges.clone(),
        };

        let mut store = Self {
            cfg,
            ident,
            meta_engine,
            trans,
            replicates: HashMap::new(),
            peer_cache,
            key_ranges,
            delegates,
            pd_sched: pd_worker.scheduler(),
            snap_sched: snap_worker.scheduler(),
            split_sched: split_worker.scheduler(),
            ctx,
            cmd_tx,
            cmd_rx,
            msg_tx,
            msg_rx,
            apply_rx,
            snap_rx,
            split_rx,
            apply_workers,
            snap_worker,
            split_worker,
            pd_worker,
        };
        store.init()?;
        Ok(store)
    }

    /// Recover every non-tombstone cell persisted in the meta engine.
    fn init(&mut self) -> Result<()> {
        let mut states: Vec<CellLocalState> = Vec::new();
        self.meta_engine
            .scan(&cell_meta_min_key(), &cell_meta_max_key(), &mut |_, value| {
                states.push(decode(value)?);
                Ok(true)
            })?;

        for state in states {
            if state.state == PeerState::Tombstone {
                debug!(target: "raftstore", cell = state.cell.id, "skipping tombstone cell");
                continue;
            }
            let cell = state.cell;
            if cell.find_store_peer(self.ident.store_id).is_none() {
                // Uninitialized placeholder from a previous run; it will
                // be recreated if its group speaks to us again.
                continue;
            }
            let pr = PeerReplicate::create(&self.ctx, cell.clone())?;
            if !cell.peers.is_empty() {
                self.key_ranges.write().insert(&cell)?;
                let mut cache = self.peer_cache.write();
                for peer in &cell.peers {
                    cache.insert(peer.id, *peer);
                }
            }
            self.replicates.insert(cell.id, pr);
        }

        info!(
            target: "raftstore",
            store = self.ident.store_id,
            cells = self.replicates.len(),
            "store initialized"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn ident(&self) -> StoreIdent {
        self.ident
    }

    pub fn router(&self) -> StoreRouter {
        StoreRouter {
            cmd_tx: self.cmd_tx.clone(),
            msg_tx: self.msg_tx.clone(),
        }
    }

    pub fn cell_count(&self) -> usize {
        self.replicates.len()
    }

    pub fn replicate(&self, cell_id: u64) -> Option<&PeerReplicate> {
        self.replicates.get(&cell_id)
    }

    pub fn replicate_mut(&mut self, cell_id: u64) -> Option<&mut PeerReplicate> {
        self.replicates.get_mut(&cell_id)
    }

    pub fn key_ranges(&self) -> Arc<RwLock<KeyRangeIndex>> {
        self.key_ranges.clone()
    }

    pub fn peer_cache(&self) -> PeerCache {
        self.peer_cache.clone()
    }

    pub fn delegates(&self) -> DelegateMap {
        self.delegates.clone()
    }

    /// The cell currently owning `key`, if this store hosts it.
    pub fn find_cell(&self, key: &[u8]) -> Option<u64> {
        self.key_ranges.read().find(key)
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    /// Drive the store until `shutdown` fires or disconnects.
    pub fn run(&mut self, shutdown: Receiver<()>) {
        let ticker = crossbeam_channel::tick(Duration::from_millis(self.cfg.raft_tick_interval_ms));
        let cmd_rx = self.cmd_rx.clone();
        let msg_rx = self.msg_rx.clone();
        let apply_rx = self.apply_rx.clone();
        let snap_rx = self.snap_rx.clone();
        let split_rx = self.split_rx.clone();
        loop {
            crossbeam_channel::select! {
                recv(cmd_rx) -> cmd => {
                    if let Ok(cmd) = cmd {
                        self.on_command(cmd);
                    }
                }
                recv(msg_rx) -> msg => {
                    if let Ok(msg) = msg {
                        self.on_raft_message(msg);
                    }
                }
                recv(apply_rx) -> result => {
                    if let Ok(result) = result {
                        self.on_apply_result(result);
                    }
                }
                recv(snap_rx) -> result => {
                    if let Ok(result) = result {
                        self.on_snap_result(result);
                    }
                }
                recv(split_rx) -> result => {
                    if let Ok(result) = result {
                        self.on_split_check_result(result);
                    }
                }
                recv(ticker) -> _ => {
                    self.on_tick();
                }
                recv(shutdown) -> _ => {
                    info!(target: "raftstore", store = self.ident.store_id, "store loop stopping");
                    break;
                }
            }
        }
    }

    /// Drain whatever commands, messages and worker completions are
    /// queued right now, waiting up to `wait` for the first one. Returns
    /// the number of events processed. The `run` loop does this with a
    /// blocking select; embedders and tests drive it explicitly.
    pub fn process_pending(&mut self, wait: Duration) -> usize {
        let deadline = Instant::now() + wait;
        let mut processed = 0;
        loop {
            while let Ok(cmd) = self.cmd_rx.try_recv() {
                self.on_command(cmd);
                processed += 1;
            }
            while let Ok(msg) = self.msg_rx.try_recv() {
                self.on_raft_message(msg);
                processed += 1;
            }
            while let Ok(result) = self.apply_rx.try_recv() {
                self.on_apply_result(result);
                processed += 1;
            }
            while let Ok(result) = self.snap_rx.try_recv() {
                self.on_snap_result(result);
                processed += 1;
            }
            while let Ok(result) = self.split_rx.try_recv() {
                self.on_split_check_result(result);
                processed += 1;
            }
            if processed > 0 || Instant::now() >= deadline {
                return processed;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Advance every cell's consensus clock and kick off due split checks.
    pub fn on_tick(&mut self) {
        let ids: Vec<u64> = self.replicates.keys().copied().collect();
        for id in ids {
            if let Some(pr) = self.replicates.get_mut(&id) {
                pr.tick();
            }
            self.on_ready(id);
        }
        self.trigger_split_checks();
    }

    fn trigger_split_checks(&mut self) {
        let threshold = self.cfg.cell_check_size_diff as i64;
        for pr in self.replicates.values_mut() {
            if !pr.is_leader() || pr.size_diff_hint < threshold {
                continue;
            }
            let cell = pr.cell();
            let task = SplitCheckTask {
                cell_id: cell.id,
                epoch: cell.epoch,
                start_key: cell.start_key.clone(),
                end_key: cell.end_key.clone(),
            };
            if self.split_sched.send(task).is_ok() {
                pr.size_diff_hint = 0;
            }
        }
    }

    /// Process pending ready batches for one cell.
    pub fn on_ready(&mut self, cell_id: u64) {
        let Some(pr) = self.replicates.get_mut(&cell_id) else {
            return;
        };
        while pr.has_ready() {
            match pr.handle_ready(self.trans.as_ref()) {
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    error!(target: "raftstore", cell = cell_id, error = %e, "fatal error in ready processing");
                    panic!("[cell {cell_id}] ready processing failed: {e}");
                }
                Err(e) => {
                    warn!(target: "raftstore", cell = cell_id, error = %e, "ready processing error");
                    break;
                }
            }
        }
    }

    /// Route a client command to its cell.
    pub fn on_command(&mut self, cmd: Cmd) {
        let cell_id = cmd.request.header.cell_id;
        let Some(pr) = self.replicates.get_mut(&cell_id) else {
            cmd.respond_cell_not_found(cell_id, 0);
            return;
        };
        pr.propose(cmd);
        self.on_ready(cell_id);
    }

    /// Feed an inbound raft message into its cell, creating a fresh
    /// uninitialized peer when the cell is unknown.
    pub fn on_raft_message(&mut self, msg: CellMessage) {
        if msg.to.store_id != self.ident.store_id {
            warn!(
                target: "raftstore",
                cell = msg.cell_id,
                to_store = msg.to.store_id,
                "message for another store dropped"
            );
            return;
        }

        let cell_id = msg.cell_id;
        if !self.replicates.contains_key(&cell_id) && !self.maybe_create_peer(&msg) {
            return;
        }

        if msg.from.id != 0 {
            self.peer_cache.write().insert(msg.from.id, msg.from);
        }

        let Some(pr) = self.replicates.get_mut(&cell_id) else {
            return;
        };
        if let Err(e) = pr.step(msg.message) {
            warn!(target: "raftstore", cell = cell_id, error = %e, "step failed");
            return;
        }
        self.on_ready(cell_id);
    }

    /// A message for an unknown cell creates an uninitialized peer; the
    /// initialized state arrives later by snapshot. Tombstoned cells stay
    /// dead.
    fn maybe_create_peer(&mut self, msg: &CellMessage) -> bool {
        if msg.to.id == 0 {
            return false;
        }
        match self.load_cell_state(msg.cell_id) {
            Ok(Some(state)) if state.state == PeerState::Tombstone => {
                debug!(target: "raftstore", cell = msg.cell_id, "message for tombstone cell dropped");
                return false;
            }
            Ok(_) => {}
            Err(e) => {
                error!(target: "raftstore", cell = msg.cell_id, error = %e, "cell state unreadable");
                panic!("[cell {}] cell state unreadable: {e}", msg.cell_id);
            }
        }

        match PeerReplicate::replicate(&self.ctx, msg.cell_id, msg.to.id) {
            Ok(pr) => {
                self.replicates.insert(msg.cell_id, pr);
                true
            }
            Err(e) => {
                error!(target: "raftstore", cell = msg.cell_id, error = %e, "replica creation failed");
                false
            }
        }
    }

    fn load_cell_state(&self, cell_id: u64) -> Result<Option<CellLocalState>> {
        self.meta_engine
            .get(&crate::meta::keys::cell_state_key(cell_id))?
            .map(|v| decode(&v))
            .transpose()
    }

    // ------------------------------------------------------------------
    // Apply pipeline completions
    // ------------------------------------------------------------------

    /// Demultiplex one apply completion: per-cell bookkeeping first, then
    /// any admin side effects.
    pub fn on_apply_result(&mut self, result: AsyncApplyResult) {
        let Some(pr) = self.replicates.get_mut(&result.cell_id) else {
            // Destroyed while the batch was in flight.
            debug!(target: "raftstore", cell = result.cell_id, "apply result for missing cell discarded");
            return;
        };
        pr.post_apply(&result);

        if let Some(exec) = result.exec_result {
            self.post_apply_result(result.cell_id, exec);
        }
    }

    fn post_apply_result(&mut self, cell_id: u64, exec: ExecResult) {
        match exec {
            ExecResult::ChangePeer { change, peer, cell } => {
                self.on_apply_conf_change(cell_id, change, peer, cell)
            }
            ExecResult::SplitCell { left, right } => self.on_apply_split(cell_id, left, right),
            ExecResult::CompactLog {
                state,
                prev_first_index,
            } => {
                let task = SnapTask::CompactRaftLog {
                    cell_id,
                    first_index: prev_first_index,
                    compact_index: state.index,
                };
                if self.snap_sched.send(task).is_err() {
                    warn!(target: "raftstore", cell = cell_id, "log compaction not scheduled");
                }
            }
        }
    }

    fn on_apply_conf_change(
        &mut self,
        cell_id: u64,
        change: raft::eraftpb::ConfChange,
        peer: Peer,
        cell: Cell,
    ) {
        let mut destroy = false;
        {
            let Some(pr) = self.replicates.get_mut(&cell_id) else {
                panic!("[cell {cell_id}] confchange applied for missing cell");
            };
            if let Err(e) = pr.apply_conf_change(&change) {
                error!(target: "raftstore", cell = cell_id, error = %e, "confchange rejected by raft");
                panic!("[cell {cell_id}] confchange rejected: {e}");
            }
            if change.node_id == 0 {
                // The raft layer refused the change; nothing else to do.
                return;
            }

            pr.mut_storage().set_cell(cell.clone());
            if pr.is_leader() {
                info!(target: "raftstore", cell = cell_id, "membership changed, notifying pd");
                pr.heartbeat_pd();
            }

            match change.change_type() {
                raft::eraftpb::ConfChangeType::AddNode => {
                    pr.peer_heartbeats.insert(peer.id, Instant::now());
                    self.peer_cache.write().insert(peer.id, peer);
                }
                raft::eraftpb::ConfChangeType::RemoveNode => {
                    pr.peer_heartbeats.remove(&peer.id);
                    self.peer_cache.write().remove(&peer.id);
                    if peer.store_id == self.ident.store_id {
                        if peer.id == pr.peer.id {
                            destroy = true;
                        } else {
                            panic!(
                                "[cell {cell_id}] removing unknown local peer {}",
                                peer.id
                            );
                        }
                    }
                }
                raft::eraftpb::ConfChangeType::AddLearnerNode => {}
            }
        }
        if destroy {
            self.destroy_peer(cell_id, peer);
        }
    }

    fn on_apply_split(&mut self, cell_id: u64, left: Cell, right: Cell) {
        let was_leader = {
            let Some(pr) = self.replicates.get_mut(&cell_id) else {
                panic!("[cell {cell_id}] split applied for missing cell");
            };
            pr.mut_storage().set_cell(left.clone());
            pr.is_leader()
        };

        {
            let mut cache = self.peer_cache.write();
            for peer in &right.peers {
                cache.insert(peer.id, *peer);
            }
        }

        if let Some(existing) = self.replicates.get(&right.id) {
            if existing.storage().is_initialized() {
                panic!(
                    "[cell {cell_id}] duplicated initialized cell {} on split",
                    right.id
                );
            }
            // A message for the new group arrived before the split
            // applied; the placeholder peer is superseded.
            self.replicates.remove(&right.id);
        }

        let new_pr = match PeerReplicate::create(&self.ctx, right.clone()) {
            Ok(pr) => pr,
            Err(e) => {
                // The right cell's state is already durable; failing to
                // materialize the replica cannot be recovered here.
                panic!("[cell {cell_id}] creating split cell {} failed: {e}", right.id);
            }
        };

        {
            let mut ranges = self.key_ranges.write();
            let _ = ranges.remove(&left);
            if let Err(e) = ranges.insert(&left) {
                panic!("[cell {cell_id}] key range update on split failed: {e}");
            }
            if let Err(e) = ranges.insert(&right) {
                panic!("[cell {cell_id}] key range update on split failed: {e}");
            }
        }

        let mut new_pr = new_pr;
        new_pr.size_diff_hint = self.cfg.cell_check_size_diff as i64;
        self.replicates.insert(right.id, new_pr);

        if was_leader {
            info!(
                target: "raftstore",
                cell = cell_id,
                right = right.id,
                "split applied, notifying pd"
            );
            if let Some(pr) = self.replicates.get(&cell_id) {
                pr.heartbeat_pd();
            }
            if let Some(pr) = self.replicates.get(&right.id) {
                pr.heartbeat_pd();
            }
            if self
                .pd_sched
                .send(PdTask::ReportSplit { left, right })
                .is_err()
            {
                error!(target: "raftstore", cell = cell_id, "report split not scheduled");
            }
        }
    }

    /// Remove this store's replica of a cell: unregister it everywhere,
    /// wipe its meta records and leave a tombstone.
    pub fn destroy_peer(&mut self, cell_id: u64, peer: Peer) {
        info!(target: "raftstore", cell = cell_id, peer = peer.id, "destroying peer");
        let Some(mut pr) = self.replicates.remove(&cell_id) else {
            panic!("[cell {cell_id}] destroying missing cell");
        };

        if pr.storage().is_initialized() {
            let cell = pr.cell().clone();
            if !self.key_ranges.write().remove(&cell) {
                panic!("[cell {cell_id}] destroyed cell had no registered range");
            }
        }

        if let Some(mut delegate) = self.delegates.lock().remove(&cell_id) {
            delegate.destroy();
        }

        if let Err(e) = pr.destroy() {
            error!(target: "raftstore", cell = cell_id, error = %e, "destroy failed");
            panic!("[cell {cell_id}] destroy failed: {e}");
        }
    }

    // ------------------------------------------------------------------
    // Snapshot and split-check completions
    // ------------------------------------------------------------------

    /// An applying-snapshot job finished installing data.
    pub fn on_snap_result(&mut self, result: SnapResult) {
        let cell_id = result.cell_id;
        let Some(pr) = self.replicates.get_mut(&cell_id) else {
            debug!(target: "raftstore", cell = cell_id, "snapshot result for missing cell discarded");
            return;
        };
        if !pr.storage().is_applying_snap() {
            debug!(target: "raftstore", cell = cell_id, "stale snapshot result discarded");
            return;
        }
        if !result.success {
            error!(target: "raftstore", cell = cell_id, "snapshot installation failed");
            panic!("[cell {cell_id}] snapshot installation failed");
        }
        if let Err(e) = pr.mut_storage().finish_apply_snap() {
            panic!("[cell {cell_id}] finishing snapshot failed: {e}");
        }

        // Rebind the apply delegate to the cell's new shape and progress.
        let delegate = ApplyDelegate::new(
            self.ctx.meta_engine.clone(),
            self.ctx.data_engine.clone(),
            pr.cell().clone(),
            pr.storage().apply_state(),
            pr.storage().applied_index_term(),
        );
        if let Some(mut old) = self.delegates.lock().insert(cell_id, delegate) {
            old.destroy();
        }

        self.on_ready(cell_id);
    }

    /// Tear the store down: drop every scheduler handle so the worker
    /// threads drain and exit, then join them.
    pub fn shutdown(self) {
        let Store {
            replicates,
            delegates,
            ctx,
            pd_sched,
            snap_sched,
            split_sched,
            apply_workers,
            snap_worker,
            split_worker,
            pd_worker,
            ..
        } = self;
        drop(replicates);
        drop(delegates);
        drop(ctx);
        drop(pd_sched);
        drop(snap_sched);
        drop(split_sched);
        for worker in apply_workers {
            worker.stop();
        }
        snap_worker.stop();
        split_worker.stop();
        pd_worker.stop();
    }

    /// A split check crossed the maximum size: ask PD for ids, which the
    /// PD worker turns into an admin split proposal.
    pub fn on_split_check_result(&mut self, result: SplitCheckResult) {
        let Some(pr) = self.replicates.get(&result.cell_id) else {
            return;
        };
        if !pr.is_leader() {
            debug!(target: "raftstore", cell = result.cell_id, "split check result on non-leader ignored");
            return;
        }
        let cell = pr.cell().clone();
        if cell.epoch.version != result.epoch.version {
            warn!(target: "raftstore", cell = result.cell_id, "split check result carries stale epoch");
            return;
        }
        let task = PdTask::AskSplit {
            peer: pr.peer,
            cell,
            split_key: result.split_key,
        };
        if self.pd_sched.send(task).is_err() {
            warn!(target: "raftstore", cell = result.cell_id, "ask split not scheduled");
        }
    }
}
