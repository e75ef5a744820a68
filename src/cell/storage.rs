//! Per-cell durable storage and the consensus storage contract.
//!
//! `PeerStorage` owns everything the meta engine persists for one cell:
//! the raft log, the raft local state (hard state + last index), the apply
//! state, and the cell local state. It implements the `raft::Storage`
//! trait the consensus library reads from, and the durable mutations the
//! ready-processing loop drives through an [`InvokeContext`].
//!
//! Snapshot generation is asynchronous: the first request schedules a job
//! on the snapshot worker and reports the storage as temporarily
//! unavailable until the job delivers. Completed snapshots are validated
//! once; stale results are discarded and count against the retry cap.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use prost::Message as ProstMessage;
use raft::eraftpb::{ConfState, Entry, HardState, Snapshot};
use raft::{GetEntriesContext, RaftState, Storage};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::core::error::{Error, Result};
use crate::engine::{delete_range, KvEngine};
use crate::meta::keys::{apply_state_key, cell_state_key, raft_log_key, raft_log_prefix, raft_state_key};
use crate::meta::{
    decode, encode, Cell, CellLocalState, HardStateRecord, PeerState, RaftApplyState,
    RaftLocalState, TruncatedState, RAFT_INIT_LOG_INDEX, RAFT_INIT_LOG_TERM,
};
use crate::worker::snap::SnapTask;

/// Payload embedded in a snapshot: the cell descriptor and the user keys
/// of its range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotData {
    pub cell: Cell,
    pub kvs: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Result of installing a snapshot's metadata: the cell changed shape, so
/// the store's key-range index must be rebalanced.
#[derive(Debug, Clone)]
pub struct ApplySnapResult {
    pub prev_cell: Cell,
    pub cell: Cell,
}

/// Scratch state for one ready batch. Durable state is mutated here first
/// and swapped into the live [`PeerStorage`] only after it has been
/// persisted.
#[derive(Debug, Clone)]
pub struct InvokeContext {
    pub raft_state: RaftLocalState,
    pub apply_state: RaftApplyState,
    pub last_term: u64,
    pub snap_cell: Option<Cell>,
}

impl InvokeContext {
    pub fn new(ps: &PeerStorage) -> Self {
        Self {
            raft_state: ps.raft_state,
            apply_state: ps.apply_state,
            last_term: ps.last_term,
            snap_cell: None,
        }
    }
}

enum GenSnapState {
    Idle,
    Generating(Receiver<Option<Snapshot>>),
}

/// Durable per-cell state and the consensus storage implementation.
pub struct PeerStorage {
    meta_engine: Arc<dyn KvEngine>,
    data_engine: Arc<dyn KvEngine>,
    cell: Cell,
    peer_state: PeerState,
    raft_state: RaftLocalState,
    apply_state: RaftApplyState,
    applied_index_term: u64,
    last_term: u64,
    // Mirror of raft_state.last_index, readable off-thread.
    last_index: AtomicU64,
    snap_state: Mutex<GenSnapState>,
    snap_tried_cnt: AtomicUsize,
    max_snap_tries: usize,
    snap_sched: Sender<SnapTask>,
    pending_snap_data: Option<SnapshotData>,
    tag: String,
}

impl PeerStorage {
    /// Open the durable state of `cell` from the meta engine.
    ///
    /// The descriptor passed in is used only when no cell local state has
    /// been persisted yet (an uninitialized peer created on first raft
    /// message); a persisted descriptor always wins.
    pub fn new(
        meta_engine: Arc<dyn KvEngine>,
        data_engine: Arc<dyn KvEngine>,
        cell: Cell,
        snap_sched: Sender<SnapTask>,
        max_snap_tries: usize,
    ) -> Result<Self> {
        let tag = format!("[cell {}]", cell.id);

        let (cell, peer_state) = match meta_engine.get(&cell_state_key(cell.id))? {
            Some(value) => {
                let state: CellLocalState = decode(&value)?;
                (state.cell, state.state)
            }
            None => (cell, PeerState::Normal),
        };

        let raft_state = match meta_engine.get(&raft_state_key(cell.id))? {
            Some(value) => decode(&value)?,
            None => {
                if !cell.peers.is_empty() {
                    return Err(Error::corrupt(format!(
                        "{} initialized cell has no raft state",
                        tag
                    )));
                }
                RaftLocalState::default()
            }
        };

        let apply_state = match meta_engine.get(&apply_state_key(cell.id))? {
            Some(value) => decode(&value)?,
            None => RaftApplyState::default(),
        };

        let mut ps = Self {
            meta_engine,
            data_engine,
            last_index: AtomicU64::new(raft_state.last_index),
            cell,
            peer_state,
            raft_state,
            apply_state,
            applied_index_term: apply_state.applied_index_term,
            last_term: 0,
            snap_state: Mutex::new(GenSnapState::Idle),
            snap_tried_cnt: AtomicUsize::new(0),
            max_snap_tries,
            snap_sched,
            pending_snap_data: None,
            tag,
        };
        ps.last_term = ps.load_last_term()?;
        Ok(ps)
    }

    fn load_last_term(&self) -> Result<u64> {
        let last_index = self.raft_state.last_index;
        if last_index == 0 {
            return Ok(0);
        }
        if last_index == self.truncated_index() {
            return Ok(self.truncated_term());
        }
        let key = raft_log_key(self.cell.id, last_index);
        match self.meta_engine.get(&key)? {
            Some(value) => Ok(decode_entry(&value, last_index)?.term),
            None => Err(Error::corrupt(format!(
                "{} last log entry {} missing",
                self.tag, last_index
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn cell(&self) -> &Cell {
        &self.cell
    }

    pub fn set_cell(&mut self, cell: Cell) {
        self.cell = cell;
    }

    /// A cell is initialized iff its peer set is non-empty.
    pub fn is_initialized(&self) -> bool {
        !self.cell.peers.is_empty()
    }

    pub fn peer_state(&self) -> PeerState {
        self.peer_state
    }

    pub fn is_applying_snap(&self) -> bool {
        self.peer_state == PeerState::Applying
    }

    pub fn applied_index(&self) -> u64 {
        self.apply_state.applied_index
    }

    pub fn applied_index_term(&self) -> u64 {
        self.applied_index_term
    }

    pub fn apply_state(&self) -> RaftApplyState {
        self.apply_state
    }

    /// Install the apply progress reported by a finished apply batch.
    pub fn set_apply_state(&mut self, state: RaftApplyState, applied_index_term: u64) {
        self.apply_state = state;
        self.applied_index_term = applied_index_term;
    }

    pub fn truncated_index(&self) -> u64 {
        self.apply_state.truncated.index
    }

    pub fn truncated_term(&self) -> u64 {
        self.apply_state.truncated.term
    }

    pub fn last_term(&self) -> u64 {
        self.last_term
    }

    pub fn raft_local_state(&self) -> RaftLocalState {
        self.raft_state
    }

    fn last_index_atomic(&self) -> u64 {
        self.last_index.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Durable mutations driven by ready processing
    // ------------------------------------------------------------------

    /// Append `entries` to the raft log and delete any previously appended
    /// entries past the new tail: a new leader's log supersedes tails that
    /// never committed.
    pub fn append_entries(&self, ctx: &mut InvokeContext, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let prev_last = ctx.raft_state.last_index;
        let last = entries.last().expect("non-empty entries");
        let (last_index, last_term) = (last.index, last.term);

        for entry in entries {
            let key = raft_log_key(self.cell.id, entry.index);
            self.meta_engine.set(&key, &entry.encode_to_vec())?;
        }
        for index in (last_index + 1)..=prev_last {
            self.meta_engine.delete(&raft_log_key(self.cell.id, index))?;
        }

        ctx.raft_state.last_index = last_index;
        ctx.last_term = last_term;
        Ok(())
    }

    /// Record a received snapshot into the context and mark the peer as
    /// applying. The actual data installation happens asynchronously in
    /// [`do_apply_snap`](Self::do_apply_snap).
    pub fn append_snapshot(&mut self, ctx: &mut InvokeContext, snap: &Snapshot) -> Result<()> {
        info!(target: "raftstore", cell = self.cell.id, "begin to apply snapshot");

        let data: SnapshotData = decode(&snap.data)?;
        if data.cell.id != self.cell.id {
            return Err(Error::corrupt(format!(
                "{} snapshot names cell {}, expected {}",
                self.tag, data.cell.id, self.cell.id
            )));
        }

        if self.is_initialized() {
            self.clear_meta()?;
        }
        self.set_peer_state(PeerState::Applying)?;

        let meta = snap.get_metadata();
        let (index, term) = (meta.index, meta.term);

        ctx.raft_state.last_index = index;
        ctx.apply_state.applied_index = index;
        ctx.apply_state.applied_index_term = term;
        ctx.last_term = term;
        // The snapshot only covers log up to its own index, so the
        // truncated state collapses onto the snapshot point.
        ctx.apply_state.truncated = TruncatedState { index, term };

        ctx.snap_cell = Some(data.cell.clone());
        self.pending_snap_data = Some(data);

        info!(
            target: "raftstore",
            cell = self.cell.id,
            index,
            term,
            "snapshot recorded"
        );
        Ok(())
    }

    /// Persist the context's raft state and apply state. Raft state goes
    /// first; the engine is atomic per key.
    pub fn persist(&self, ctx: &InvokeContext) -> Result<()> {
        if ctx.raft_state != self.raft_state {
            self.meta_engine
                .set(&raft_state_key(self.cell.id), &encode(&ctx.raft_state)?)?;
        }
        if ctx.apply_state != self.apply_state {
            self.meta_engine
                .set(&apply_state_key(self.cell.id), &encode(&ctx.apply_state)?)?;
        }
        Ok(())
    }

    /// Persist an advanced commit index outside a full ready batch.
    pub fn save_commit_index(&mut self, commit: u64) -> Result<()> {
        if commit == self.raft_state.hard_state.commit {
            return Ok(());
        }
        self.raft_state.hard_state.commit = commit;
        self.meta_engine
            .set(&raft_state_key(self.cell.id), &encode(&self.raft_state)?)
    }

    /// Swap the persisted context into live state and, if a snapshot was
    /// recorded, start the job that installs its data.
    pub fn do_apply_snap(&mut self, ctx: &mut InvokeContext) -> Result<Option<ApplySnapResult>> {
        self.raft_state = ctx.raft_state;
        self.last_index.store(ctx.raft_state.last_index, Ordering::SeqCst);
        self.apply_state = ctx.apply_state;
        self.last_term = ctx.last_term;

        let Some(snap_cell) = ctx.snap_cell.take() else {
            return Ok(None);
        };
        self.applied_index_term = ctx.apply_state.applied_index_term;

        if self.is_initialized() {
            // Best effort: a later covering snapshot retries the deletion,
            // at the cost of shadow data in the meantime.
            if let Err(e) = self.clear_extra_data(&snap_cell) {
                error!(
                    target: "raftstore",
                    cell = self.cell.id,
                    error = %e,
                    "cleanup outside new range failed, may leave dirty data"
                );
            }
        }

        let data = self
            .pending_snap_data
            .take()
            .ok_or_else(|| Error::corrupt(format!("{} snapshot data lost before install", self.tag)))?;
        self.snap_sched
            .send(SnapTask::Apply {
                cell_id: self.cell.id,
                cell: snap_cell.clone(),
                kvs: data.kvs,
            })
            .map_err(|_| Error::engine("snapshot worker unavailable"))?;

        let prev_cell = std::mem::replace(&mut self.cell, snap_cell);
        Ok(Some(ApplySnapResult {
            prev_cell,
            cell: self.cell.clone(),
        }))
    }

    /// Called when the applying-snapshot job finished installing data.
    pub fn finish_apply_snap(&mut self) -> Result<()> {
        self.set_peer_state(PeerState::Normal)?;
        info!(target: "raftstore", cell = self.cell.id, "snapshot data installed");
        Ok(())
    }

    /// Persist the peer lifecycle state together with the current cell
    /// descriptor.
    pub fn set_peer_state(&mut self, state: PeerState) -> Result<()> {
        let record = CellLocalState {
            state,
            cell: self.cell.clone(),
        };
        self.meta_engine
            .set(&cell_state_key(self.cell.id), &encode(&record)?)?;
        self.peer_state = state;
        Ok(())
    }

    /// Delete every durable record of this cell from the meta engine:
    /// all log entries plus the raft and apply states.
    pub fn clear_meta(&self) -> Result<()> {
        delete_range(
            self.meta_engine.as_ref(),
            &raft_log_prefix(self.cell.id),
            &raft_state_key(self.cell.id),
        )?;
        self.meta_engine.delete(&raft_state_key(self.cell.id))?;
        self.meta_engine.delete(&apply_state_key(self.cell.id))?;
        Ok(())
    }

    /// Delete user data the old range covered but the new one does not.
    fn clear_extra_data(&self, new_cell: &Cell) -> Result<()> {
        let old = &self.cell;
        if new_cell.start_key > old.start_key {
            delete_range(
                self.data_engine.as_ref(),
                &old.start_key,
                &new_cell.start_key,
            )?;
        }
        if !new_cell.end_key.is_empty()
            && (old.end_key.is_empty() || new_cell.end_key < old.end_key)
        {
            delete_range(self.data_engine.as_ref(), &new_cell.end_key, &old.end_key)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Log reads
    // ------------------------------------------------------------------

    fn check_range(&self, low: u64, high: u64) -> Result<()> {
        if low > high {
            return Err(Error::corrupt(format!(
                "{} invalid log range [{}, {})",
                self.tag, low, high
            )));
        }
        if low <= self.truncated_index() {
            return Err(Error::Unavailable);
        }
        if high > self.last_index_atomic() + 1 {
            return Err(Error::Unavailable);
        }
        Ok(())
    }

    fn entries_impl(&self, low: u64, high: u64, max_size: u64) -> Result<Vec<Entry>> {
        self.check_range(low, high)?;

        let mut entries = Vec::with_capacity((high - low) as usize);
        if low == high {
            return Ok(entries);
        }

        if low + 1 == high {
            // Inactive cells probing for a single entry take the point
            // lookup instead of a scan.
            let key = raft_log_key(self.cell.id, low);
            let value = self.meta_engine.get(&key)?.ok_or(Error::Unavailable)?;
            entries.push(decode_entry(&value, low)?);
            return Ok(entries);
        }

        let mut total_size = 0u64;
        let mut next_index = low;
        let mut exceeded_max_size = false;
        let start_key = raft_log_key(self.cell.id, low);
        let end_key = raft_log_key(self.cell.id, high);
        self.meta_engine.scan(&start_key, &end_key, &mut |_, value| {
            let entry = decode_entry(value, next_index)?;
            next_index += 1;
            total_size += value.len() as u64;
            exceeded_max_size = total_size > max_size;
            if !exceeded_max_size || entries.is_empty() {
                entries.push(entry);
            }
            Ok(!exceeded_max_size)
        })?;

        if entries.len() as u64 == high - low || exceeded_max_size {
            return Ok(entries);
        }
        // A gap in the scan means the range is not fully present.
        Err(Error::Unavailable)
    }

    fn term_impl(&self, idx: u64) -> Result<u64> {
        if idx == self.truncated_index() {
            return Ok(self.truncated_term());
        }
        self.check_range(idx, idx + 1)?;
        if self.truncated_term() == self.last_term || idx == self.last_index_atomic() {
            return Ok(self.last_term);
        }
        let key = raft_log_key(self.cell.id, idx);
        let value = self.meta_engine.get(&key)?.ok_or(Error::Unavailable)?;
        Ok(decode_entry(&value, idx)?.term)
    }

    // ------------------------------------------------------------------
    // Snapshot generation
    // ------------------------------------------------------------------

    fn snapshot_impl(&self, request_index: u64) -> Result<Snapshot> {
        let mut state = self.snap_state.lock();

        let pending = match &*state {
            GenSnapState::Generating(rx) => Some(rx.try_recv()),
            GenSnapState::Idle => None,
        };
        if let Some(outcome) = pending {
            match outcome {
                Err(TryRecvError::Empty) => return Err(Error::TemporarilyUnavailable),
                Ok(Some(snap)) => {
                    *state = GenSnapState::Idle;
                    if self.validate_snap(&snap, request_index) {
                        self.snap_tried_cnt.store(0, Ordering::SeqCst);
                        return Ok(snap);
                    }
                    // Stale result: discard and count as a tried attempt.
                    self.snap_tried_cnt.fetch_add(1, Ordering::SeqCst);
                }
                Ok(None) | Err(TryRecvError::Disconnected) => {
                    *state = GenSnapState::Idle;
                    let tried = self.snap_tried_cnt.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!(
                        target: "raftstore",
                        cell = self.cell.id,
                        tried,
                        "snapshot generation failed"
                    );
                }
            }
        }

        if self.snap_tried_cnt.load(Ordering::SeqCst) >= self.max_snap_tries {
            let tried = self.snap_tried_cnt.swap(0, Ordering::SeqCst);
            return Err(Error::engine(format!(
                "{} failed to generate snapshot after {} tries",
                self.tag, tried
            )));
        }

        info!(target: "raftstore", cell = self.cell.id, "start generating snapshot");
        let (tx, rx) = bounded(1);
        self.snap_sched
            .send(SnapTask::Generate {
                cell_id: self.cell.id,
                notifier: tx,
            })
            .map_err(|_| Error::engine("snapshot worker unavailable"))?;
        *state = GenSnapState::Generating(rx);
        Err(Error::TemporarilyUnavailable)
    }

    fn validate_snap(&self, snap: &Snapshot, request_index: u64) -> bool {
        let meta = snap.get_metadata();
        if meta.index < request_index || meta.index < self.truncated_index() {
            warn!(
                target: "raftstore",
                cell = self.cell.id,
                index = meta.index,
                "generated snapshot is stale"
            );
            return false;
        }
        let data: SnapshotData = match decode(&snap.data) {
            Ok(data) => data,
            Err(e) => {
                warn!(
                    target: "raftstore",
                    cell = self.cell.id,
                    error = %e,
                    "generated snapshot is undecodable"
                );
                return false;
            }
        };
        let epoch = data.cell.epoch;
        let current = self.cell.epoch;
        if epoch.version < current.version || epoch.conf_version < current.conf_version {
            warn!(
                target: "raftstore",
                cell = self.cell.id,
                "generated snapshot carries a stale epoch"
            );
            return false;
        }
        true
    }
}

// ============================================================================
// Consensus storage contract
// ============================================================================

impl Storage for PeerStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        let hard_state = self.raft_state.hard_state;
        if hard_state.is_empty() {
            if self.is_initialized() {
                error!(
                    target: "raftstore",
                    cell = self.cell.id,
                    "initialized cell has empty hard state"
                );
                panic!("{} initialized cell with empty hard state", self.tag);
            }
            return Ok(RaftState::new(HardState::default(), ConfState::default()));
        }

        let mut conf_state = ConfState::default();
        conf_state.voters = self.cell.peers.iter().map(|p| p.id).collect();
        Ok(RaftState::new(hard_state.into(), conf_state))
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        let max_size = max_size.into().unwrap_or(u64::MAX);
        self.entries_impl(low, high, max_size).map_err(Into::into)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        self.term_impl(idx).map_err(Into::into)
    }

    fn first_index(&self) -> raft::Result<u64> {
        Ok(self.truncated_index() + 1)
    }

    fn last_index(&self) -> raft::Result<u64> {
        Ok(self.last_index_atomic())
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        self.snapshot_impl(request_index).map_err(Into::into)
    }
}

fn decode_entry(value: &[u8], expected_index: u64) -> Result<Entry> {
    let entry = Entry::decode(value).map_err(Error::corrupt)?;
    if entry.index != expected_index {
        return Err(Error::corrupt(format!(
            "log entry index {} does not match key index {}",
            entry.index, expected_index
        )));
    }
    Ok(entry)
}

/// Seed the durable state of a freshly initialized cell: descriptor in
/// Normal state plus raft and apply states at the initial log point.
/// Used by store bootstrap and by split when creating the right half.
pub fn write_initial_cell_state(meta_engine: &dyn KvEngine, cell: &Cell) -> Result<()> {
    let local_state = CellLocalState {
        state: PeerState::Normal,
        cell: cell.clone(),
    };
    meta_engine.set(&cell_state_key(cell.id), &encode(&local_state)?)?;

    let raft_state = RaftLocalState {
        hard_state: HardStateRecord {
            term: RAFT_INIT_LOG_TERM,
            vote: 0,
            commit: RAFT_INIT_LOG_INDEX,
        },
        last_index: RAFT_INIT_LOG_INDEX,
    };
    meta_engine.set(&raft_state_key(cell.id), &encode(&raft_state)?)?;

    let apply_state = RaftApplyState {
        applied_index: RAFT_INIT_LOG_INDEX,
        applied_index_term: RAFT_INIT_LOG_TERM,
        truncated: TruncatedState {
            index: RAFT_INIT_LOG_INDEX,
            term: RAFT_INIT_LOG_TERM,
        },
    };
    meta_engine.set(&apply_state_key(cell.id), &encode(&apply_state)?)?;
    Ok(())
}
