//! Snapshot worker: generation, data installation, range cleanup.
//!
//! At most one generate and one apply job are live per cell; the storage
//! side enforces that by holding the pending receiver (generation) and the
//! Applying peer state (installation).

use std::sync::Arc;

use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use raft::eraftpb::Snapshot;
use tracing::{debug, error, info, warn};

use crate::cell::storage::SnapshotData;
use crate::engine::{delete_range, KvEngine};
use crate::meta::keys::{apply_state_key, cell_state_key, raft_log_key};
use crate::meta::{decode, encode, Cell, CellLocalState, RaftApplyState};

/// Tasks handled by the snapshot worker.
pub enum SnapTask {
    /// Package the cell's current data into a snapshot and deliver it on
    /// `notifier` (`None` on failure).
    Generate {
        cell_id: u64,
        notifier: Sender<Option<Snapshot>>,
    },
    /// Install received snapshot data into the data engine.
    Apply {
        cell_id: u64,
        cell: Cell,
        kvs: Vec<(Vec<u8>, Vec<u8>)>,
    },
    /// Best-effort deletion of a destroyed cell's data range.
    CleanupRange {
        cell_id: u64,
        start_key: Vec<u8>,
        end_key: Vec<u8>,
    },
    /// Delete raft log entries `[first_index, compact_index]` made
    /// unavailable by an applied compaction.
    CompactRaftLog {
        cell_id: u64,
        first_index: u64,
        compact_index: u64,
    },
}

/// Completion of an applying-snapshot job, routed back to the store loop.
#[derive(Debug, Clone)]
pub struct SnapResult {
    pub cell_id: u64,
    pub success: bool,
}

/// Executes snapshot tasks against the two engines.
pub struct SnapRunner {
    meta_engine: Arc<dyn KvEngine>,
    data_engine: Arc<dyn KvEngine>,
    results: Sender<SnapResult>,
}

impl SnapRunner {
    pub fn new(
        meta_engine: Arc<dyn KvEngine>,
        data_engine: Arc<dyn KvEngine>,
        results: Sender<SnapResult>,
    ) -> Self {
        Self {
            meta_engine,
            data_engine,
            results,
        }
    }

    pub fn run(&self, task: SnapTask) {
        match task {
            SnapTask::Generate { cell_id, notifier } => {
                let snap = match self.generate(cell_id) {
                    Ok(snap) => {
                        info!(target: "raftstore", cell = cell_id, "snapshot generated");
                        Some(snap)
                    }
                    Err(e) => {
                        warn!(
                            target: "raftstore",
                            cell = cell_id,
                            error = %format!("{e:#}"),
                            "snapshot generation failed"
                        );
                        None
                    }
                };
                // The requesting cell may be gone; a dropped receiver is fine.
                let _ = notifier.send(snap);
            }
            SnapTask::Apply { cell_id, cell, kvs } => {
                let success = match self.install(&cell, kvs) {
                    Ok(count) => {
                        info!(
                            target: "raftstore",
                            cell = cell_id,
                            keys = count,
                            "snapshot data installed"
                        );
                        true
                    }
                    Err(e) => {
                        error!(
                            target: "raftstore",
                            cell = cell_id,
                            error = %format!("{e:#}"),
                            "snapshot data installation failed"
                        );
                        false
                    }
                };
                let _ = self.results.send(SnapResult { cell_id, success });
            }
            SnapTask::CleanupRange {
                cell_id,
                start_key,
                end_key,
            } => {
                if let Err(e) = delete_range(self.data_engine.as_ref(), &start_key, &end_key) {
                    error!(
                        target: "raftstore",
                        cell = cell_id,
                        error = %e,
                        "range cleanup failed"
                    );
                }
            }
            SnapTask::CompactRaftLog {
                cell_id,
                first_index,
                compact_index,
            } => {
                let start = raft_log_key(cell_id, first_index);
                let end = raft_log_key(cell_id, compact_index + 1);
                match delete_range(self.meta_engine.as_ref(), &start, &end) {
                    Ok(()) => debug!(
                        target: "raftstore",
                        cell = cell_id,
                        first_index,
                        compact_index,
                        "raft log compacted"
                    ),
                    Err(e) => error!(
                        target: "raftstore",
                        cell = cell_id,
                        error = %e,
                        "raft log compaction failed"
                    ),
                }
            }
        }
    }

    /// Build a snapshot at the cell's persisted apply point.
    fn generate(&self, cell_id: u64) -> Result<Snapshot> {
        let state: CellLocalState = self
            .meta_engine
            .get(&cell_state_key(cell_id))?
            .map(|v| decode(&v))
            .transpose()?
            .context("cell state missing")?;
        let apply_state: RaftApplyState = self
            .meta_engine
            .get(&apply_state_key(cell_id))?
            .map(|v| decode(&v))
            .transpose()?
            .context("apply state missing")?;

        let cell = state.cell;
        let mut kvs = Vec::new();
        self.data_engine
            .scan(&cell.start_key, &cell.end_key, &mut |key, value| {
                kvs.push((key.to_vec(), value.to_vec()));
                Ok(true)
            })?;

        let mut snap = Snapshot::default();
        let meta = snap.mut_metadata();
        meta.index = apply_state.applied_index;
        meta.term = apply_state.applied_index_term;
        meta.mut_conf_state().voters = cell.peers.iter().map(|p| p.id).collect();
        snap.data = encode(&SnapshotData { cell, kvs })?.into();
        Ok(snap)
    }

    fn install(&self, cell: &Cell, kvs: Vec<(Vec<u8>, Vec<u8>)>) -> Result<usize> {
        // Drop whatever the range held before; the snapshot is authoritative.
        delete_range(self.data_engine.as_ref(), &cell.start_key, &cell.end_key)?;
        let count = kvs.len();
        for (key, value) in kvs {
            self.data_engine.set(&key, &value)?;
        }
        Ok(count)
    }
}
