//! Split check worker.
//!
//! Scans a cell's data range, summing value sizes until either the scan
//! completes or the size crosses the configured maximum. The first key
//! past the split size becomes the proposed split key. Cells below the
//! maximum are left alone.

use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::{debug, warn};

use crate::engine::KvEngine;
use crate::meta::CellEpoch;

/// A scheduled scan over one cell's range.
pub struct SplitCheckTask {
    pub cell_id: u64,
    pub epoch: CellEpoch,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
}

/// A cell that crossed the maximum size and should ask for a split.
#[derive(Debug, Clone)]
pub struct SplitCheckResult {
    pub cell_id: u64,
    pub split_key: Vec<u8>,
    pub epoch: CellEpoch,
}

/// Executes split checks against the data engine.
pub struct SplitCheckRunner {
    data_engine: Arc<dyn KvEngine>,
    split_size: u64,
    max_size: u64,
    results: Sender<SplitCheckResult>,
}

impl SplitCheckRunner {
    pub fn new(
        data_engine: Arc<dyn KvEngine>,
        split_size: u64,
        max_size: u64,
        results: Sender<SplitCheckResult>,
    ) -> Self {
        Self {
            data_engine,
            split_size,
            max_size,
            results,
        }
    }

    pub fn run(&self, task: SplitCheckTask) {
        let mut size = 0u64;
        let mut split_key = Vec::new();

        let res = self
            .data_engine
            .scan(&task.start_key, &task.end_key, &mut |key, value| {
                size += value.len() as u64;
                if split_key.is_empty() && size > self.split_size {
                    split_key = key.to_vec();
                }
                Ok(size <= self.max_size)
            });
        if let Err(e) = res {
            warn!(
                target: "raftstore",
                cell = task.cell_id,
                error = %e,
                "split check scan failed"
            );
            return;
        }

        if size < self.max_size {
            debug!(
                target: "raftstore",
                cell = task.cell_id,
                size,
                max = self.max_size,
                "no need to split"
            );
            return;
        }

        let _ = self.results.send(SplitCheckResult {
            cell_id: task.cell_id,
            split_key,
            epoch: task.epoch,
        });
    }
}
