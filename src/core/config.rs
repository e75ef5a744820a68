//! Store configuration and validation.
//!
//! One `StoreConfig` is shared by every cell on the store. Sizes steer the
//! split check, tick counts steer the consensus library's timers, and the
//! pool sizes bound the background workers.

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, Result};

fn default_cell_split_size() -> u64 {
    64 * 1024 * 1024
}

fn default_cell_max_size() -> u64 {
    80 * 1024 * 1024
}

fn default_cell_check_size_diff() -> u64 {
    8 * 1024 * 1024
}

fn default_raft_tick_interval_ms() -> u64 {
    100
}

fn default_raft_election_ticks() -> usize {
    10
}

fn default_raft_heartbeat_ticks() -> usize {
    3
}

fn default_raft_max_size_per_msg() -> u64 {
    1024 * 1024
}

fn default_raft_max_inflight_msgs() -> usize {
    256
}

fn default_max_snap_tries() -> usize {
    5
}

fn default_read_queue_capacity() -> usize {
    1024
}

fn default_apply_pool_size() -> usize {
    2
}

/// Configuration for the raft integration core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Size past which the split check proposes a split key.
    #[serde(default = "default_cell_split_size")]
    pub cell_split_size: u64,

    /// Size at which a cell must split; the split check scan stops here.
    #[serde(default = "default_cell_max_size")]
    pub cell_max_size: u64,

    /// Accumulated size-diff hint that triggers a split check, and the
    /// seed hint given to a freshly split cell.
    #[serde(default = "default_cell_check_size_diff")]
    pub cell_check_size_diff: u64,

    /// Interval between consensus clock ticks.
    #[serde(default = "default_raft_tick_interval_ms")]
    pub raft_tick_interval_ms: u64,

    /// Ticks without leader contact before an election starts.
    #[serde(default = "default_raft_election_ticks")]
    pub raft_election_ticks: usize,

    /// Ticks between leader heartbeats.
    #[serde(default = "default_raft_heartbeat_ticks")]
    pub raft_heartbeat_ticks: usize,

    /// Byte budget for a single replication message.
    #[serde(default = "default_raft_max_size_per_msg")]
    pub raft_max_size_per_msg: u64,

    /// In-flight replication message window.
    #[serde(default = "default_raft_max_inflight_msgs")]
    pub raft_max_inflight_msgs: usize,

    /// Consecutive snapshot generation failures before failing hard.
    #[serde(default = "default_max_snap_tries")]
    pub max_snap_tries: usize,

    /// Capacity of each cell's pending-read queue.
    #[serde(default = "default_read_queue_capacity")]
    pub read_queue_capacity: usize,

    /// Number of apply worker threads; cells are pinned by id.
    #[serde(default = "default_apply_pool_size")]
    pub apply_pool_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cell_split_size: default_cell_split_size(),
            cell_max_size: default_cell_max_size(),
            cell_check_size_diff: default_cell_check_size_diff(),
            raft_tick_interval_ms: default_raft_tick_interval_ms(),
            raft_election_ticks: default_raft_election_ticks(),
            raft_heartbeat_ticks: default_raft_heartbeat_ticks(),
            raft_max_size_per_msg: default_raft_max_size_per_msg(),
            raft_max_inflight_msgs: default_raft_max_inflight_msgs(),
            max_snap_tries: default_max_snap_tries(),
            read_queue_capacity: default_read_queue_capacity(),
            apply_pool_size: default_apply_pool_size(),
        }
    }
}

impl StoreConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.cell_split_size == 0 || self.cell_max_size == 0 {
            return Err(Error::corrupt("cell sizes must be non-zero"));
        }
        if self.cell_split_size >= self.cell_max_size {
            return Err(Error::corrupt(
                "cell_split_size must be below cell_max_size",
            ));
        }
        if self.raft_election_ticks <= self.raft_heartbeat_ticks {
            return Err(Error::corrupt(
                "election ticks must exceed heartbeat ticks",
            ));
        }
        if self.raft_tick_interval_ms == 0 {
            return Err(Error::corrupt("raft tick interval must be non-zero"));
        }
        if self.max_snap_tries == 0 {
            return Err(Error::corrupt("max_snap_tries must be non-zero"));
        }
        if self.read_queue_capacity == 0 {
            return Err(Error::corrupt("read_queue_capacity must be non-zero"));
        }
        if self.apply_pool_size == 0 {
            return Err(Error::corrupt("apply_pool_size must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        StoreConfig::default().validate().unwrap();
    }

    #[test]
    fn split_size_must_stay_below_max() {
        let cfg = StoreConfig {
            cell_split_size: 100,
            cell_max_size: 100,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn heartbeat_must_stay_below_election() {
        let cfg = StoreConfig {
            raft_election_ticks: 3,
            raft_heartbeat_ticks: 3,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
