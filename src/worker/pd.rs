//! Placement-driver worker.
//!
//! The PD client is an RPC boundary and must never run on the raft worker.
//! Cells schedule heartbeat, ask-split and report-split tasks here; an
//! ask-split answer turns into an admin split command submitted back
//! through the store's command channel.

use std::sync::Arc;

use crossbeam_channel::{bounded, Sender};
use tracing::{debug, error, info};

use crate::cmd::{new_header, AdminRequest, Cmd, CmdRequest};
use crate::meta::{Cell, Peer};
use crate::pd::PdClient;

/// Tasks handled by the PD worker.
pub enum PdTask {
    /// Ask PD for ids for a split at `split_key`, then propose the split.
    AskSplit {
        cell: Cell,
        peer: Peer,
        split_key: Vec<u8>,
    },
    /// Report the cell and its current leader.
    CellHeartbeat { cell: Cell, leader: Peer },
    /// Report a finished split.
    ReportSplit { left: Cell, right: Cell },
}

/// Executes PD tasks against the client, feeding resulting admin commands
/// back into the store loop.
pub struct PdRunner {
    pd_client: Arc<dyn PdClient>,
    cmd_tx: Sender<Cmd>,
}

impl PdRunner {
    pub fn new(pd_client: Arc<dyn PdClient>, cmd_tx: Sender<Cmd>) -> Self {
        Self { pd_client, cmd_tx }
    }

    pub fn run(&self, task: PdTask) {
        match task {
            PdTask::AskSplit {
                cell,
                peer,
                split_key,
            } => self.ask_split(cell, peer, split_key),
            PdTask::CellHeartbeat { cell, leader } => {
                if let Err(e) = self.pd_client.cell_heartbeat(cell, leader) {
                    debug!(target: "raftstore", error = %format!("{e:#}"), "cell heartbeat failed");
                }
            }
            PdTask::ReportSplit { left, right } => {
                if let Err(e) = self.pd_client.report_split(left, right) {
                    error!(target: "raftstore", error = %format!("{e:#}"), "report split failed");
                }
            }
        }
    }

    fn ask_split(&self, cell: Cell, peer: Peer, split_key: Vec<u8>) {
        let rsp = match self.pd_client.ask_split(&cell) {
            Ok(rsp) => rsp,
            Err(e) => {
                debug!(
                    target: "raftstore",
                    cell = cell.id,
                    error = %format!("{e:#}"),
                    "ask split failed"
                );
                return;
            }
        };

        info!(
            target: "raftstore",
            cell = cell.id,
            new_cell = rsp.new_cell_id,
            "proposing admin split"
        );

        let request = CmdRequest {
            header: new_header(cell.id, peer, cell.epoch),
            requests: Vec::new(),
            admin: Some(AdminRequest::Split {
                new_cell_id: rsp.new_cell_id,
                split_key,
                new_peer_ids: rsp.new_peer_ids,
            }),
        };

        // The split outcome is observed through the applied exec result,
        // not through this notifier.
        let (tx, _rx) = bounded(1);
        if self.cmd_tx.send(Cmd::new(request, tx)).is_err() {
            error!(target: "raftstore", cell = cell.id, "store loop gone, split dropped");
        }
    }
}
