//! Tests for the per-cell runtime: pending reads, the apply delegate and
//! the replica driver.

mod common;

use std::sync::Arc;
use std::time::Duration;

use cellstore::engine::KvEngine;
use common::{new_cell, new_data_cmd, wait_for, Harness};
use crossbeam_channel::{unbounded, Receiver};
use raft::eraftpb::{Message, MessageType};

use cellstore::apply::{ApplyDelegate, ApplyRunner, AsyncApplyResult};
use cellstore::bootstrap::bootstrap_first_cell;
use cellstore::cell::replicate::PeerReplicate;
use cellstore::cell::read_queue::ReadIndexQueue;
use cellstore::cmd::{
    new_header, AdminRequest, AdminResponse, Cmd, CmdRequest, CmdResponse, ConfChangeKind,
    Request, Response,
};
use cellstore::core::error::Error;
use cellstore::meta::{encode, Peer, RaftApplyState, TruncatedState};
use cellstore::transport::{CellMessage, ChannelTransport, Transport};
use common::new_entry;

// ============================================================================
// ReadIndexQueue
// ============================================================================

#[test]
fn read_queue_preserves_fifo_order() {
    let cell = new_cell(1, b"a", b"z", &[(1, 1)]);
    let queue = ReadIndexQueue::new(1, 16);

    let mut expected = Vec::new();
    for _ in 0..3 {
        let (cmd, _rx, uuid) = new_data_cmd(&cell, 1, vec![Request::Get { key: b"k".to_vec() }], true);
        expected.push(uuid);
        queue.push(cmd).unwrap();
    }

    for uuid in expected {
        let cmd = queue.pop().expect("queued command");
        assert_eq!(cmd.uuid(), uuid);
    }
    assert!(queue.pop().is_none());
}

#[test]
fn read_queue_concurrent_push_pop_loses_nothing() {
    let cell = new_cell(1, b"a", b"z", &[(1, 1)]);
    let queue = Arc::new(ReadIndexQueue::new(1, 64));

    let mut expected = Vec::new();
    let mut cmds = Vec::new();
    for _ in 0..200 {
        let (cmd, _rx, uuid) = new_data_cmd(&cell, 1, vec![Request::Get { key: b"k".to_vec() }], true);
        expected.push(uuid);
        cmds.push(cmd);
    }

    let producer_queue = queue.clone();
    let producer = std::thread::spawn(move || {
        for cmd in cmds {
            let mut cmd = cmd;
            loop {
                match producer_queue.push(cmd) {
                    Ok(()) => break,
                    Err(back) => {
                        cmd = back;
                        std::thread::yield_now();
                    }
                }
            }
        }
    });

    let mut popped = Vec::new();
    while popped.len() < 200 {
        match queue.pop() {
            Some(cmd) => popped.push(cmd.uuid()),
            None => std::thread::yield_now(),
        }
    }
    producer.join().unwrap();

    assert_eq!(popped, expected);
    assert!(queue.pop().is_none());
}

#[test]
fn read_queue_ready_count() {
    let queue = ReadIndexQueue::new(1, 4);
    assert_eq!(queue.get_ready(), 0);
    assert_eq!(queue.incr_ready(), 1);
    assert_eq!(queue.incr_ready(), 2);
    assert_eq!(queue.decr_ready(), 1);
    queue.reset_ready();
    assert_eq!(queue.get_ready(), 0);
}

#[test]
fn read_queue_rejects_past_capacity() {
    let cell = new_cell(1, b"a", b"z", &[(1, 1)]);
    let queue = ReadIndexQueue::new(1, 1);
    let (c1, _rx1, _) = new_data_cmd(&cell, 1, vec![Request::Get { key: b"k".to_vec() }], true);
    let (c2, _rx2, _) = new_data_cmd(&cell, 1, vec![Request::Get { key: b"k".to_vec() }], true);
    assert!(queue.push(c1).is_ok());
    assert!(queue.push(c2).is_err());
}

// ============================================================================
// ApplyDelegate
// ============================================================================

fn new_delegate(harness: &Harness, cell: cellstore::meta::Cell) -> ApplyDelegate {
    ApplyDelegate::new(
        harness.meta_engine.clone(),
        harness.data_engine.clone(),
        cell,
        RaftApplyState::default(),
        0,
    )
}

fn put_request(cell: &cellstore::meta::Cell, key: &[u8], value: &[u8]) -> (Cmd, Receiver<CmdResponse>, CmdRequest) {
    let (cmd, rx, _) = new_data_cmd(
        cell,
        1,
        vec![Request::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        }],
        false,
    );
    let request = cmd.request.clone();
    (cmd, rx, request)
}

#[test]
fn pending_change_peer_is_superseded_as_stale() {
    let harness = Harness::new(1);
    let cell = new_cell(1, b"a", b"z", &[(1, 1)]);
    let mut delegate = new_delegate(&harness, cell.clone());

    let (first, first_rx, _) = new_data_cmd(&cell, 1, vec![], false);
    let (second, second_rx, _) = new_data_cmd(&cell, 1, vec![], false);

    delegate.set_pending_change_peer(5, first);
    assert!(first_rx.try_recv().is_err());

    delegate.set_pending_change_peer(5, second);
    let resp = first_rx.try_recv().unwrap();
    assert!(matches!(resp.error, Some(Error::StaleCommand { .. })));
    assert!(second_rx.try_recv().is_err());
}

#[test]
fn proposals_resolve_by_uuid_and_term() {
    let harness = Harness::new(1);
    let cell = new_cell(1, b"a", b"z", &[(1, 1)]);
    let mut delegate = new_delegate(&harness, cell.clone());

    // A proposal that was superseded by another leader's log.
    let (skipped, skipped_rx, _) = put_request(&cell, b"b", b"lost");
    delegate.append_pending_cmd(5, skipped);

    // A proposal registered at the wrong term.
    let (wrong_term, wrong_term_rx, wrong_term_req) = put_request(&cell, b"c", b"old");
    delegate.append_pending_cmd(4, wrong_term);

    let entry = new_entry(1, 5, &encode(&wrong_term_req).unwrap());
    let result = delegate.apply_committed_entries(5, vec![entry]);

    // The skipped head and the term-mismatched proposal are both stale.
    let resp = skipped_rx.try_recv().unwrap();
    assert!(matches!(resp.error, Some(Error::StaleCommand { .. })));
    let resp = wrong_term_rx.try_recv().unwrap();
    assert!(matches!(resp.error, Some(Error::StaleCommand { .. })));

    // The write itself still applied.
    assert_eq!(result.apply_state.applied_index, 1);
    assert_eq!(
        harness.data_engine.get(b"c").unwrap(),
        Some(b"old".to_vec())
    );

    // A matching proposal gets its response.
    let (matching, matching_rx, matching_req) = put_request(&cell, b"d", b"new");
    delegate.append_pending_cmd(5, matching);
    let entry = new_entry(2, 5, &encode(&matching_req).unwrap());
    let result = delegate.apply_committed_entries(5, vec![entry]);

    let resp = matching_rx.try_recv().unwrap();
    assert!(resp.is_ok());
    assert_eq!(resp.responses, vec![Response::Put]);
    assert!(result.metrics.written_keys >= 1);
}

#[test]
fn compact_log_advances_truncated_state() {
    let harness = Harness::new(1);
    let cell = new_cell(1, b"a", b"z", &[(1, 1)]);
    let mut delegate = new_delegate(&harness, cell.clone());

    for i in 1..=3u64 {
        let (_, _rx, req) = put_request(&cell, format!("k{i}").as_bytes(), b"v");
        let entry = new_entry(i, 5, &encode(&req).unwrap());
        delegate.apply_committed_entries(5, vec![entry]);
    }

    let header = new_header(1, Peer::new(1, 1), cell.epoch);
    let request = CmdRequest {
        header,
        requests: vec![],
        admin: Some(AdminRequest::CompactLog {
            compact_index: 3,
            compact_term: 5,
        }),
    };
    let (tx, rx) = unbounded();
    delegate.append_pending_cmd(5, Cmd::new(request.clone(), tx));

    let entry = new_entry(4, 5, &encode(&request).unwrap());
    let result = delegate.apply_committed_entries(5, vec![entry]);

    let expected = TruncatedState { index: 3, term: 5 };
    assert_eq!(result.apply_state.truncated, expected);
    match result.exec_result {
        Some(cellstore::apply::ExecResult::CompactLog {
            state,
            prev_first_index,
        }) => {
            assert_eq!(state, expected);
            assert_eq!(prev_first_index, 1);
        }
        other => panic!("unexpected exec result: {other:?}"),
    }
    let resp = rx.try_recv().unwrap();
    assert!(matches!(resp.admin, Some(AdminResponse::CompactLog { .. })));
}

// ============================================================================
// PeerReplicate
// ============================================================================

struct LeaderCell {
    harness: Harness,
    pr: PeerReplicate,
    trans: ChannelTransport,
    trans_rx: Receiver<CellMessage>,
    runner: ApplyRunner,
    result_rx: Receiver<AsyncApplyResult>,
}

/// A single-replica cell elected leader, with the initial no-op entry of
/// its term still waiting in the apply queue.
fn leader_cell() -> LeaderCell {
    common::init_tracing();
    let harness = Harness::new(1);
    let cell = new_cell(1, b"a", b"z", &[(1, 1)]);
    bootstrap_first_cell(harness.meta_engine.as_ref(), &cell).unwrap();

    let mut pr = harness.replicate(cell);
    let (trans, trans_rx) = ChannelTransport::new();
    pr.campaign().unwrap();
    drain_ready(&mut pr, &trans);
    assert!(pr.is_leader());

    let (result_tx, result_rx) = unbounded();
    let runner = ApplyRunner::new(harness.delegates.clone(), result_tx);
    LeaderCell {
        harness,
        pr,
        trans,
        trans_rx,
        runner,
        result_rx,
    }
}

fn drain_ready(pr: &mut PeerReplicate, trans: &dyn Transport) {
    while pr.has_ready() {
        pr.handle_ready(trans).unwrap();
    }
}

/// Run queued apply batches and feed their results back, until the cell
/// is idle.
fn run_applies(lc: &mut LeaderCell) {
    loop {
        let mut progressed = false;
        while let Ok(task) = lc.harness.apply_rx.try_recv() {
            lc.runner.run(task);
            progressed = true;
        }
        while let Ok(result) = lc.result_rx.try_recv() {
            lc.pr.post_apply(&result);
            progressed = true;
        }
        drain_ready(&mut lc.pr, &lc.trans);
        if !progressed {
            break;
        }
    }
}

#[test]
fn write_proposal_round_trip() {
    let mut lc = leader_cell();
    run_applies(&mut lc);

    let cell = lc.pr.cell().clone();
    let (cmd, rx, _) = new_data_cmd(
        &cell,
        1,
        vec![Request::Put {
            key: b"b".to_vec(),
            value: b"v".to_vec(),
        }],
        false,
    );
    lc.pr.propose(cmd);
    run_applies(&mut lc);

    let resp = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(resp.is_ok());
    assert_eq!(resp.responses, vec![Response::Put]);
    assert_eq!(
        lc.harness.data_engine.get(b"b").unwrap(),
        Some(b"v".to_vec())
    );
    assert!(lc.pr.written_keys >= 1);
}

#[test]
fn stale_epoch_proposal_is_rejected() {
    let mut lc = leader_cell();
    run_applies(&mut lc);

    let mut stale_cell = lc.pr.cell().clone();
    stale_cell.epoch.version = 0;
    let (cmd, rx, _) = new_data_cmd(
        &stale_cell,
        1,
        vec![Request::Put {
            key: b"b".to_vec(),
            value: b"v".to_vec(),
        }],
        false,
    );
    lc.pr.propose(cmd);

    let resp = rx.try_recv().unwrap();
    assert!(matches!(resp.error, Some(Error::StaleEpoch { .. })));
}

#[test]
fn read_deferred_until_applied_term_catches_up() {
    let mut lc = leader_cell();
    lc.harness.data_engine.set(b"b", b"v").unwrap();

    // The no-op entry of the new term is still queued: the leader's
    // applied term lags its current term.
    assert!(!lc.pr.ready_to_handle_read());

    let cell = lc.pr.cell().clone();
    let (cmd, rx, _) = new_data_cmd(&cell, 1, vec![Request::Get { key: b"b".to_vec() }], true);
    lc.pr.propose(cmd);
    drain_ready(&mut lc.pr, &lc.trans);

    // The read state arrived but the read is only counted, not serviced.
    assert_eq!(lc.pr.pending_reads.get_ready(), 1);
    assert!(rx.try_recv().is_err());

    // Applying the no-op catches the term up and drains the read.
    run_applies(&mut lc);
    let resp = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(resp.is_ok());
    assert_eq!(
        resp.responses,
        vec![Response::Get {
            value: Some(b"v".to_vec())
        }]
    );
    assert_eq!(lc.pr.pending_reads.get_ready(), 0);
}

#[test]
fn ready_reads_fail_as_stale_on_leadership_loss() {
    let mut lc = leader_cell();

    let cell = lc.pr.cell().clone();
    let (cmd, rx, _) = new_data_cmd(&cell, 1, vec![Request::Get { key: b"b".to_vec() }], true);
    lc.pr.propose(cmd);
    drain_ready(&mut lc.pr, &lc.trans);
    assert_eq!(lc.pr.pending_reads.get_ready(), 1);

    // A higher-term message dethrones the leader.
    let mut msg = Message::default();
    msg.set_msg_type(MessageType::MsgHeartbeat);
    msg.to = 1;
    msg.from = 99;
    msg.term = lc.pr.term() + 1;
    lc.pr.step(msg).unwrap();
    drain_ready(&mut lc.pr, &lc.trans);

    assert!(!lc.pr.is_leader());
    let resp = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(matches!(resp.error, Some(Error::StaleCommand { .. })));
    assert_eq!(lc.pr.pending_reads.get_ready(), 0);
}

#[test]
fn served_reads_match_submission_order() {
    let mut lc = leader_cell();
    run_applies(&mut lc);
    lc.harness.data_engine.set(b"b", b"1").unwrap();
    lc.harness.data_engine.set(b"c", b"2").unwrap();

    let cell = lc.pr.cell().clone();
    let (r1, rx1, _) = new_data_cmd(&cell, 1, vec![Request::Get { key: b"b".to_vec() }], true);
    let (r2, rx2, _) = new_data_cmd(&cell, 1, vec![Request::Get { key: b"c".to_vec() }], true);
    lc.pr.propose(r1);
    lc.pr.propose(r2);
    drain_ready(&mut lc.pr, &lc.trans);

    // Term already caught up, so both reads serviced immediately, each
    // against its own pending entry.
    let resp = rx1.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(
        resp.responses,
        vec![Response::Get {
            value: Some(b"1".to_vec())
        }]
    );
    let resp = rx2.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(
        resp.responses,
        vec![Response::Get {
            value: Some(b"2".to_vec())
        }]
    );
}

#[test]
fn change_peer_proposal_supersedes_previous() {
    let mut lc = leader_cell();
    run_applies(&mut lc);

    let cell = lc.pr.cell().clone();
    let make_change = |peer: Peer| {
        let header = new_header(cell.id, Peer::new(1, 1), cell.epoch);
        let request = CmdRequest {
            header,
            requests: vec![],
            admin: Some(AdminRequest::ChangePeer {
                change_type: ConfChangeKind::AddNode,
                peer,
            }),
        };
        let (tx, rx) = unbounded();
        (Cmd::new(request, tx), rx)
    };

    let (first, first_rx) = make_change(Peer::new(2, 2));
    lc.pr.propose(first);
    assert!(first_rx.try_recv().is_err());

    let (second, second_rx) = make_change(Peer::new(3, 3));
    lc.pr.propose(second);

    let resp = first_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(matches!(resp.error, Some(Error::StaleCommand { .. })));
    assert!(second_rx.try_recv().is_err());
}

#[test]
fn leader_election_heartbeats_pd() {
    let lc = leader_cell();
    wait_for(Duration::from_secs(1), || lc.harness.pd_rx.len() >= 1);
    match lc.harness.pd_rx.try_recv().unwrap() {
        cellstore::worker::pd::PdTask::CellHeartbeat { cell, leader } => {
            assert_eq!(cell.id, 1);
            assert_eq!(leader.id, 1);
        }
        _ => panic!("expected heartbeat task"),
    }
    // No raft messages leave a single-replica cell.
    assert!(lc.trans_rx.try_recv().is_err());
}
