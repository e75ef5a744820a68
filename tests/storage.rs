//! Tests for the per-cell durable storage and the consensus storage
//! contract.

mod common;

use std::time::Duration;

use common::{append_entries, new_cell, new_entry, wait_for, Harness};
use crossbeam_channel::unbounded;
use prost::Message as _;
use raft::eraftpb::Snapshot;
use raft::{Error as RaftError, GetEntriesContext, Storage, StorageError};

use cellstore::bootstrap::bootstrap_first_cell;
use cellstore::config::StoreConfig;
use cellstore::engine::KvEngine;
use cellstore::meta::keys::{apply_state_key, cell_state_key, raft_log_prefix, raft_state_key};
use cellstore::meta::{
    decode, encode, CellLocalState, PeerState, RaftApplyState, TruncatedState,
};
use cellstore::storage::SnapshotData;
use cellstore::worker::snap::{SnapRunner, SnapTask};

fn ctx() -> GetEntriesContext {
    GetEntriesContext::empty(false)
}

fn is_unavailable(err: RaftError) -> bool {
    matches!(err, RaftError::Store(StorageError::Unavailable))
}

fn count_log_entries(harness: &Harness, cell_id: u64) -> usize {
    let mut count = 0;
    harness
        .meta_engine
        .scan(
            &raft_log_prefix(cell_id),
            &raft_state_key(cell_id),
            &mut |_, _| {
                count += 1;
                Ok(true)
            },
        )
        .unwrap();
    count
}

// ============================================================================
// Log append and read
// ============================================================================

#[test]
fn appended_range_is_fully_readable() {
    common::init_tracing();
    let harness = Harness::new(1);
    let mut ps = harness.storage(new_cell(1, b"", b"", &[]));

    let entries: Vec<_> = (1..=10).map(|i| new_entry(i, 2, b"x")).collect();
    append_entries(&mut ps, &entries);

    assert_eq!(ps.first_index().unwrap(), 1);
    assert_eq!(ps.last_index().unwrap(), 10);
    for i in 1..=10 {
        let got = ps.entries(i, i + 1, None, ctx()).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].index, i);
        assert_eq!(got[0].term, 2);
    }

    assert!(is_unavailable(ps.entries(0, 1, None, ctx()).unwrap_err()));
    assert!(is_unavailable(ps.entries(11, 12, None, ctx()).unwrap_err()));
    assert!(is_unavailable(ps.entries(5, 12, None, ctx()).unwrap_err()));
}

#[test]
fn overwrite_deletes_uncommitted_tail() {
    let harness = Harness::new(1);
    let mut ps = harness.storage(new_cell(1, b"", b"", &[]));

    let old: Vec<_> = (1..=10).map(|i| new_entry(i, 2, b"old")).collect();
    append_entries(&mut ps, &old);

    // A new leader rewrites indices 6..=8; 9 and 10 never committed.
    let new: Vec<_> = (6..=8).map(|i| new_entry(i, 3, b"new")).collect();
    append_entries(&mut ps, &new);

    assert_eq!(ps.last_index().unwrap(), 8);
    assert_eq!(count_log_entries(&harness, 1), 8);
    for i in 1..=5 {
        assert_eq!(ps.term(i).unwrap(), 2);
    }
    for i in 6..=8 {
        assert_eq!(ps.term(i).unwrap(), 3);
    }
    assert!(is_unavailable(ps.entries(9, 10, None, ctx()).unwrap_err()));
    assert!(is_unavailable(ps.entries(1, 11, None, ctx()).unwrap_err()));
}

#[test]
fn entries_respects_byte_budget() {
    let harness = Harness::new(1);
    let mut ps = harness.storage(new_cell(1, b"", b"", &[]));

    let entries: Vec<_> = (1..=5).map(|i| new_entry(i, 2, b"payload")).collect();
    let entry_size = entries[0].encode_to_vec().len() as u64;
    append_entries(&mut ps, &entries);

    // No budget still yields one entry.
    let got = ps.entries(1, 6, 0u64, ctx()).unwrap();
    assert_eq!(got.len(), 1);

    // A budget for two entries yields entries until it is exceeded.
    let got = ps.entries(1, 6, 2 * entry_size, ctx()).unwrap();
    assert_eq!(got.len(), 2);

    // A generous budget yields the whole range.
    let got = ps.entries(1, 6, None, ctx()).unwrap();
    assert_eq!(got.len(), 5);
    assert_eq!(got[4].index, 5);
}

#[test]
fn term_uses_fast_paths() {
    let harness = Harness::new(1);
    let mut ps = harness.storage(new_cell(1, b"", b"", &[]));

    let mut entries: Vec<_> = (1..=5).map(|i| new_entry(i, 2, b"x")).collect();
    entries.extend((6..=10).map(|i| new_entry(i, 3, b"x")));
    append_entries(&mut ps, &entries);

    // Truncated point.
    assert_eq!(ps.term(0).unwrap(), 0);
    // Cached last term.
    assert_eq!(ps.term(10).unwrap(), 3);
    // Engine lookup in the middle.
    assert_eq!(ps.term(4).unwrap(), 2);
    assert!(ps.term(11).is_err());
}

#[test]
fn initial_state_of_uninitialized_cell_is_empty() {
    let harness = Harness::new(1);
    let ps = harness.storage(new_cell(1, b"", b"", &[]));

    let state = ps.initial_state().unwrap();
    assert_eq!(state.hard_state.commit, 0);
    assert_eq!(state.hard_state.term, 0);
    assert!(state.conf_state.voters.is_empty());
}

#[test]
fn initial_state_carries_peers() {
    let harness = Harness::new(1);
    let cell = new_cell(1, b"a", b"z", &[(1, 1), (2, 2)]);
    bootstrap_first_cell(harness.meta_engine.as_ref(), &cell).unwrap();

    let ps = harness.storage(cell);
    let state = ps.initial_state().unwrap();
    assert_eq!(state.hard_state.commit, 5);
    assert_eq!(state.conf_state.voters, vec![1, 2]);
}

// ============================================================================
// Snapshot apply
// ============================================================================

#[test]
fn snapshot_onto_initialized_cell_resets_all_state() {
    common::init_tracing();
    let harness = Harness::new(1);
    let cell = new_cell(1, b"a", b"z", &[(1, 1)]);
    bootstrap_first_cell(harness.meta_engine.as_ref(), &cell).unwrap();
    let mut ps = harness.storage(cell.clone());

    let entries: Vec<_> = (6..=50).map(|i| new_entry(i, 5, b"x")).collect();
    append_entries(&mut ps, &entries);
    ps.set_apply_state(
        RaftApplyState {
            applied_index: 40,
            applied_index_term: 5,
            truncated: TruncatedState { index: 5, term: 5 },
        },
        5,
    );

    let mut snap_cell = new_cell(1, b"a", b"z", &[(1, 1), (2, 2), (3, 3)]);
    snap_cell.epoch.conf_version = 3;
    let mut snap = Snapshot::default();
    snap.mut_metadata().index = 100;
    snap.mut_metadata().term = 7;
    snap.data = encode(&SnapshotData {
        cell: snap_cell.clone(),
        kvs: vec![(b"b".to_vec(), b"v".to_vec())],
    })
    .unwrap()
    .into();

    let mut ictx = cellstore::storage::InvokeContext::new(&ps);
    ps.append_snapshot(&mut ictx, &snap).unwrap();
    ps.persist(&ictx).unwrap();
    let result = ps.do_apply_snap(&mut ictx).unwrap().expect("snap result");

    // All log entries of the cell are gone from the meta engine.
    assert_eq!(count_log_entries(&harness, 1), 0);

    // Durable apply state collapsed onto the snapshot point.
    let persisted: RaftApplyState = decode(
        &harness
            .meta_engine
            .get(&apply_state_key(1))
            .unwrap()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(persisted.applied_index, 100);
    assert_eq!(persisted.applied_index_term, 7);
    assert_eq!(persisted.truncated, TruncatedState { index: 100, term: 7 });

    // Peer is applying, with the new peer set installed.
    assert_eq!(ps.peer_state(), PeerState::Applying);
    let local: CellLocalState = decode(
        &harness
            .meta_engine
            .get(&cell_state_key(1))
            .unwrap()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(local.state, PeerState::Applying);
    assert_eq!(ps.cell().peers.len(), 3);
    assert_eq!(result.prev_cell, cell);
    assert_eq!(result.cell, snap_cell);

    // Log accessors reflect the snapshot point.
    assert_eq!(ps.first_index().unwrap(), 101);
    assert_eq!(ps.last_index().unwrap(), 100);
    assert_eq!(ps.term(100).unwrap(), 7);
    assert!(ps.entries(101, 101, None, ctx()).unwrap().is_empty());

    // The data-installation job was scheduled exactly once.
    match harness.snap_rx.try_recv().unwrap() {
        SnapTask::Apply { cell_id, kvs, .. } => {
            assert_eq!(cell_id, 1);
            assert_eq!(kvs.len(), 1);
        }
        _ => panic!("expected apply task"),
    }
    assert!(harness.snap_rx.try_recv().is_err());

    // Completion returns the peer to normal.
    ps.finish_apply_snap().unwrap();
    assert_eq!(ps.peer_state(), PeerState::Normal);
}

// ============================================================================
// Snapshot generation
// ============================================================================

#[test]
fn snapshot_generation_is_asynchronous_and_single_flight() {
    let harness = Harness::new(1);
    let cell = new_cell(1, b"a", b"z", &[(1, 1)]);
    bootstrap_first_cell(harness.meta_engine.as_ref(), &cell).unwrap();
    let ps = harness.storage(cell);

    let err = ps.snapshot(0, 2).unwrap_err();
    assert!(matches!(
        err,
        RaftError::Store(StorageError::SnapshotTemporarilyUnavailable)
    ));
    assert_eq!(harness.snap_rx.len(), 1);

    // A second request while generating does not schedule another job.
    let err = ps.snapshot(0, 2).unwrap_err();
    assert!(matches!(
        err,
        RaftError::Store(StorageError::SnapshotTemporarilyUnavailable)
    ));
    assert_eq!(harness.snap_rx.len(), 1);
}

#[test]
fn completed_generation_is_returned_once_valid() {
    let harness = Harness::new(1);
    let cell = new_cell(1, b"a", b"z", &[(1, 1)]);
    bootstrap_first_cell(harness.meta_engine.as_ref(), &cell).unwrap();
    harness.data_engine.set(b"b", b"v").unwrap();
    let ps = harness.storage(cell);

    assert!(ps.snapshot(0, 2).is_err());
    let task = harness.snap_rx.try_recv().unwrap();

    // Run the generation job the way the snapshot worker would.
    let (result_tx, _result_rx) = unbounded();
    let runner = SnapRunner::new(
        harness.meta_engine.clone(),
        harness.data_engine.clone(),
        result_tx,
    );
    runner.run(task);

    let snap = ps.snapshot(0, 2).unwrap();
    assert_eq!(snap.get_metadata().index, 5);
    assert_eq!(snap.get_metadata().term, 5);
    let data: SnapshotData = decode(&snap.data).unwrap();
    assert_eq!(data.kvs, vec![(b"b".to_vec(), b"v".to_vec())]);
}

#[test]
fn generation_failures_hit_the_retry_cap_then_reset() {
    common::init_tracing();
    let cfg = StoreConfig {
        max_snap_tries: 2,
        ..Default::default()
    };
    let harness = Harness::with_config(1, cfg);
    let cell = new_cell(1, b"a", b"z", &[(1, 1)]);
    bootstrap_first_cell(harness.meta_engine.as_ref(), &cell).unwrap();
    let ps = harness.storage(cell);

    let fail_current_job = || match harness.snap_rx.recv_timeout(Duration::from_secs(1)) {
        Ok(SnapTask::Generate { notifier, .. }) => notifier.send(None).unwrap(),
        other => panic!("expected generate task, got {:?}", other.is_ok()),
    };

    // First request starts a job; two consecutive failures reach the cap.
    assert!(ps.snapshot(0, 2).is_err());
    fail_current_job();
    assert!(matches!(
        ps.snapshot(0, 2).unwrap_err(),
        RaftError::Store(StorageError::SnapshotTemporarilyUnavailable)
    ));
    fail_current_job();

    // The cap surfaces a permanent error and resets the counter.
    let err = ps.snapshot(0, 2).unwrap_err();
    assert!(matches!(err, RaftError::Store(StorageError::Other(_))));

    // The next request restarts generation from scratch.
    assert!(matches!(
        ps.snapshot(0, 2).unwrap_err(),
        RaftError::Store(StorageError::SnapshotTemporarilyUnavailable)
    ));
    wait_for(Duration::from_secs(1), || harness.snap_rx.len() == 1);
}
