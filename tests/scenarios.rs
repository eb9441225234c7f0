//! Black-box scenario and invariant coverage (spec.md §8), driven purely
//! through the public `gtmcore` API against an in-process
//! `TransactionManager`, no networking involved.

use gtmcore::control_file::NullControlFile;
use gtmcore::gxid::Gxid;
use gtmcore::ids::{ClientId, ProxyConnId, SessionId};
use gtmcore::registry::{IsolationLevel, NewTxnArgs};
use gtmcore::sequence::NoopSequenceManager;
use gtmcore::TransactionManager;
use std::sync::Arc;

fn new_manager(n_max: usize) -> TransactionManager {
    let mgr = TransactionManager::new(
        n_max,
        false,
        256,
        Arc::new(NoopSequenceManager),
        Arc::new(NullControlFile),
    );
    mgr.start().unwrap();
    mgr
}

fn args(session: &str, client: u32) -> NewTxnArgs {
    NewTxnArgs {
        isolation: IsolationLevel::ReadCommitted,
        read_only: false,
        session_id: SessionId::new(session, 64).unwrap(),
        client_id: ClientId::new(client),
        proxy_conn_id: ProxyConnId::NONE,
        is_vacuum: false,
    }
}

/// Scenario 1: basic begin/commit.
#[test]
fn scenario_basic_begin_commit() {
    let mgr = new_manager(16);

    let (handle, gxid) = mgr.begin_get_gxid(IsolationLevel::ReadCommitted, false, SessionId::new("s1", 64).unwrap(), ClientId::new(1), ProxyConnId::NONE).unwrap();
    assert_eq!(gxid, Gxid::new(3));

    let result = mgr.commit_multi(&[handle], &[]);
    assert_eq!(result.statuses, vec![0]);
    assert_eq!(mgr.latest_completed_xid(), Gxid::new(3));
    assert_eq!(mgr.allocator().read_next(), Gxid::new(4));
}

/// Scenario 2: session reuse, then a fresh handle after commit.
#[test]
fn scenario_session_reuse_then_fresh_handle() {
    let mgr = new_manager(16);
    let session = SessionId::new("s1", 64).unwrap();

    let h1 = mgr.begin(IsolationLevel::ReadCommitted, false, session.clone(), ClientId::new(1), ProxyConnId::NONE).unwrap();
    let h2 = mgr.begin(IsolationLevel::ReadCommitted, false, session.clone(), ClientId::new(1), ProxyConnId::NONE).unwrap();
    assert_eq!(h1, h2);

    mgr.commit_multi(&[h1], &[]);

    let h3 = mgr.begin(IsolationLevel::ReadCommitted, false, session, ClientId::new(1), ProxyConnId::NONE).unwrap();
    assert_ne!(h3, h1);
}

/// Scenario 3: full two-phase commit.
#[test]
fn scenario_two_phase_commit() {
    let mgr = new_manager(16);

    let (handle, gxid) = mgr.begin_get_gxid(IsolationLevel::ReadCommitted, false, SessionId::empty(), ClientId::new(1), ProxyConnId::NONE).unwrap();
    assert_eq!(gxid, Gxid::new(3));

    let gid = gtmcore::ids::Gid::new("tx1", 64).unwrap();
    mgr.start_prepared(handle, gid.clone(), "n1,n2".to_string()).unwrap();
    mgr.prepare(handle).unwrap();

    let (new_handle, new_gxid, prepared_gxid, node_list) =
        mgr.get_gid_data(&gid, IsolationLevel::ReadCommitted, false).unwrap();
    assert_eq!(new_gxid, Gxid::new(4));
    assert_eq!(prepared_gxid, gxid);
    assert_eq!(node_list.as_deref(), Some("n1,n2"));

    let status = mgr.commit_prepared(new_handle, handle, &[]);
    assert_eq!(status, 0);
    assert_eq!(mgr.latest_completed_xid(), Gxid::new(4));
}

/// Scenario 4: a commit that must wait on another GXID is delayed, then
/// succeeds once the dependency clears.
#[test]
fn scenario_commit_wait_delay_then_retry() {
    let mgr = new_manager(16);

    let (h0, g0) = mgr.begin_get_gxid(IsolationLevel::ReadCommitted, false, SessionId::empty(), ClientId::new(1), ProxyConnId::NONE).unwrap();
    let (h1, _g1) = mgr.begin_get_gxid(IsolationLevel::ReadCommitted, false, SessionId::empty(), ClientId::new(1), ProxyConnId::NONE).unwrap();

    let delayed = mgr.commit_multi(&[h1], &[g0]);
    assert_eq!(delayed.statuses, vec![1]);

    let ok = mgr.commit_multi(&[h0], &[]);
    assert_eq!(ok.statuses, vec![0]);

    let retried = mgr.commit_multi(&[h1], &[g0]);
    assert_eq!(retried.statuses, vec![0]);
}

/// Scenario 5: client disconnect spares prepared/preparing transactions.
#[test]
fn scenario_remove_all_spares_prepared() {
    let mgr = new_manager(16);
    let client = ClientId::new(7);

    let h_inflight = mgr.begin(IsolationLevel::ReadCommitted, false, SessionId::empty(), client, ProxyConnId::NONE).unwrap();
    let h_prepared = mgr.begin(IsolationLevel::ReadCommitted, false, SessionId::empty(), client, ProxyConnId::NONE).unwrap();
    let gid = gtmcore::ids::Gid::new("tx-client7", 64).unwrap();
    mgr.start_prepared(h_prepared, gid.clone(), "n1".to_string()).unwrap();
    mgr.prepare(h_prepared).unwrap();

    let removed = mgr.remove_all(client, ProxyConnId::NONE);
    assert_eq!(removed, 1);

    assert!(mgr.gxid_of(h_inflight).is_err());
    let (h_again, ..) = mgr.get_gid_data(&gid, IsolationLevel::ReadCommitted, false).unwrap();
    assert!(mgr.gxid_of(h_again).is_ok());
}

/// Scenario 6: wraparound limits trigger a stop once the margin is spent.
/// Two fresh managers stand in for "next_xid=10" and "next_xid=20": the
/// allocator only accepts `set_next` once, during startup, so the two
/// halves of the scenario can't share one manager.
#[test]
fn scenario_wraparound_stop() {
    let warns = new_manager(16);
    warns.allocator().set_wraparound_limits(gtmcore::allocator::WraparoundLimits {
        vac_limit: Some(Gxid::new(5)),
        warn_limit: Gxid::new(10),
        stop_limit: Gxid::new(20),
    });
    let h = warns.begin(IsolationLevel::ReadCommitted, false, SessionId::empty(), ClientId::new(1), ProxyConnId::NONE).unwrap();
    assert!(warns.gxid_of(h).is_ok());

    let stops = new_manager(16);
    stops.allocator().set_wraparound_limits(gtmcore::allocator::WraparoundLimits {
        vac_limit: Some(Gxid::new(0)),
        warn_limit: Gxid::new(0),
        stop_limit: Gxid::new(0),
    });
    let result = stops.begin(IsolationLevel::ReadCommitted, false, SessionId::empty(), ClientId::new(1), ProxyConnId::NONE);
    assert!(matches!(result, Err(gtmcore::GtmError::WraparoundStop)));
}

/// R1: repeated begin on the same session returns the same handle.
#[test]
fn round_trip_same_session_same_handle() {
    let mgr = new_manager(16);
    let session = SessionId::new("s1", 64).unwrap();

    let h1 = mgr.begin(IsolationLevel::ReadCommitted, false, session.clone(), ClientId::new(1), ProxyConnId::NONE).unwrap();
    let h2 = mgr.begin(IsolationLevel::ReadCommitted, false, session, ClientId::new(1), ProxyConnId::NONE).unwrap();
    assert_eq!(h1, h2);
}

/// R2: begin/commit cycles eventually reuse a slot, bounded by `n_max`.
#[test]
fn round_trip_slot_reuse_bounded_by_n_max() {
    let mgr = new_manager(4);
    let mut seen_handles = std::collections::HashSet::new();

    for i in 0..32u32 {
        let h = mgr
            .begin(IsolationLevel::ReadCommitted, false, SessionId::empty(), ClientId::new(i), ProxyConnId::NONE)
            .unwrap();
        seen_handles.insert(h);
        mgr.commit_multi(&[h], &[]);
    }

    assert!(seen_handles.len() <= 4);
}

/// `begin_multi`'s no-rollback rule: a capacity failure midway through a
/// batch keeps every handle already allocated.
#[test]
fn begin_multi_keeps_earlier_handles_on_capacity_error() {
    let mgr = new_manager(2);
    let entries = vec![args("a", 1), args("b", 1), args("c", 1)];

    let result = mgr.begin_multi(entries);
    assert_eq!(result.handles.len(), 2);
    assert!(result.error.is_some());
}
