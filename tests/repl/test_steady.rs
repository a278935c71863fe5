use super::mock::*;
use repl_sync::{MemberState, ReplError, ReplicatorState};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

#[test]
fn test_steady_tails_and_applies() {
    let h = Harness::new(Some("s1:27017"));
    h.coord.set_last_optime(500);
    h.network.enqueue(
        "find:oplog",
        cursor_batch("local.oplog.rs", 0, true, oplog_range(500, 505)),
    );
    h.network.enqueue(
        "find:oplog",
        cursor_batch("local.oplog.rs", 9, true, oplog_range(505, 510)),
    );
    h.network.set_default(|req| {
        std::thread::sleep(Duration::from_millis(10));
        match key_of(req).as_str() {
            "getMore" => cursor_batch("local.oplog.rs", 9, false, vec![]),
            "replSetUpdatePosition" => ok_resp(),
            "find:oplog" => cursor_batch("local.oplog.rs", 9, true, oplog_range(510, 510)),
            other => Err(ReplError::Network(format!("unexpected command {}", other))),
        }
    });

    let (applier, ops_applied, _calls) = counting_applier(0);
    let repl = h.replicator(h.options(applier), true);
    repl.start().unwrap();

    assert!(wait_until(Duration::from_secs(3), || {
        repl.stats().last_timestamp_applied == ts(510)
    }));
    assert!(ops_applied.load(Ordering::SeqCst) >= 11);
    assert_eq!(repl.stats().state, ReplicatorState::Steady);

    // progress flowed to the coordinator and out through the reporter.
    let updates = h.coord.optime_updates.lock().unwrap();
    assert_eq!(updates.last().map(|o| o.ts), Some(ts(510)));
    drop(updates);
    assert!(wait_until(Duration::from_secs(2), || {
        !h.network.requests_keyed("replSetUpdatePosition").is_empty()
    }));

    repl.shutdown().unwrap();
    drop(repl);
    h.exec.shutdown();
}

#[test]
fn test_oplog_start_missing_blacklists_and_rotates_source() {
    let h = Harness::new(Some("s2:27017"));
    h.coord.set_last_optime(500);
    h.coord.push_source(Some("s1:27017"));
    let penalty = Duration::from_secs(300);

    // s1 no longer has ts=500; its first batch starts past it.
    h.network.enqueue(
        "find:oplog",
        cursor_batch("local.oplog.rs", 0, true, vec![bson::doc! {"ts": ts(501)}]),
    );
    h.network.set_default(|req| {
        std::thread::sleep(Duration::from_millis(10));
        match key_of(req).as_str() {
            "find:oplog" => cursor_batch("local.oplog.rs", 0, true, oplog_range(500, 500)),
            "getMore" => cursor_batch("local.oplog.rs", 0, false, vec![]),
            "replSetUpdatePosition" => ok_resp(),
            other => Err(ReplError::Network(format!("unexpected command {}", other))),
        }
    });

    let (applier, _ops, _calls) = counting_applier(0);
    let mut opts = h.options(applier);
    opts.blacklist_oplog_start_missing_penalty = penalty;
    opts.blacklist_network_error_penalty = Duration::from_secs(7);
    let before = Instant::now();
    let repl = h.replicator(opts, true);
    repl.start().unwrap();

    // rollback is impossible (no common point), so the node drops to
    // RECOVERING and blacklists the source.
    assert!(wait_until(Duration::from_secs(2), || {
        !h.coord.blacklisted.lock().unwrap().is_empty()
    }));
    let (host, until) = h.coord.blacklisted.lock().unwrap()[0].clone();
    assert_eq!(host, "s1:27017");
    let hold = until - before;
    assert!(hold >= penalty - Duration::from_millis(50), "hold = {:?}", hold);
    assert!(hold <= penalty + Duration::from_secs(5), "hold = {:?}", hold);
    assert!(h
        .coord
        .follower_modes
        .lock()
        .unwrap()
        .contains(&MemberState::Recovering));
    assert_eq!(repl.stats().state, ReplicatorState::Steady);
    assert!(repl.stats().rollback_common_optime.is_none());

    // the dispatcher re-asked the coordinator and moved to the next source.
    assert!(wait_until(Duration::from_secs(2), || {
        h.network
            .requests_keyed("find:oplog")
            .iter()
            .any(|r| r.target == "s2:27017")
    }));

    repl.shutdown().unwrap();
    drop(repl);
    h.exec.shutdown();
}

#[test]
fn test_rollback_entered_when_common_point_exists() {
    let h = Harness::new(Some("s1:27017"));
    h.coord.set_last_optime(500);
    h.network.enqueue(
        "find:oplog",
        cursor_batch("local.oplog.rs", 0, true, vec![bson::doc! {"ts": ts(501)}]),
    );
    h.network.set_default(|_req| {
        std::thread::sleep(Duration::from_millis(10));
        Err(ReplError::Network("quiet".to_string()))
    });

    let (applier, _ops, _calls) = counting_applier(0);
    let mut opts = h.options(applier);
    opts.find_common_point = Some(std::sync::Arc::new(|_source, _last_applied| Some(ts(450))));
    let repl = h.replicator(opts, true);
    repl.start().unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        repl.stats().state == ReplicatorState::Rollback
    }));
    assert_eq!(repl.stats().rollback_common_optime, Some(ts(450)));
    // no RECOVERING transition on the rollback path.
    assert!(h.coord.follower_modes.lock().unwrap().is_empty());

    repl.shutdown().unwrap();
    drop(repl);
    h.exec.shutdown();
}

#[test]
fn test_shutdown_mid_stream_is_idempotent() {
    let h = Harness::new(Some("s1:27017"));
    h.coord.set_last_optime(500);
    h.network.enqueue(
        "find:oplog",
        cursor_batch("local.oplog.rs", 7, true, oplog_range(500, 520)),
    );
    h.network.set_default(|req| {
        std::thread::sleep(Duration::from_millis(20));
        match key_of(req).as_str() {
            "getMore" => cursor_batch("local.oplog.rs", 7, false, vec![]),
            "replSetUpdatePosition" => ok_resp(),
            other => Err(ReplError::Network(format!("unexpected command {}", other))),
        }
    });

    // a slow applier keeps a batch in flight while we shut down.
    let (applier, ops_applied, _calls) = {
        let (inner, ops, calls) = counting_applier(0);
        let slow: repl_sync::ApplierFn = std::sync::Arc::new(move |txn, ops| {
            std::thread::sleep(Duration::from_millis(30));
            inner(txn, ops)
        });
        (slow, ops, calls)
    };
    let repl = h.replicator(h.options(applier), true);
    repl.start().unwrap();

    // wait until the stream is really moving.
    assert!(wait_until(Duration::from_secs(2), || {
        ops_applied.load(Ordering::SeqCst) > 0 || repl.stats().buffered_ops > 0
    }));

    repl.shutdown().unwrap();
    repl.shutdown().unwrap();

    // canceled callbacks are silent: nothing blows up afterwards and no
    // further progress is recorded.
    let applied_after = repl.stats().last_timestamp_applied;
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(repl.stats().last_timestamp_applied, applied_after);
    drop(repl);
    h.exec.shutdown();
}

#[test]
fn test_buffer_backpressure_preserves_every_op() {
    let h = Harness::new(None);
    h.network.enqueue(
        "find:oplog",
        cursor_batch("local.oplog.rs", 0, true, oplog_range(1, 40)),
    );
    h.network.set_default(|req| {
        std::thread::sleep(Duration::from_millis(10));
        match key_of(req).as_str() {
            "find:oplog" => cursor_batch("local.oplog.rs", 0, true, oplog_range(40, 40)),
            "getMore" => cursor_batch("local.oplog.rs", 0, false, vec![]),
            other => Err(ReplError::Network(format!("unexpected command {}", other))),
        }
    });

    let (applier, ops_applied, _calls) = counting_applier(0);
    let mut opts = h.options(applier);
    // a cap far below the 40-op batch forces the fetch callback to block
    // until the applier frees space.
    opts.oplog_buffer_max_bytes = 200;
    opts.sync_source = Some("s1:27017".to_string());
    opts.start_timestamp = ts(1);
    let repl = h.replicator(opts, false);
    repl.start().unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        repl.stats().last_timestamp_applied == ts(40)
    }));
    // order preserved, nothing dropped: every op up to 40 went through.
    assert!(ops_applied.load(Ordering::SeqCst) >= 40);

    repl.shutdown().unwrap();
    drop(repl);
    h.exec.shutdown();
}
