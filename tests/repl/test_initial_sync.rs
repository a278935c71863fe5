use super::mock::*;
use repl_sync::executor::LockMode;
use repl_sync::{ReplError, ReplicatorState};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

#[test]
fn test_initial_sync_happy_path() {
    let h = Harness::new(Some("src:27017"));
    // newest oplog entry before cloning, then again after cloning.
    h.network.enqueue("find:latest", latest_ts_resp(100));
    h.network.enqueue("find:latest", latest_ts_resp(150));
    h.network.enqueue(
        "find:oplog",
        cursor_batch("local.oplog.rs", 7, true, oplog_range(100, 120)),
    );
    h.network.enqueue(
        "getMore",
        cursor_batch("local.oplog.rs", 7, false, oplog_range(121, 150)),
    );
    h.network.enqueue("listDatabases", list_databases_resp(&["a", "b", "c"]));
    // keep the tail alive quietly afterwards.
    h.network.set_default(|req| {
        std::thread::sleep(Duration::from_millis(10));
        match key_of(req).as_str() {
            "getMore" => cursor_batch("local.oplog.rs", 7, false, vec![]),
            "find:oplog" => {
                let start = req
                    .cmd
                    .get_document("filter")
                    .and_then(|f| f.get_document("ts"))
                    .and_then(|t| t.get_timestamp("$gte"))
                    .map(|t| t.time)
                    .unwrap_or(150);
                cursor_batch("local.oplog.rs", 0, true, oplog_range(start, start))
            }
            other => Err(ReplError::Network(format!("unexpected command {}", other))),
        }
    });

    let (applier, ops_applied, _calls) = counting_applier(0);
    let repl = h.replicator(h.options(applier), true);

    let result = repl.initial_sync().unwrap();
    assert_eq!(result, ts(150));

    let stats = repl.stats();
    assert_eq!(stats.state, ReplicatorState::Uninitialized);
    assert!(stats.applied_ops >= 51);
    assert_eq!(stats.last_timestamp_applied, ts(150));
    assert!(ops_applied.load(Ordering::SeqCst) >= 51);
    // every database the source listed was cloned.
    assert_eq!(*h.factory.made.lock().unwrap(), vec!["a", "b", "c"]);
    // the coordinator heard about our progress.
    let updates = h.coord.optime_updates.lock().unwrap();
    assert_eq!(updates.last().map(|o| o.ts), Some(ts(150)));
    drop(updates);

    // done syncing; steady replication may start.
    repl.start().unwrap();
    repl.shutdown().unwrap();
    drop(repl);
    h.exec.shutdown();
}

#[test]
fn test_initial_sync_fetches_missing_document_and_retries() {
    let h = Harness::new(Some("src:27017"));
    h.network.enqueue("find:latest", latest_ts_resp(100));
    h.network.enqueue("find:latest", latest_ts_resp(110));
    h.network.enqueue(
        "find:oplog",
        cursor_batch("local.oplog.rs", 0, true, oplog_range(100, 110)),
    );
    h.network.enqueue("listDatabases", list_databases_resp(&["testdb"]));
    h.network.enqueue(
        "find:missing",
        cursor_batch("test.coll", 0, true, vec![bson::doc! {"_id": 100, "a": 100}]),
    );
    h.network.set_default(|req| {
        std::thread::sleep(Duration::from_millis(10));
        match key_of(req).as_str() {
            "find:oplog" => cursor_batch("local.oplog.rs", 0, true, oplog_range(110, 110)),
            "getMore" => cursor_batch("local.oplog.rs", 0, false, vec![]),
            other => Err(ReplError::Network(format!("unexpected command {}", other))),
        }
    });

    // first apply fails as if an update referenced a document we never
    // cloned; the retry then goes through.
    let (applier, _ops, calls) = counting_applier(1);
    let repl = h.replicator(h.options(applier), true);

    let result = repl.initial_sync().unwrap();
    assert_eq!(result, ts(110));
    assert!(calls.load(Ordering::SeqCst) >= 2);

    // the missing document went in under an intent-exclusive lock.
    let inserts = h.storage.missing_inserts.lock().unwrap();
    assert_eq!(inserts.len(), 1);
    let (ns, doc, mode) = &inserts[0];
    assert_eq!(ns, "test.coll");
    assert_eq!(doc.get_i32("_id").unwrap(), 100);
    assert_eq!(*mode, LockMode::Ix);
    drop(inserts);

    assert_eq!(repl.stats().fetched_missing_docs, 1);
    drop(repl);
    h.exec.shutdown();
}

#[test]
fn test_initial_sync_retries_exhaust_with_failpoint() {
    let h = Harness::new(Some("src:27017"));
    let (applier, _ops, _calls) = counting_applier(0);
    let mut opts = h.options(applier);
    opts.initial_sync_retry_wait = Duration::from_millis(5);
    opts.fail_initial_sync_with_bad_host.enable();
    let repl = h.replicator(opts, true);

    let started = Instant::now();
    match repl.initial_sync() {
        Err(ReplError::InitialSyncFailure(msg)) => {
            assert!(msg.contains("maximum number of retries"));
        }
        other => panic!("unexpected result: {:?}", other),
    }
    // ten attempts, each separated by the retry wait.
    assert!(started.elapsed() >= Duration::from_millis(10 * 5));
    // the failpoint fires before any remote traffic.
    assert!(h.network.requests().is_empty());
    assert_eq!(repl.stats().state, ReplicatorState::Uninitialized);
    drop(repl);
    h.exec.shutdown();
}

#[test]
fn test_initial_sync_without_any_sync_source() {
    let h = Harness::new(Some("src:27017"));
    let (applier, _ops, _calls) = counting_applier(0);
    let repl = h.replicator(h.options(applier), false); // no coordinator, no option source

    match repl.initial_sync() {
        Err(ReplError::InitialSyncFailure(_)) => {}
        other => panic!("unexpected result: {:?}", other),
    }
    drop(repl);
    h.exec.shutdown();
}

#[test]
fn test_initial_sync_state_guards() {
    let h = Harness::new(Some("src:27017"));
    // every attempt stalls on a slow failing latest-ts probe, keeping the
    // replicator in InitialSync long enough to poke at it.
    h.network.set_default(|_req| {
        std::thread::sleep(Duration::from_millis(20));
        Err(ReplError::Network("source down".to_string()))
    });
    let (applier, _ops, _calls) = counting_applier(0);
    let repl = std::sync::Arc::new(h.replicator(h.options(applier), true));

    let bg = {
        let repl = repl.clone();
        std::thread::spawn(move || repl.initial_sync())
    };
    assert!(wait_until(Duration::from_secs(2), || {
        repl.stats().state == ReplicatorState::InitialSync
    }));
    match repl.initial_sync() {
        Err(ReplError::InvalidRoleModification(_)) => {}
        other => panic!("unexpected result: {:?}", other),
    }

    // network errors burn through all attempts.
    match bg.join().unwrap() {
        Err(ReplError::InitialSyncFailure(_)) => {}
        other => panic!("unexpected result: {:?}", other),
    }

    // once steady, initial sync is refused outright.
    repl.start().unwrap();
    match repl.initial_sync() {
        Err(ReplError::AlreadyInitialized(_)) => {}
        other => panic!("unexpected result: {:?}", other),
    }
    match repl.start() {
        Err(ReplError::IllegalOperation(_)) => {}
        other => panic!("unexpected result: {:?}", other),
    }
    repl.shutdown().unwrap();
    drop(repl);
    h.exec.shutdown();
}

#[test]
fn test_resync_drops_user_databases_first() {
    let h = Harness::new(Some("src:27017"));
    h.network.enqueue("find:latest", latest_ts_resp(10));
    h.network.enqueue("find:latest", latest_ts_resp(12));
    h.network.enqueue(
        "find:oplog",
        cursor_batch("local.oplog.rs", 0, true, oplog_range(10, 12)),
    );
    h.network.enqueue("listDatabases", list_databases_resp(&["a"]));
    h.network.set_default(|req| {
        std::thread::sleep(Duration::from_millis(10));
        match key_of(req).as_str() {
            "find:oplog" => cursor_batch("local.oplog.rs", 0, true, oplog_range(12, 12)),
            "getMore" => cursor_batch("local.oplog.rs", 0, false, vec![]),
            other => Err(ReplError::Network(format!("unexpected command {}", other))),
        }
    });

    let (applier, _ops, _calls) = counting_applier(0);
    let repl = h.replicator(h.options(applier), true);

    let result = repl.resync().unwrap();
    assert_eq!(result, ts(12));
    assert_eq!(h.storage.dropped_user_dbs.load(Ordering::SeqCst), 1);
    drop(repl);
    h.exec.shutdown();
}
