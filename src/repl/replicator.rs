//! The replication state machine: initial sync, steady oplog tailing and
//! the rollback decision, driven entirely by executor callbacks.

use crate::config::ReplicatorOptions;
use crate::executor::{Event, Executor, LockMode};
use crate::ns::Namespace;
use crate::repl::applier::{Applier, ApplierDoneFn, Operations};
use crate::repl::buffer::{doc_size, OplogBuffer};
use crate::repl::cloner::{ClonerFinishFn, DatabaseClonerFactory, DatabasesCloner};
use crate::repl::coord::{MemberState, OpTime, ReplicationCoordinator};
use crate::repl::fetcher::{BatchData, NextAction, OplogFetcher, QueryCallback, QueryFetcher};
use crate::repl::reporter::Reporter;
use crate::repl::storage::StorageInterface;
use crate::time_helper;
use crate::{ReplError, Result, ID_KEY, NAMESPACE_KEY, OBJ2_KEY, TIMESTAMP_KEY};
use bson::{doc, Timestamp};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;
use tracing::{error, info, warn};

const MAX_FAILED_ATTEMPTS: usize = 10;

// Batch bounds for draining the oplog buffer into the applier.
const APPLIER_BATCH_LIMIT_OPS: usize = 5000;
const APPLIER_BATCH_LIMIT_BYTES: usize = 100 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorState {
    Uninitialized,
    InitialSync,
    Steady,
    Rollback,
}

impl fmt::Display for ReplicatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReplicatorState::Uninitialized => "Uninitialized",
            ReplicatorState::InitialSync => "InitialSync",
            ReplicatorState::Steady => "Steady Replication",
            ReplicatorState::Rollback => "Rollback",
        };
        f.write_str(s)
    }
}

fn null_ts() -> Timestamp {
    Timestamp {
        time: 0,
        increment: 0,
    }
}

fn is_null_ts(ts: Timestamp) -> bool {
    ts.time == 0 && ts.increment == 0
}

/// State held for the duration of one initial sync attempt.
struct InitialSyncState {
    dbs_cloner: Arc<DatabasesCloner>,
    /// the source's newest oplog `ts` captured before cloning started.
    begin_timestamp: Timestamp,
    /// minvalid: the position we must apply through before initial sync can
    /// end.  Captured after cloning finished.
    stop_timestamp: Timestamp,
    finish_event: Event,
    /// terminal status; the first one recorded wins.
    status: Option<Result<()>>,
    applied_ops: usize,
    fetched_missing_docs: usize,
}

impl InitialSyncState {
    fn new(dbs_cloner: Arc<DatabasesCloner>, finish_event: Event) -> InitialSyncState {
        InitialSyncState {
            dbs_cloner,
            begin_timestamp: null_ts(),
            stop_timestamp: null_ts(),
            finish_event,
            status: None,
            applied_ops: 0,
            fetched_missing_docs: 0,
        }
    }

    fn set_status(&mut self, s: Result<()>) {
        if self.status.is_none() {
            self.status = Some(s);
        }
    }
}

struct Core {
    state: ReplicatorState,
    sync_source: Option<String>,
    fetcher: Option<Arc<OplogFetcher>>,
    tmp_fetcher: Option<Arc<QueryFetcher>>,
    applier: Option<Arc<Applier>>,
    reporter: Option<Arc<Reporter>>,
    initial_sync: Option<InitialSyncState>,
    last_timestamp_fetched: Timestamp,
    last_timestamp_applied: Timestamp,
    applier_active: bool,
    applier_paused: bool,
    fetcher_paused: bool,
    reporter_paused: bool,
    do_shutdown: bool,
    on_shutdown: Option<Event>,
    rollback_common_optime: Option<Timestamp>,
    applied_ops_total: usize,
    fetched_missing_docs_total: usize,
}

/// Everything owned by the replicator, gathered so shutdown and drop can
/// cancel outside the core mutex.
struct OwnedHandles {
    fetcher: Option<Arc<OplogFetcher>>,
    tmp_fetcher: Option<Arc<QueryFetcher>>,
    applier: Option<Arc<Applier>>,
    reporter: Option<Arc<Reporter>>,
    cloner: Option<Arc<DatabasesCloner>>,
}

impl OwnedHandles {
    fn cancel_all(&self) {
        if let Some(f) = &self.fetcher {
            f.cancel();
        }
        if let Some(f) = &self.tmp_fetcher {
            f.cancel();
        }
        if let Some(a) = &self.applier {
            a.cancel();
        }
        if let Some(r) = &self.reporter {
            r.cancel();
        }
        if let Some(c) = &self.cloner {
            c.cancel();
        }
    }

    fn wait_all(&self) {
        if let Some(f) = &self.fetcher {
            f.wait();
        }
        if let Some(f) = &self.tmp_fetcher {
            f.wait();
        }
        if let Some(a) = &self.applier {
            a.wait();
        }
        if let Some(r) = &self.reporter {
            r.wait();
        }
        if let Some(c) = &self.cloner {
            c.wait();
        }
    }
}

/// Point-in-time observability snapshot.
#[derive(Debug, Clone)]
pub struct ReplicatorStats {
    pub state: ReplicatorState,
    pub last_timestamp_applied: Timestamp,
    pub last_timestamp_fetched: Timestamp,
    pub buffered_ops: usize,
    pub applied_ops: usize,
    pub fetched_missing_docs: usize,
    pub rollback_common_optime: Option<Timestamp>,
}

struct ReplicatorInner {
    weak_self: Weak<ReplicatorInner>,
    opts: ReplicatorOptions,
    exec: Arc<dyn Executor>,
    coord: Option<Arc<dyn ReplicationCoordinator>>,
    storage: Arc<dyn StorageInterface>,
    cloner_factory: Arc<dyn DatabaseClonerFactory>,
    buffer: OplogBuffer,
    core: Mutex<Core>,
}

/// Brings this node's data up to date with a sync source and keeps it
/// current.  See the module docs for the three modes of operation.
pub struct Replicator {
    inner: Arc<ReplicatorInner>,
}

impl Replicator {
    pub fn new(
        opts: ReplicatorOptions,
        exec: Arc<dyn Executor>,
        coord: Option<Arc<dyn ReplicationCoordinator>>,
        storage: Arc<dyn StorageInterface>,
        cloner_factory: Arc<dyn DatabaseClonerFactory>,
    ) -> Replicator {
        let buffer = OplogBuffer::new(opts.oplog_buffer_max_bytes);
        Replicator {
            inner: Arc::new_cyclic(|weak| ReplicatorInner {
                weak_self: weak.clone(),
                opts,
                exec,
                coord,
                storage,
                cloner_factory,
                buffer,
                core: Mutex::new(Core {
                    state: ReplicatorState::Uninitialized,
                    sync_source: None,
                    fetcher: None,
                    tmp_fetcher: None,
                    applier: None,
                    reporter: None,
                    initial_sync: None,
                    last_timestamp_fetched: null_ts(),
                    last_timestamp_applied: null_ts(),
                    applier_active: false,
                    applier_paused: false,
                    fetcher_paused: false,
                    reporter_paused: false,
                    do_shutdown: false,
                    on_shutdown: None,
                    rollback_common_optime: None,
                    applied_ops_total: 0,
                    fetched_missing_docs_total: 0,
                }),
            }),
        }
    }

    /// Enter steady replication.  Only legal from `Uninitialized`.
    pub fn start(&self) -> Result<()> {
        let inner = self.inner.clone();
        let mut core = inner.core.lock().unwrap();
        if core.state != ReplicatorState::Uninitialized {
            return Err(ReplError::IllegalOperation(format!(
                "already started in another state: {}",
                core.state
            )));
        }
        core.state = ReplicatorState::Steady;
        core.applier_paused = false;
        core.fetcher_paused = false;
        core.reporter_paused = false;
        inner.do_next_actions_steady_inlock(&mut core);
        Ok(())
    }

    /// Full copy of all user databases followed by oplog catch-up.  Blocks
    /// until the sync succeeds or ten attempts have been exhausted, and
    /// returns the last applied timestamp.
    pub fn initial_sync(&self) -> Result<Timestamp> {
        let inner = self.inner.clone();
        let timer = Instant::now();
        let mut core = inner.core.lock().unwrap();
        match core.state {
            ReplicatorState::Uninitialized => {}
            ReplicatorState::InitialSync => {
                return Err(ReplError::InvalidRoleModification(
                    "already doing initial sync; try resync".to_string(),
                ))
            }
            other => {
                return Err(ReplError::AlreadyInitialized(format!(
                    "cannot do initial sync in {} state",
                    other
                )))
            }
        }

        core.state = ReplicatorState::InitialSync;
        if let Some(r) = core.reporter.clone() {
            r.cancel();
        }
        core.reporter_paused = true;
        core.applier_paused = true;

        let mut failed_attempts = 0usize;
        loop {
            if core.do_shutdown {
                core.state = ReplicatorState::Uninitialized;
                return Err(ReplError::ShutdownInProgress);
            }
            let mut attempt_status: Result<()> = Ok(());
            if inner.opts.fail_initial_sync_with_bad_host.is_enabled() {
                attempt_status = Err(ReplError::InvalidSyncSource(
                    "no sync source avail.".to_string(),
                ));
            }
            if attempt_status.is_ok() && core.sync_source.is_none() {
                if let Err(e) = inner.ensure_good_sync_source_inlock(&mut core) {
                    attempt_status = Err(e);
                }
            }
            if attempt_status.is_ok() {
                let source = core.sync_source.clone().unwrap_or_default();
                match inner.exec.make_event() {
                    Err(e) => attempt_status = Err(e),
                    Ok(finish_event) => {
                        let weak = Arc::downgrade(&inner);
                        let finish: ClonerFinishFn = Box::new(move |status| {
                            if let Some(inner) = weak.upgrade() {
                                inner.on_data_cloner_finish(status);
                            }
                        });
                        let dbs_cloner = Arc::new(DatabasesCloner::new(
                            inner.exec.clone(),
                            &source,
                            inner.storage.clone(),
                            inner.cloner_factory.clone(),
                            finish,
                        ));
                        core.initial_sync = Some(InitialSyncState::new(
                            dbs_cloner.clone(),
                            finish_event.clone(),
                        ));
                        drop(core);

                        // the source's newest entry marks where cloning
                        // begins; oplog tailing starts there in parallel
                        // with the cloners.
                        let begin = fetch_latest_oplog_ts(
                            &inner.exec,
                            &source,
                            &inner.opts.remote_oplog_ns,
                        );
                        core = inner.core.lock().unwrap();
                        match begin {
                            Err(e) => attempt_status = Err(e),
                            Ok(begin_ts) => {
                                info!(begin_ts = %time_helper::to_datetime(&begin_ts),
                                      "initial sync attempt starting");
                                if let Some(ist) = core.initial_sync.as_mut() {
                                    ist.begin_timestamp = begin_ts;
                                }
                                let weak = Arc::downgrade(&inner);
                                let cb: QueryCallback = Arc::new(move |result, next| {
                                    if let Some(inner) = weak.upgrade() {
                                        inner.on_oplog_fetch_finish(result, next);
                                    }
                                });
                                let fetcher = Arc::new(OplogFetcher::new(
                                    inner.exec.clone(),
                                    begin_ts,
                                    &source,
                                    &inner.opts.remote_oplog_ns,
                                    cb,
                                ));
                                core.fetcher = Some(fetcher.clone());
                                drop(core);
                                match fetcher.schedule() {
                                    Err(e) => attempt_status = Err(e),
                                    Ok(()) => {
                                        // cloner failures surface through
                                        // the finish event.
                                        let _ = dbs_cloner.start();
                                        inner.exec.wait_for_event(&finish_event);
                                    }
                                }
                                core = inner.core.lock().unwrap();
                                if attempt_status.is_ok() {
                                    attempt_status = core
                                        .initial_sync
                                        .as_ref()
                                        .and_then(|i| i.status.clone())
                                        .unwrap_or_else(|| {
                                            Err(ReplError::IllegalOperation(
                                                "initial sync state lost".to_string(),
                                            ))
                                        });
                                }
                            }
                        }
                    }
                }
            }

            if attempt_status.is_ok() {
                break;
            }

            failed_attempts += 1;
            if let Err(e) = &attempt_status {
                error!(
                    attempts_left = MAX_FAILED_ATTEMPTS - failed_attempts,
                    ?e,
                    "initial sync attempt failed"
                );
            }

            // tear the attempt down so the next one starts clean.
            let handles = OwnedHandles {
                fetcher: core.fetcher.take(),
                tmp_fetcher: core.tmp_fetcher.take(),
                applier: core.applier.take(),
                reporter: None,
                cloner: core.initial_sync.take().map(|i| i.dbs_cloner),
            };
            core.applier_active = false;
            core.applier_paused = true;
            core.last_timestamp_fetched = core.last_timestamp_applied;
            drop(core);
            handles.cancel_all();
            handles.wait_all();
            inner.buffer.clear();

            std::thread::sleep(inner.opts.initial_sync_retry_wait);

            if failed_attempts >= MAX_FAILED_ATTEMPTS {
                let err = "The maximum number of retries have been exhausted for initial sync.";
                error!("{}", err);
                inner.core.lock().unwrap().state = ReplicatorState::Uninitialized;
                return Err(ReplError::InitialSyncFailure(err.to_string()));
            }
            core = inner.core.lock().unwrap();
        }

        // success: reset the attempt machinery; steady replication resumes
        // from the applied position.
        let last_applied = core.last_timestamp_applied;
        core.last_timestamp_fetched = last_applied;
        core.reporter_paused = false;
        core.fetcher_paused = false;
        core.applier_paused = false;
        core.applier_active = false;
        let handles = OwnedHandles {
            fetcher: core.fetcher.take(),
            tmp_fetcher: core.tmp_fetcher.take(),
            applier: core.applier.take(),
            reporter: None,
            cloner: core.initial_sync.take().map(|i| i.dbs_cloner),
        };
        drop(core);
        handles.cancel_all();
        handles.wait_all();
        inner.buffer.clear();
        info!(
            took_ms = timer.elapsed().as_millis() as u64,
            last_applied = %time_helper::to_datetime(&last_applied),
            "initial sync finished"
        );
        Ok(last_applied)
    }

    /// Drop all user databases and run initial sync from scratch.
    pub fn resync(&self) -> Result<Timestamp> {
        self.shutdown()?;
        {
            let mut core = self.inner.core.lock().unwrap();
            core.do_shutdown = false;
            core.on_shutdown = None;
            core.state = ReplicatorState::Uninitialized;
            core.sync_source = None;
            core.fetcher = None;
            core.tmp_fetcher = None;
            core.applier = None;
            core.reporter = None;
            core.initial_sync = None;
            core.applier_active = false;
            core.last_timestamp_applied = null_ts();
            core.last_timestamp_fetched = null_ts();
        }
        self.inner.buffer.clear();

        let storage = self.inner.storage.clone();
        let handle = self.inner.exec.schedule_db_work(
            Box::new(move |args, txn| {
                if args.is_canceled() {
                    return;
                }
                if let Err(e) = storage.drop_user_databases(txn) {
                    error!(?e, "failed to drop user databases");
                }
            }),
            None,
            LockMode::X,
        )?;
        self.inner.exec.wait(&handle);

        self.initial_sync()
    }

    /// Wait out the in-flight batch, then stop applying.
    pub fn pause(&self) -> Result<()> {
        let applier = self.inner.core.lock().unwrap().applier.clone();
        if let Some(a) = applier {
            a.wait();
        }
        let mut core = self.inner.core.lock().unwrap();
        core.applier_paused = true;
        core.applier = None;
        Ok(())
    }

    pub fn resume(&self, wait: bool) -> Result<()> {
        let weak = Arc::downgrade(&self.inner);
        let handle = self.inner.exec.schedule_work(Box::new(move |args| {
            if args.is_canceled() {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                {
                    let mut core = inner.core.lock().unwrap();
                    core.fetcher_paused = false;
                    core.applier_paused = false;
                }
                inner.do_next_actions();
            }
        }))?;
        if wait {
            self.inner.exec.wait(&handle);
        }
        Ok(())
    }

    /// Let the in-flight batch finish, pause the applier and report where
    /// application stopped.
    pub fn flush_and_pause(&self) -> Result<Timestamp> {
        let applier = {
            let mut core = self.inner.core.lock().unwrap();
            core.applier_paused = true;
            if core.applier_active {
                core.applier.clone()
            } else {
                None
            }
        };
        if let Some(a) = applier {
            a.wait();
        }
        Ok(self.inner.core.lock().unwrap().last_timestamp_applied)
    }

    /// Cancel everything and wait until no owned handle is active.
    /// Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        let inner = &self.inner;
        let event = inner.exec.make_event()?;
        let handles = {
            let mut core = inner.core.lock().unwrap();
            core.on_shutdown = Some(event.clone());
            core.do_shutdown = true;
            inner.collect_handles_inlock(&core)
        };
        handles.cancel_all();
        // nothing may be active at all; one dispatcher pass signals the
        // event in that case.
        let weak = Arc::downgrade(inner);
        inner.exec.schedule_work(Box::new(move |_args| {
            if let Some(inner) = weak.upgrade() {
                inner.do_next_actions();
            }
        }))?;
        inner.exec.wait_for_event(&event);
        Ok(())
    }

    /// Nudge the reporter because downstream members have progressed.
    pub fn followers_have_progressed(&self) {
        let reporter = self.inner.core.lock().unwrap().reporter.clone();
        if let Some(r) = reporter {
            r.trigger();
        }
    }

    pub fn stats(&self) -> ReplicatorStats {
        let core = self.inner.core.lock().unwrap();
        let (applied_ops, fetched_missing_docs) = match &core.initial_sync {
            Some(ist) => (ist.applied_ops, ist.fetched_missing_docs),
            None => (core.applied_ops_total, core.fetched_missing_docs_total),
        };
        ReplicatorStats {
            state: core.state,
            last_timestamp_applied: core.last_timestamp_applied,
            last_timestamp_fetched: core.last_timestamp_fetched,
            buffered_ops: self.inner.buffer.len(),
            applied_ops,
            fetched_missing_docs,
            rollback_common_optime: core.rollback_common_optime,
        }
    }

    pub fn diagnostic_string(&self) -> String {
        let core = self.inner.core.lock().unwrap();
        let mut out = format!(
            "Replicator - state: {} buffered ops: {} last fetched: {:?} last applied: {:?}",
            core.state,
            self.inner.buffer.len(),
            core.last_timestamp_fetched,
            core.last_timestamp_applied,
        );
        if let Some(ist) = &core.initial_sync {
            out.push_str(&format!(
                " applied ops: {} fetched missing docs: {}",
                ist.applied_ops, ist.fetched_missing_docs
            ));
        }
        out
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        let handles = {
            let core = self.inner.core.lock().unwrap();
            self.inner.collect_handles_inlock(&core)
        };
        handles.cancel_all();
        handles.wait_all();
    }
}

impl ReplicatorInner {
    fn collect_handles_inlock(&self, core: &Core) -> OwnedHandles {
        OwnedHandles {
            fetcher: core.fetcher.clone(),
            tmp_fetcher: core.tmp_fetcher.clone(),
            applier: core.applier.clone(),
            reporter: core.reporter.clone(),
            cloner: core.initial_sync.as_ref().map(|i| i.dbs_cloner.clone()),
        }
    }

    fn any_active_handles_inlock(&self, core: &Core) -> bool {
        core.applier_active
            || core.fetcher.as_ref().map(|f| f.is_active()).unwrap_or(false)
            || core
                .tmp_fetcher
                .as_ref()
                .map(|f| f.is_active())
                .unwrap_or(false)
            || core
                .initial_sync
                .as_ref()
                .map(|i| i.dbs_cloner.is_active())
                .unwrap_or(false)
            || core
                .reporter
                .as_ref()
                .map(|r| r.is_active())
                .unwrap_or(false)
    }

    fn ensure_good_sync_source_inlock(&self, core: &mut Core) -> Result<()> {
        if core.sync_source.is_some() {
            return Ok(());
        }
        core.sync_source = match &self.coord {
            Some(coord) => coord.choose_new_sync_source(),
            None => self.opts.sync_source.clone(),
        };
        if core.sync_source.is_some() {
            Ok(())
        } else {
            Err(ReplError::InvalidSyncSource(
                "no valid sync source".to_string(),
            ))
        }
    }

    /// The single point where progress is made.  Every callback funnels
    /// back through here.
    fn do_next_actions(&self) {
        let mut core = self.core.lock().unwrap();
        if core.do_shutdown {
            if !self.any_active_handles_inlock(&core) {
                if let Some(ev) = &core.on_shutdown {
                    ev.signal();
                }
            }
            return;
        }
        match core.state {
            ReplicatorState::Rollback => self.do_next_actions_rollback_inlock(&mut core),
            ReplicatorState::InitialSync => self.do_next_actions_initial_sync_inlock(&mut core),
            ReplicatorState::Steady => self.do_next_actions_steady_inlock(&mut core),
            ReplicatorState::Uninitialized => return,
        }
        self.change_state_if_needed_inlock(&mut core);
    }

    fn do_next_actions_initial_sync_inlock(&self, core: &mut Core) {
        let (cloner_active, cloner_ok, stop_ts, finish_event) = match core.initial_sync.as_ref() {
            None => {
                info!("no initial sync state, resetting state to Uninitialized");
                core.state = ReplicatorState::Uninitialized;
                return;
            }
            Some(ist) => (
                ist.dbs_cloner.is_active(),
                ist.dbs_cloner.status().is_ok(),
                ist.stop_timestamp,
                ist.finish_event.clone(),
            ),
        };
        if cloner_active {
            return;
        }
        if !cloner_ok {
            // the terminal status already went out through the cloner's
            // finish callback.
            return;
        }
        if !is_null_ts(stop_ts)
            && !is_null_ts(core.last_timestamp_applied)
            && core.last_timestamp_applied >= stop_ts
        {
            info!(
                stop_ts = %time_helper::to_datetime(&stop_ts),
                last_applied = %time_helper::to_datetime(&core.last_timestamp_applied),
                "applier done, initial sync done"
            );
            core.state = ReplicatorState::Uninitialized;
            if let Some(ist) = core.initial_sync.as_mut() {
                ist.set_status(Ok(()));
            }
            finish_event.signal();
        } else {
            // keep fetching and applying until we reach the stop timestamp.
            self.do_next_actions_steady_inlock(core);
        }
    }

    fn do_next_actions_rollback_inlock(&self, _core: &mut Core) {
        // Rollback phases advance through work the rollback protocol itself
        // schedules; there is nothing to drive here until that protocol
        // exists.
    }

    fn do_next_actions_steady_inlock(&self, core: &mut Core) {
        if core.sync_source.is_none() {
            core.sync_source = match &self.coord {
                Some(coord) => coord.choose_new_sync_source(),
                None => self.opts.sync_source.clone(),
            };
        }
        if core.sync_source.is_none() {
            // no source available; check again in a bit.
            let when = self.exec.now() + self.opts.sync_source_retry_wait;
            let weak = self.weak_self.clone();
            let _ = self.exec.schedule_work_at(
                when,
                Box::new(move |args| {
                    if args.is_canceled() {
                        return;
                    }
                    if let Some(inner) = weak.upgrade() {
                        inner.do_next_actions();
                    }
                }),
            );
        } else if !core.fetcher_paused {
            let active = core.fetcher.as_ref().map(|f| f.is_active()).unwrap_or(false);
            if !active {
                if let Err(e) = self.schedule_fetch_inlock(core) {
                    warn!(?e, "could not schedule oplog fetch");
                }
            }
        }

        if !core.applier_paused && !core.applier_active && !self.buffer.is_empty() {
            if let Err(e) = self.schedule_apply_batch_inlock(core) {
                warn!(?e, "could not schedule apply batch");
            }
        }

        if !core.reporter_paused {
            let healthy = core
                .reporter
                .as_ref()
                .map(|r| r.get_status().is_ok())
                .unwrap_or(false);
            if !healthy {
                if let (Some(coord), Some(source)) = (self.coord.clone(), core.sync_source.clone())
                {
                    core.reporter =
                        Some(Arc::new(Reporter::new(self.exec.clone(), coord, &source)));
                }
            }
        }
    }

    fn change_state_if_needed_inlock(&self, _core: &mut Core) {
        // placeholder for Steady <-> Rollback flips driven by rollback
        // completion.
    }

    fn schedule_fetch_inlock(&self, core: &mut Core) -> Result<()> {
        if let Some(f) = &core.fetcher {
            if f.is_active() {
                return Ok(());
            }
        }
        let source = match core.sync_source.clone() {
            Some(s) => s,
            None => {
                return Err(ReplError::InvalidSyncSource(
                    "no valid sync source".to_string(),
                ))
            }
        };
        // resume from the newest position already pulled into the buffer;
        // otherwise from the coordinator's (or configured) last optime.
        let start_ts = if !is_null_ts(core.last_timestamp_fetched) {
            core.last_timestamp_fetched
        } else if let Some(coord) = &self.coord {
            coord.get_my_last_optime().ts
        } else {
            self.opts.start_timestamp
        };
        let weak = self.weak_self.clone();
        let cb: QueryCallback = Arc::new(move |result, next| {
            if let Some(inner) = weak.upgrade() {
                inner.on_oplog_fetch_finish(result, next);
            }
        });
        let fetcher = Arc::new(OplogFetcher::new(
            self.exec.clone(),
            start_ts,
            &source,
            &self.opts.remote_oplog_ns,
            cb,
        ));
        fetcher.schedule()?;
        core.fetcher = Some(fetcher);
        Ok(())
    }

    fn schedule_apply_batch_inlock(&self, core: &mut Core) -> Result<()> {
        if core.applier_paused || core.applier_active {
            return Ok(());
        }
        let ops = self
            .buffer
            .drain_batch(APPLIER_BATCH_LIMIT_OPS, APPLIER_BATCH_LIMIT_BYTES);
        if ops.is_empty() {
            return Ok(());
        }
        core.applier_active = true;
        if let Err(e) = self.schedule_apply_ops_inlock(core, ops) {
            core.applier_active = false;
            return Err(e);
        }
        Ok(())
    }

    fn schedule_apply_ops_inlock(&self, core: &mut Core, ops: Operations) -> Result<()> {
        debug_assert!(core.applier_active);
        let weak = self.weak_self.clone();
        let done: ApplierDoneFn = Box::new(move |ts_result, ops| {
            let inner = match weak.upgrade() {
                Some(i) => i,
                None => return,
            };
            let num_applied = ops.len();
            let inner_cb = inner.clone();
            let scheduled = inner.exec.schedule_work(Box::new(move |args| {
                inner_cb.on_apply_batch_finish(args.is_canceled(), ts_result, ops, num_applied);
            }));
            if let Err(e) = scheduled {
                let mut core = inner.core.lock().unwrap();
                inner.fail_attempt_inlock(&mut core, e);
            }
        });
        let applier = Arc::new(Applier::new(
            self.exec.clone(),
            ops,
            self.opts.applier_fn.clone(),
            done,
        ));
        core.applier = Some(applier.clone());
        applier.start()
    }

    fn on_apply_batch_finish(
        &self,
        canceled: bool,
        ts_result: Result<Timestamp>,
        ops: Operations,
        num_applied: usize,
    ) {
        debug_assert!(self.exec.is_run_thread());
        let mut core = self.core.lock().unwrap();
        if let Some(ist) = core.initial_sync.as_mut() {
            ist.applied_ops += num_applied;
        }
        core.applied_ops_total += num_applied;

        if canceled || ts_result == Err(ReplError::CallbackCanceled) {
            core.applier_active = false;
            drop(core);
            self.do_next_actions();
            return;
        }
        match ts_result {
            Err(e) => {
                self.handle_failed_apply_batch_inlock(&mut core, e, ops);
                drop(core);
                self.do_next_actions();
            }
            Ok(ts) => {
                core.applier_active = false;
                debug_assert!(core.last_timestamp_applied <= ts);
                core.last_timestamp_applied = ts;
                let reporter = core.reporter.clone();
                drop(core);
                if let Some(coord) = &self.coord {
                    coord.set_my_last_optime(OpTime::new(ts, 0));
                }
                if let Some(r) = reporter {
                    r.trigger();
                }
                self.do_next_actions();
            }
        }
    }

    fn handle_failed_apply_batch_inlock(
        &self,
        core: &mut Core,
        e: ReplError,
        ops: Operations,
    ) {
        match core.state {
            ReplicatorState::InitialSync => {
                // most likely an update or delete referencing a document we
                // have not cloned; fetch it and retry the batch.
                self.schedule_apply_after_fetch_inlock(core, ops);
            }
            _ => {
                error!(?e, "fatal error applying batch in steady replication");
                panic!("fatal error applying oplog batch: {}", e);
            }
        }
    }

    fn fail_attempt_inlock(&self, core: &mut Core, e: ReplError) {
        core.applier_active = false;
        if let Some(ist) = core.initial_sync.as_mut() {
            ist.set_status(Err(e));
            ist.finish_event.signal();
        }
    }

    fn fail_and_dispatch(&self, e: ReplError) {
        {
            let mut core = self.core.lock().unwrap();
            self.fail_attempt_inlock(&mut core, e);
        }
        self.do_next_actions();
    }

    fn schedule_apply_after_fetch_inlock(&self, core: &mut Core, ops: Operations) {
        if let Some(ist) = core.initial_sync.as_mut() {
            ist.fetched_missing_docs += 1;
        }
        core.fetched_missing_docs_total += 1;

        // the op that failed is the first of the batch; fetch the document
        // it references and retry.
        let failed = match ops.first() {
            Some(d) => d.clone(),
            None => {
                return self.fail_attempt_inlock(
                    core,
                    ReplError::BadValue("empty batch failed to apply".to_string()),
                )
            }
        };
        let ns = match failed
            .get_str(NAMESPACE_KEY)
            .ok()
            .and_then(|s| Namespace::parse(s).ok())
        {
            Some(ns) => ns,
            None => {
                return self.fail_attempt_inlock(
                    core,
                    ReplError::FailedToParse("failed op has no usable ns field".to_string()),
                )
            }
        };
        let id = match failed
            .get_document(OBJ2_KEY)
            .ok()
            .and_then(|o2| o2.get(ID_KEY).cloned())
        {
            Some(id) => id,
            None => {
                return self.fail_attempt_inlock(
                    core,
                    ReplError::FailedToParse("failed op has no o2._id field".to_string()),
                )
            }
        };
        let source = match core.sync_source.clone() {
            Some(s) => s,
            None => {
                return self.fail_attempt_inlock(
                    core,
                    ReplError::InvalidSyncSource(
                        "no sync source for missing document fetch".to_string(),
                    ),
                )
            }
        };

        info!(%ns, "fetching missing document from sync source");
        let cmd = doc! {"find": ns.coll(), "filter": { ID_KEY: id }, "limit": 1};
        let weak = self.weak_self.clone();
        let pending = Arc::new(Mutex::new(Some(ops)));
        let cb_ns = ns.clone();
        let cb: QueryCallback = Arc::new(move |result, next| {
            if let Some(inner) = weak.upgrade() {
                inner.on_missing_fetched(result, next, &pending, &cb_ns);
            }
        });
        let tmp = Arc::new(QueryFetcher::new(self.exec.clone(), &source, &ns, cmd, cb));
        core.tmp_fetcher = Some(tmp.clone());
        if let Err(e) = tmp.schedule() {
            self.fail_attempt_inlock(core, e);
        }
    }

    fn on_missing_fetched(
        &self,
        result: &Result<BatchData>,
        _next: &mut NextAction,
        pending: &Arc<Mutex<Option<Operations>>>,
        ns: &Namespace,
    ) {
        debug_assert!(self.exec.is_run_thread());
        match result {
            Err(ReplError::CallbackCanceled) => {}
            Err(e) => {
                // TODO: retry transient network failures a bounded number
                // of times before failing the attempt.
                self.fail_and_dispatch(e.clone());
            }
            Ok(batch) if batch.documents.is_empty() => {
                self.fail_and_dispatch(ReplError::InitialSyncFailure(
                    "missing doc not found".to_string(),
                ));
            }
            Ok(batch) => {
                let missing = batch.documents[0].clone();
                let storage = self.storage.clone();
                let insert_ns = ns.clone();
                let slot: Arc<Mutex<Option<Result<()>>>> = Arc::new(Mutex::new(None));
                let out = slot.clone();
                let scheduled = self.exec.schedule_db_work(
                    Box::new(move |args, txn| {
                        let r = if args.is_canceled() {
                            Err(ReplError::CallbackCanceled)
                        } else {
                            storage.insert_missing_doc(txn, &insert_ns, missing)
                        };
                        *out.lock().unwrap() = Some(r);
                    }),
                    Some(ns.clone()),
                    LockMode::Ix,
                );
                let handle = match scheduled {
                    Ok(h) => h,
                    Err(e) => return self.fail_and_dispatch(e),
                };
                self.exec.wait(&handle);
                let inserted = slot.lock().unwrap().take().unwrap_or_else(|| {
                    Err(ReplError::BadValue(
                        "missing document insert produced no status".to_string(),
                    ))
                });
                if let Err(e) = inserted {
                    return self.fail_and_dispatch(e);
                }
                let ops = match pending.lock().unwrap().take() {
                    Some(o) => o,
                    None => return,
                };
                let mut core = self.core.lock().unwrap();
                if let Err(e) = self.schedule_apply_ops_inlock(&mut core, ops) {
                    self.fail_attempt_inlock(&mut core, e);
                }
            }
        }
    }

    fn on_data_cloner_finish(&self, status: Result<()>) {
        info!(ok = status.is_ok(), "data clone finished");
        if self.core.lock().unwrap().initial_sync.is_none() {
            return;
        }
        if let Err(e) = status {
            self.fail_and_dispatch(e);
            return;
        }

        // cloning done; the source's current newest entry becomes the stop
        // timestamp (minvalid).
        let source = match self.core.lock().unwrap().sync_source.clone() {
            Some(s) => s,
            None => {
                self.fail_and_dispatch(ReplError::InvalidSyncSource(
                    "sync source lost after data clone".to_string(),
                ));
                return;
            }
        };
        let ns = &self.opts.remote_oplog_ns;
        let cmd = doc! {"find": ns.coll(), "sort": {"$natural": -1}, "limit": 1};
        let weak = self.weak_self.clone();
        let cb: QueryCallback = Arc::new(move |result, next| {
            if let Some(inner) = weak.upgrade() {
                inner.on_applier_ready_start(result, next);
            }
        });
        let tmp = Arc::new(QueryFetcher::new(self.exec.clone(), &source, ns, cmd, cb));
        self.core.lock().unwrap().tmp_fetcher = Some(tmp.clone());
        if let Err(e) = tmp.schedule() {
            self.fail_and_dispatch(e);
        }
    }

    fn on_applier_ready_start(&self, result: &Result<BatchData>, _next: &mut NextAction) {
        debug_assert!(self.exec.is_run_thread());
        if matches!(result, Err(ReplError::CallbackCanceled)) {
            return;
        }
        match parse_first_ts(result) {
            Ok(ts) => {
                let mut core = self.core.lock().unwrap();
                let last_applied = core.last_timestamp_applied;
                match core.initial_sync.as_mut() {
                    Some(ist) => {
                        ist.stop_timestamp = ts;
                        if last_applied < ts {
                            info!(
                                stop_ts = %time_helper::to_datetime(&ts),
                                "waiting for applier to run until stop timestamp"
                            );
                        }
                    }
                    None => return,
                }
                debug_assert!(core.applier_paused);
                core.applier_paused = false;
                self.do_next_actions_initial_sync_inlock(&mut core);
            }
            Err(e) => self.fail_and_dispatch(e),
        }
    }

    fn on_oplog_fetch_finish(&self, result: &Result<BatchData>, _next: &mut NextAction) {
        debug_assert!(self.exec.is_run_thread());
        match result {
            Err(ReplError::CallbackCanceled) => {}
            Err(e) => {
                self.handle_oplog_fetch_error(e);
                self.do_next_actions();
            }
            Ok(batch) => {
                if !batch.documents.is_empty() {
                    for doc in &batch.documents {
                        if !self.buffer.fits(doc_size(doc)) {
                            // this push is about to block for buffer space;
                            // make sure the applier gets scheduled to drain
                            // it while we wait.
                            let weak = self.weak_self.clone();
                            let _ = self.exec.schedule_work(Box::new(move |args| {
                                if args.is_canceled() {
                                    return;
                                }
                                if let Some(inner) = weak.upgrade() {
                                    inner.do_next_actions();
                                }
                            }));
                        }
                        self.buffer.push(doc.clone());
                    }
                    let mut newest = None;
                    for doc in batch.documents.iter().rev() {
                        if let Ok(ts) = doc.get_timestamp(TIMESTAMP_KEY) {
                            newest = Some(ts);
                            break;
                        }
                    }
                    match newest {
                        Some(ts) => self.core.lock().unwrap().last_timestamp_fetched = ts,
                        None => {
                            warn!("did not find a 'ts' timestamp field in any of the fetched documents")
                        }
                    }
                }
                self.do_next_actions();
            }
        }
    }

    fn handle_oplog_fetch_error(&self, e: &ReplError) {
        let (source, last_applied, state, start_ts) = {
            let core = self.core.lock().unwrap();
            (
                core.sync_source.clone(),
                core.last_timestamp_applied,
                core.state,
                core.fetcher.as_ref().map(|f| f.start_timestamp()),
            )
        };
        match e {
            ReplError::OplogStartMissing(_) => {
                let rolled = match &source {
                    Some(s) => self.need_to_rollback(s, last_applied),
                    None => false,
                };
                if rolled && state == ReplicatorState::Steady {
                    info!(?source, "oplog diverged with a common point, entering rollback");
                    self.core.lock().unwrap().state = ReplicatorState::Rollback;
                } else if let Some(coord) = &self.coord {
                    if !coord.set_follower_mode(MemberState::Recovering) {
                        error!(
                            ?start_ts,
                            ?source,
                            "failed to transition to RECOVERING when we couldn't find \
                             the oplog start position on the sync source"
                        );
                    }
                    if let Some(s) = &source {
                        let until =
                            self.exec.now() + self.opts.blacklist_oplog_start_missing_penalty;
                        coord.blacklist_sync_source(s, until);
                    }
                }
            }
            _ => {
                if let (Some(coord), Some(s)) = (&self.coord, &source) {
                    let until = self.exec.now() + self.opts.blacklist_network_error_penalty;
                    coord.blacklist_sync_source(s, until);
                }
            }
        }
        let in_initial_sync = {
            let mut core = self.core.lock().unwrap();
            core.sync_source = None;
            core.state == ReplicatorState::InitialSync
        };
        if in_initial_sync {
            // a broken fetch fails the whole attempt; the retry loop in
            // initial_sync decides what happens next.
            self.fail_attempt_inlock(&mut self.core.lock().unwrap(), e.clone());
            return;
        }
        // the failed fetcher may still count as active while this callback
        // unwinds; a deferred pass picks up the rebuild in that case.
        let when = self.exec.now() + self.opts.sync_source_retry_wait;
        let weak = self.weak_self.clone();
        let _ = self.exec.schedule_work_at(
            when,
            Box::new(move |args| {
                if args.is_canceled() {
                    return;
                }
                if let Some(inner) = weak.upgrade() {
                    inner.do_next_actions();
                }
            }),
        );
    }

    fn need_to_rollback(&self, source: &str, last_applied: Timestamp) -> bool {
        let common = match &self.opts.find_common_point {
            Some(f) => f(source, last_applied),
            None => find_common_point(source, last_applied),
        };
        match common {
            Some(ts) => {
                self.core.lock().unwrap().rollback_common_optime = Some(ts);
                true
            }
            None => false,
        }
    }
}

fn find_common_point(_source: &str, _last_applied: Timestamp) -> Option<Timestamp> {
    // TODO: walk the source's oplog backwards looking for a shared optime.
    None
}

/// Extract the `ts` of the first document of a fetched batch.
fn parse_first_ts(result: &Result<BatchData>) -> Result<Timestamp> {
    match result {
        Err(e) => Err(e.clone()),
        Ok(batch) => batch
            .documents
            .first()
            .ok_or_else(|| {
                ReplError::FailedToParse(
                    "could not find an oplog entry with 'ts' field".to_string(),
                )
            })
            .and_then(|d| {
                d.get_timestamp(TIMESTAMP_KEY).map_err(|_| {
                    ReplError::FailedToParse(
                        "could not find an oplog entry with 'ts' field".to_string(),
                    )
                })
            }),
    }
}

/// Synchronously read the source oplog's newest `ts`.
fn fetch_latest_oplog_ts(
    exec: &Arc<dyn Executor>,
    source: &str,
    oplog_ns: &Namespace,
) -> Result<Timestamp> {
    let cmd = doc! {"find": oplog_ns.coll(), "sort": {"$natural": -1}, "limit": 1};
    let slot: Arc<Mutex<Option<Result<Timestamp>>>> = Arc::new(Mutex::new(None));
    let done = Event::new();
    let cb: QueryCallback = {
        let out = slot.clone();
        let done = done.clone();
        Arc::new(move |result, _next| {
            *out.lock().unwrap() = Some(parse_first_ts(result));
            done.signal();
        })
    };
    let fetcher = QueryFetcher::new(exec.clone(), source, oplog_ns, cmd, cb);
    fetcher.schedule()?;
    done.wait();
    let got = slot.lock().unwrap().take();
    got.unwrap_or_else(|| {
        Err(ReplError::BadValue(
            "no response while reading the latest oplog timestamp".to_string(),
        ))
    })
}
