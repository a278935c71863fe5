//! Pushes our replication progress upstream to the sync source.

use crate::executor::{Executor, Handle, RemoteCommandRequest};
use crate::repl::coord::ReplicationCoordinator;
use crate::{ReplError, Result, ADMIN_DB_NAME};
use bson::doc;
use std::sync::{Arc, Condvar, Mutex, Weak};
use tracing::debug;

struct ReporterState {
    active: bool,
    pending: bool,
    canceled: bool,
    status: Result<()>,
    handle: Option<Handle>,
}

struct ReporterInner {
    weak_self: Weak<ReporterInner>,
    exec: Arc<dyn Executor>,
    coord: Arc<dyn ReplicationCoordinator>,
    target: String,
    state: Mutex<ReporterState>,
    cv: Condvar,
}

/// Sends `replSetUpdatePosition` with the coordinator's last optime.
/// Triggers coalesce: a trigger while a report is in flight marks a pending
/// one, sent as soon as the current report completes.
pub struct Reporter {
    inner: Arc<ReporterInner>,
}

impl Reporter {
    pub fn new(
        exec: Arc<dyn Executor>,
        coord: Arc<dyn ReplicationCoordinator>,
        target: &str,
    ) -> Reporter {
        Reporter {
            inner: Arc::new_cyclic(|weak| ReporterInner {
                weak_self: weak.clone(),
                exec,
                coord,
                target: target.to_string(),
                state: Mutex::new(ReporterState {
                    active: false,
                    pending: false,
                    canceled: false,
                    status: Ok(()),
                    handle: None,
                }),
                cv: Condvar::new(),
            }),
        }
    }

    pub fn trigger(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.canceled {
                return;
            }
            if state.active {
                state.pending = true;
                return;
            }
            state.active = true;
        }
        self.inner.send_report();
    }

    pub fn get_status(&self) -> Result<()> {
        self.inner.state.lock().unwrap().status.clone()
    }

    pub fn is_active(&self) -> bool {
        self.inner.state.lock().unwrap().active
    }

    pub fn cancel(&self) {
        let handle = {
            let mut state = self.inner.state.lock().unwrap();
            if state.canceled {
                return;
            }
            state.canceled = true;
            state.pending = false;
            state.active = false;
            state.status = Err(ReplError::CallbackCanceled);
            self.inner.cv.notify_all();
            state.handle.clone()
        };
        if let Some(h) = handle {
            h.cancel();
        }
    }

    pub fn wait(&self) {
        let mut state = self.inner.state.lock().unwrap();
        while state.active {
            state = self.inner.cv.wait(state).unwrap();
        }
    }
}

impl ReporterInner {
    fn send_report(&self) {
        let optime = self.coord.get_my_last_optime();
        let cmd = doc! {
            "replSetUpdatePosition": 1,
            "optimes": [ { "ts": optime.ts, "t": optime.term } ],
        };
        let req = RemoteCommandRequest::new(self.target.clone(), ADMIN_DB_NAME, cmd);
        let weak = self.weak_self.clone();
        let scheduled = self.exec.schedule_remote_command(
            req,
            Box::new(move |args, resp| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_report_finish(args.is_canceled(), resp);
                }
            }),
        );
        match scheduled {
            Ok(handle) => {
                self.state.lock().unwrap().handle = Some(handle);
            }
            Err(e) => {
                let mut state = self.state.lock().unwrap();
                state.active = false;
                state.status = Err(e);
                self.cv.notify_all();
            }
        }
    }

    fn on_report_finish(&self, args_canceled: bool, resp: crate::Result<bson::Document>) {
        debug_assert!(self.exec.is_run_thread());
        let resend = {
            let mut state = self.state.lock().unwrap();
            state.active = false;
            if args_canceled || state.canceled {
                state.status = Err(ReplError::CallbackCanceled);
                state.pending = false;
                self.cv.notify_all();
                return;
            }
            state.status = resp.map(|_| ());
            if let Err(e) = &state.status {
                debug!(?e, target = %self.target, "progress report failed");
            }
            let resend = state.pending && state.status.is_ok();
            state.pending = false;
            if resend {
                state.active = true;
            }
            self.cv.notify_all();
            resend
        };
        if resend {
            self.send_report();
        }
    }
}
