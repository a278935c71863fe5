//! One-shot wrapper that runs a batch of oplog operations through the
//! user-supplied apply function on the executor's DB-work lane.

use crate::executor::{Executor, LockMode};
use crate::{ReplError, Result};
use bson::{Document, Timestamp};
use std::sync::{Arc, Condvar, Mutex};

pub type Operations = Vec<Document>;

/// Applies a batch transactionally and returns the `ts` of the last applied
/// operation.
pub type ApplierFn =
    Arc<dyn Fn(&mut crate::executor::DbTxn, &[Document]) -> Result<Timestamp> + Send + Sync>;

/// Invoked exactly once with the apply outcome and the batch it ran on.
pub type ApplierDoneFn = Box<dyn FnOnce(Result<Timestamp>, Operations) + Send>;

struct ApplierState {
    active: bool,
    started: bool,
    canceled: bool,
}

struct ApplierInner {
    exec: Arc<dyn Executor>,
    applier_fn: ApplierFn,
    payload: Mutex<Option<(Operations, ApplierDoneFn)>>,
    state: Mutex<ApplierState>,
    cv: Condvar,
}

impl ApplierInner {
    fn finish(&self) {
        let mut state = self.state.lock().unwrap();
        state.active = false;
        self.cv.notify_all();
    }
}

/// Runs one batch.  At most one batch is ever in flight per applier; the
/// replicator enforces one applier at a time on top of that.
pub struct Applier {
    inner: Arc<ApplierInner>,
}

impl Applier {
    pub fn new(
        exec: Arc<dyn Executor>,
        ops: Operations,
        applier_fn: ApplierFn,
        done: ApplierDoneFn,
    ) -> Applier {
        Applier {
            inner: Arc::new(ApplierInner {
                exec,
                applier_fn,
                payload: Mutex::new(Some((ops, done))),
                state: Mutex::new(ApplierState {
                    active: false,
                    started: false,
                    canceled: false,
                }),
                cv: Condvar::new(),
            }),
        }
    }

    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.started {
                return Err(ReplError::IllegalOperation(
                    "applier already started".to_string(),
                ));
            }
            state.started = true;
            state.active = true;
        }
        let inner = self.inner.clone();
        let scheduled = self.inner.exec.schedule_db_work(
            Box::new(move |args, txn| {
                let payload = inner.payload.lock().unwrap().take();
                let (ops, done) = match payload {
                    Some(p) => p,
                    None => return,
                };
                let canceled =
                    args.is_canceled() || inner.state.lock().unwrap().canceled;
                let result = if canceled {
                    Err(ReplError::CallbackCanceled)
                } else {
                    (inner.applier_fn)(txn, &ops)
                };
                done(result, ops);
                inner.finish();
            }),
            None,
            LockMode::X,
        );
        if let Err(e) = scheduled {
            self.inner.finish();
            return Err(e);
        }
        Ok(())
    }

    /// Idempotent.  A batch already being applied cannot be interrupted;
    /// the done callback then reports `CallbackCanceled` only if the batch
    /// had not started yet.
    pub fn cancel(&self) {
        self.inner.state.lock().unwrap().canceled = true;
    }

    pub fn wait(&self) {
        let mut state = self.inner.state.lock().unwrap();
        while state.active {
            state = self.inner.cv.wait(state).unwrap();
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.state.lock().unwrap().active
    }
}
