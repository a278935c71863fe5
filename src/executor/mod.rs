//! Task executor contract shared by every replication component.
//!
//! The executor provides callback scheduling ("now", at a wall-clock time,
//! on a thread eligible to hold storage locks), remote command dispatch and
//! one-shot events.  Components never spawn threads themselves; everything
//! asynchronous goes through an [`Executor`].

mod pool;

pub use pool::{NetworkInterface, ThreadPoolExecutor};

use crate::ns::Namespace;
use crate::{ReplError, Result};
use bson::Document;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

/// Status handed to every callback.  Cancellation is delivered as a status,
/// not by dropping the callback: a canceled handle still runs its callback
/// exactly once with [`ReplError::CallbackCanceled`].
pub struct CallbackArgs {
    pub status: Result<()>,
}

impl CallbackArgs {
    pub fn ok() -> CallbackArgs {
        CallbackArgs { status: Ok(()) }
    }

    pub fn canceled() -> CallbackArgs {
        CallbackArgs {
            status: Err(ReplError::CallbackCanceled),
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self.status, Err(ReplError::CallbackCanceled))
    }
}

pub type WorkFn = Box<dyn FnOnce(&CallbackArgs) + Send>;
pub type DbWorkFn = Box<dyn FnOnce(&CallbackArgs, &mut DbTxn) + Send>;
pub type RemoteCommandCallback = Box<dyn FnOnce(&CallbackArgs, Result<Document>) + Send>;

/// A command to run against a remote host.
#[derive(Debug, Clone)]
pub struct RemoteCommandRequest {
    pub target: String,
    pub db: String,
    pub cmd: Document,
}

impl RemoteCommandRequest {
    pub fn new(
        target: impl Into<String>,
        db: impl Into<String>,
        cmd: Document,
    ) -> RemoteCommandRequest {
        RemoteCommandRequest {
            target: target.into(),
            db: db.into(),
            cmd,
        }
    }
}

/// Lock strength requested for a unit of DB work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Is,
    Ix,
    S,
    X,
}

/// Context handed to DB work; records the namespace and lock mode the work
/// was scheduled under so storage implementations can honor them.
pub struct DbTxn {
    ns: Option<Namespace>,
    mode: LockMode,
}

impl DbTxn {
    pub fn new(ns: Option<Namespace>, mode: LockMode) -> DbTxn {
        DbTxn { ns, mode }
    }

    pub fn namespace(&self) -> Option<&Namespace> {
        self.ns.as_ref()
    }

    pub fn lock_mode(&self) -> LockMode {
        self.mode
    }
}

/// A scheduled unit of work.  Cloning shares the underlying state.
#[derive(Clone)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    done: Mutex<bool>,
    cv: Condvar,
    canceled: AtomicBool,
}

impl Handle {
    pub fn new() -> Handle {
        Handle {
            inner: Arc::new(HandleInner {
                done: Mutex::new(false),
                cv: Condvar::new(),
                canceled: AtomicBool::new(false),
            }),
        }
    }

    /// Request cancellation.  Idempotent; the callback still runs once, with
    /// a canceled status.
    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_done(&self) {
        let mut done = self.inner.done.lock().unwrap();
        *done = true;
        self.inner.cv.notify_all();
    }

    pub fn wait_done(&self) {
        let mut done = self.inner.done.lock().unwrap();
        while !*done {
            done = self.inner.cv.wait(done).unwrap();
        }
    }
}

impl Default for Handle {
    fn default() -> Handle {
        Handle::new()
    }
}

/// One-shot event: signal once, any number of waiters.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

struct EventInner {
    signaled: Mutex<bool>,
    cv: Condvar,
}

impl Event {
    pub fn new() -> Event {
        Event {
            inner: Arc::new(EventInner {
                signaled: Mutex::new(false),
                cv: Condvar::new(),
            }),
        }
    }

    pub fn signal(&self) {
        let mut signaled = self.inner.signaled.lock().unwrap();
        *signaled = true;
        self.inner.cv.notify_all();
    }

    pub fn wait(&self) {
        let mut signaled = self.inner.signaled.lock().unwrap();
        while !*signaled {
            signaled = self.inner.cv.wait(signaled).unwrap();
        }
    }

    pub fn is_signaled(&self) -> bool {
        *self.inner.signaled.lock().unwrap()
    }
}

impl Default for Event {
    fn default() -> Event {
        Event::new()
    }
}

/// The scheduling surface used by the replication core.
///
/// Plain work runs on the executor's run thread; remote command and DB work
/// callbacks run on the executor's pool threads.  All replicator state
/// crossed by callbacks is mutex guarded, so no single-thread assumption is
/// required of implementations beyond "callbacks run on executor threads".
pub trait Executor: Send + Sync {
    fn schedule_work(&self, work: WorkFn) -> Result<Handle>;

    fn schedule_work_at(&self, when: Instant, work: WorkFn) -> Result<Handle>;

    /// Schedule work on a thread eligible to hold storage locks.
    fn schedule_db_work(
        &self,
        work: DbWorkFn,
        ns: Option<Namespace>,
        mode: LockMode,
    ) -> Result<Handle>;

    fn schedule_remote_command(
        &self,
        req: RemoteCommandRequest,
        cb: RemoteCommandCallback,
    ) -> Result<Handle>;

    fn make_event(&self) -> Result<Event>;

    fn signal_event(&self, event: &Event) {
        event.signal();
    }

    fn wait_for_event(&self, event: &Event) {
        event.wait();
    }

    fn wait(&self, handle: &Handle) {
        handle.wait_done();
    }

    fn now(&self) -> Instant {
        Instant::now()
    }

    /// True when the current thread is one of the executor's callback
    /// threads.  Handlers assert this on entry.
    fn is_run_thread(&self) -> bool;
}
