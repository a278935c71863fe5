//! Thread-pool backed [`Executor`].
//!
//! One dedicated run thread drains a crossbeam channel of plain work (and
//! timer firings).  Remote commands run as blocking calls on a rayon pool,
//! each completion callback invoked on the pool thread that carried the
//! command.  DB work runs on a single-threaded rayon pool, the one thread
//! eligible to hold storage locks.

use super::{
    CallbackArgs, DbTxn, DbWorkFn, Event, Executor, Handle, LockMode, RemoteCommandCallback,
    RemoteCommandRequest, WorkFn,
};
use crate::ns::Namespace;
use crate::{ReplError, Result};
use bson::Document;
use crossbeam::channel::{unbounded, Receiver, Sender};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::cell::Cell;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

/// Blocking transport for remote commands.  The production implementation
/// lives in [`crate::net`]; tests script one in memory.
pub trait NetworkInterface: Send + Sync {
    fn run_command(&self, req: &RemoteCommandRequest) -> Result<Document>;
}

thread_local! {
    static EXECUTOR_THREAD: Cell<bool> = Cell::new(false);
}

fn mark_executor_thread() {
    EXECUTOR_THREAD.with(|c| c.set(true));
}

fn on_executor_thread() -> bool {
    EXECUTOR_THREAD.with(|c| c.get())
}

struct RunItem {
    handle: Handle,
    work: WorkFn,
}

impl RunItem {
    fn run(self) {
        let args = if self.handle.is_canceled() {
            CallbackArgs::canceled()
        } else {
            CallbackArgs::ok()
        };
        (self.work)(&args);
        self.handle.mark_done();
    }
}

enum Msg {
    Run(RunItem),
    Stop,
}

struct TimerEntry {
    when: Instant,
    seq: u64,
    item: RunItem,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // inverted so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .when
            .cmp(&self.when)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerShared {
    queue: Mutex<BinaryHeap<TimerEntry>>,
    cv: Condvar,
    stopped: AtomicBool,
}

pub struct ThreadPoolExecutor {
    tx: Sender<Msg>,
    timer: Arc<TimerShared>,
    timer_seq: AtomicU64,
    net_pool: ThreadPool,
    db_pool: ThreadPool,
    network: Arc<dyn NetworkInterface>,
    stopped: AtomicBool,
    run_thread: Mutex<Option<JoinHandle<()>>>,
    timer_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadPoolExecutor {
    pub fn new(network: Arc<dyn NetworkInterface>) -> ThreadPoolExecutor {
        ThreadPoolExecutor::with_network_threads(network, num_cpus::get().max(2))
    }

    pub fn with_network_threads(
        network: Arc<dyn NetworkInterface>,
        net_threads: usize,
    ) -> ThreadPoolExecutor {
        let (tx, rx): (Sender<Msg>, Receiver<Msg>) = unbounded();
        let timer = Arc::new(TimerShared {
            queue: Mutex::new(BinaryHeap::new()),
            cv: Condvar::new(),
            stopped: AtomicBool::new(false),
        });

        let run_thread = {
            let rx = rx;
            std::thread::Builder::new()
                .name("repl-exec-run".to_string())
                .spawn(move || {
                    mark_executor_thread();
                    while let Ok(msg) = rx.recv() {
                        match msg {
                            Msg::Run(item) => item.run(),
                            Msg::Stop => break,
                        }
                    }
                    // deliver anything still queued as canceled so waiters
                    // never hang.
                    while let Ok(msg) = rx.try_recv() {
                        if let Msg::Run(item) = msg {
                            item.handle.cancel();
                            item.run();
                        }
                    }
                })
                .expect("failed to spawn executor run thread")
        };

        let timer_thread = {
            let timer = timer.clone();
            let tx = tx.clone();
            std::thread::Builder::new()
                .name("repl-exec-timer".to_string())
                .spawn(move || {
                    mark_executor_thread();
                    let mut queue = timer.queue.lock().unwrap();
                    loop {
                        if timer.stopped.load(Ordering::SeqCst) {
                            let pending: Vec<TimerEntry> = queue.drain().collect();
                            drop(queue);
                            for entry in pending {
                                entry.item.handle.cancel();
                                entry.item.run();
                            }
                            break;
                        }
                        let now = Instant::now();
                        match queue.peek() {
                            None => {
                                queue = timer.cv.wait(queue).unwrap();
                            }
                            Some(entry) if entry.when <= now => {
                                let entry = queue.pop().unwrap();
                                let _ = tx.send(Msg::Run(entry.item));
                            }
                            Some(entry) => {
                                let dur = entry.when - now;
                                let (guard, _) = timer.cv.wait_timeout(queue, dur).unwrap();
                                queue = guard;
                            }
                        }
                    }
                })
                .expect("failed to spawn executor timer thread")
        };

        let net_pool = ThreadPoolBuilder::new()
            .num_threads(net_threads)
            .thread_name(|i| format!("repl-exec-net-{}", i))
            .start_handler(|_| mark_executor_thread())
            .build()
            .expect("failed to build network pool");
        let db_pool = ThreadPoolBuilder::new()
            .num_threads(1)
            .thread_name(|i| format!("repl-exec-db-{}", i))
            .start_handler(|_| mark_executor_thread())
            .build()
            .expect("failed to build db pool");

        ThreadPoolExecutor {
            tx,
            timer,
            timer_seq: AtomicU64::new(0),
            net_pool,
            db_pool,
            network,
            stopped: AtomicBool::new(false),
            run_thread: Mutex::new(Some(run_thread)),
            timer_thread: Mutex::new(Some(timer_thread)),
        }
    }

    fn check_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            Err(ReplError::ShutdownInProgress)
        } else {
            Ok(())
        }
    }

    /// Stop accepting work, flush pending callbacks as canceled and join the
    /// run and timer threads.  Idempotent.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.timer.stopped.store(true, Ordering::SeqCst);
        self.timer.cv.notify_all();
        if let Some(t) = self.timer_thread.lock().unwrap().take() {
            let _ = t.join();
        }
        let _ = self.tx.send(Msg::Stop);
        if let Some(t) = self.run_thread.lock().unwrap().take() {
            let _ = t.join();
        }
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Executor for ThreadPoolExecutor {
    fn schedule_work(&self, work: WorkFn) -> Result<Handle> {
        self.check_running()?;
        let handle = Handle::new();
        self.tx
            .send(Msg::Run(RunItem {
                handle: handle.clone(),
                work,
            }))
            .map_err(|_| ReplError::ShutdownInProgress)?;
        Ok(handle)
    }

    fn schedule_work_at(&self, when: Instant, work: WorkFn) -> Result<Handle> {
        self.check_running()?;
        let handle = Handle::new();
        let entry = TimerEntry {
            when,
            seq: self.timer_seq.fetch_add(1, Ordering::SeqCst),
            item: RunItem {
                handle: handle.clone(),
                work,
            },
        };
        self.timer.queue.lock().unwrap().push(entry);
        self.timer.cv.notify_all();
        Ok(handle)
    }

    fn schedule_db_work(
        &self,
        work: DbWorkFn,
        ns: Option<Namespace>,
        mode: LockMode,
    ) -> Result<Handle> {
        self.check_running()?;
        let handle = Handle::new();
        let h = handle.clone();
        self.db_pool.spawn(move || {
            let args = if h.is_canceled() {
                CallbackArgs::canceled()
            } else {
                CallbackArgs::ok()
            };
            let mut txn = DbTxn::new(ns, mode);
            work(&args, &mut txn);
            h.mark_done();
        });
        Ok(handle)
    }

    fn schedule_remote_command(
        &self,
        req: RemoteCommandRequest,
        cb: RemoteCommandCallback,
    ) -> Result<Handle> {
        self.check_running()?;
        let handle = Handle::new();
        let h = handle.clone();
        let network = self.network.clone();
        self.net_pool.spawn(move || {
            if h.is_canceled() {
                cb(&CallbackArgs::canceled(), Err(ReplError::CallbackCanceled));
                h.mark_done();
                return;
            }
            let response = network.run_command(&req);
            if h.is_canceled() {
                cb(&CallbackArgs::canceled(), Err(ReplError::CallbackCanceled));
            } else {
                cb(&CallbackArgs::ok(), response);
            }
            h.mark_done();
        });
        Ok(handle)
    }

    fn make_event(&self) -> Result<Event> {
        self.check_running()?;
        Ok(Event::new())
    }

    fn is_run_thread(&self) -> bool {
        on_executor_thread()
    }
}
