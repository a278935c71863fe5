//! Clones every user database from the sync source.
//!
//! The per-database copy protocol lives behind [`DatabaseCloner`]; this
//! module owns listing the databases, fanning the cloners out and funneling
//! their completions into a single finish callback.

use crate::executor::{Executor, RemoteCommandRequest};
use crate::ns::Namespace;
use crate::repl::fetcher;
use crate::repl::storage::StorageInterface;
use crate::{ReplError, Result, ADMIN_DB_NAME};
use bson::{doc, Bson, Document};
use std::sync::{Arc, Condvar, Mutex, Weak};
use tracing::{error, info};

/// Invoked exactly once with the terminal clone status.
pub type ClonerFinishFn = Box<dyn FnOnce(Result<()>) + Send>;

/// Progress callback invoked per cloned collection.
pub type CollectionProgressFn = Arc<dyn Fn(&Namespace, &Result<()>) + Send + Sync>;

/// Keeps only documents matching the predicate; clone-all passes
/// `|_| true`.
pub type ClonePredicateFn = Arc<dyn Fn(&Document) -> bool + Send + Sync>;

/// Copies one database from the source.  Implementations live outside the
/// core; [`crate::net`] carries a driver-backed one.
pub trait DatabaseCloner: Send + Sync {
    fn start(&self) -> Result<()>;
    fn cancel(&self);
    fn wait(&self);
    fn is_active(&self) -> bool;
}

/// Builds one [`DatabaseCloner`] per database discovered on the source.
pub trait DatabaseClonerFactory: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn make(
        &self,
        exec: Arc<dyn Executor>,
        source: &str,
        db_name: &str,
        filter: Document,
        predicate: ClonePredicateFn,
        storage: Arc<dyn StorageInterface>,
        on_collection: CollectionProgressFn,
        finish: ClonerFinishFn,
    ) -> Result<Arc<dyn DatabaseCloner>>;
}

struct DbsClonerState {
    active: bool,
    spawning: bool,
    status: Option<ReplError>,
    cloners: Vec<Arc<dyn DatabaseCloner>>,
    cloners_active: usize,
}

struct DbsClonerInner {
    weak_self: Weak<DbsClonerInner>,
    exec: Arc<dyn Executor>,
    source: String,
    storage: Arc<dyn StorageInterface>,
    factory: Arc<dyn DatabaseClonerFactory>,
    state: Mutex<DbsClonerState>,
    cv: Condvar,
    finish_fn: Mutex<Option<ClonerFinishFn>>,
}

/// Lists databases on the source and runs one database cloner per result.
/// The first failure observed is the terminal status; later failures are
/// dropped.  The finish callback fires exactly once, on completion, failure
/// or cancellation.
pub struct DatabasesCloner {
    inner: Arc<DbsClonerInner>,
}

impl DatabasesCloner {
    pub fn new(
        exec: Arc<dyn Executor>,
        source: &str,
        storage: Arc<dyn StorageInterface>,
        factory: Arc<dyn DatabaseClonerFactory>,
        finish: ClonerFinishFn,
    ) -> DatabasesCloner {
        DatabasesCloner {
            inner: Arc::new_cyclic(|weak| DbsClonerInner {
                weak_self: weak.clone(),
                exec,
                source: source.to_string(),
                storage,
                factory,
                state: Mutex::new(DbsClonerState {
                    active: false,
                    spawning: false,
                    status: None,
                    cloners: Vec::new(),
                    cloners_active: 0,
                }),
                cv: Condvar::new(),
                finish_fn: Mutex::new(Some(finish)),
            }),
        }
    }

    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.active {
                return Err(ReplError::IllegalOperation(
                    "databases cloner already started".to_string(),
                ));
            }
            state.active = true;
        }
        info!(source = %self.inner.source, "starting cloning of all databases");
        let req = RemoteCommandRequest::new(
            self.inner.source.clone(),
            ADMIN_DB_NAME,
            doc! {"listDatabases": 1},
        );
        let weak = Arc::downgrade(&self.inner);
        let scheduled = self.inner.exec.schedule_remote_command(
            req,
            Box::new(move |args, resp| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_list_databases_finish(args.is_canceled(), resp);
                }
            }),
        );
        if let Err(e) = scheduled {
            self.inner.set_status(e.clone());
            self.inner.deactivate();
            self.inner.finish_once();
            return Err(e);
        }
        Ok(())
    }

    /// Idempotent.  Cancels the child cloners and fires the finish callback
    /// with `CallbackCanceled` if it has not fired yet.
    pub fn cancel(&self) {
        let cloners = {
            let mut state = self.inner.state.lock().unwrap();
            if !state.active {
                return;
            }
            state.active = false;
            if state.status.is_none() {
                state.status = Some(ReplError::CallbackCanceled);
            }
            self.inner.cv.notify_all();
            state.cloners.clone()
        };
        for c in &cloners {
            c.cancel();
        }
        self.inner.finish_once();
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

    /// Ok while nothing has failed; the first recorded failure afterwards.
    pub fn status(&self) -> Result<()> {
        match &self.inner.state.lock().unwrap().status {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

impl DbsClonerInner {
    fn set_status(&self, e: ReplError) {
        let mut state = self.state.lock().unwrap();
        if state.status.is_none() {
            state.status = Some(e);
        }
    }

    fn deactivate(&self) {
        let mut state = self.state.lock().unwrap();
        state.active = false;
        self.cv.notify_all();
    }

    fn finish_once(&self) {
        let finish = self.finish_fn.lock().unwrap().take();
        if let Some(f) = finish {
            let status = match &self.state.lock().unwrap().status {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            };
            f(status);
        }
    }

    fn on_list_databases_finish(&self, args_canceled: bool, resp: Result<Document>) {
        debug_assert!(self.exec.is_run_thread());
        if args_canceled {
            // cancel() already recorded the status and fired the callback.
            return;
        }

        let names = resp.and_then(|doc| parse_database_names(&doc));
        match names {
            Ok(names) => {
                self.state.lock().unwrap().spawning = true;
                for name in names {
                    {
                        let mut state = self.state.lock().unwrap();
                        if !state.active {
                            break;
                        }
                        state.cloners_active += 1;
                    }
                    match self.spawn_db_cloner(&name) {
                        Ok(cloner) => {
                            self.state.lock().unwrap().cloners.push(cloner);
                        }
                        Err(e) => {
                            let err = format!(
                                "could not create cloner for database: {} due to: {}",
                                name, e
                            );
                            error!("{}", err);
                            self.state.lock().unwrap().cloners_active -= 1;
                            self.set_status(ReplError::InitialSyncFailure(err));
                            break;
                        }
                    }
                }
                let mut state = self.state.lock().unwrap();
                state.spawning = false;
                if state.cloners_active == 0 && state.active {
                    state.active = false;
                    self.cv.notify_all();
                    drop(state);
                    self.finish_once();
                }
            }
            Err(e) => {
                error!(?e, "failed to clone databases due to failed server response");
                self.set_status(ReplError::InitialSyncFailure(format!(
                    "failed to list databases on source: {}",
                    e
                )));
                self.deactivate();
                self.finish_once();
            }
        }
    }

    fn spawn_db_cloner(&self, name: &str) -> Result<Arc<dyn DatabaseCloner>> {
        let weak = self.weak_self.clone();
        let db_name = name.to_string();
        let finish: ClonerFinishFn = Box::new(move |status| {
            if let Some(inner) = weak.upgrade() {
                inner.on_each_db_clone_finish(status, &db_name);
            }
        });
        let on_collection: CollectionProgressFn = Arc::new(|ns, status| match status {
            Ok(()) => info!(%ns, "collection clone finished"),
            Err(e) => info!(%ns, ?e, "collection clone failed"),
        });
        let cloner = self.factory.make(
            self.exec.clone(),
            &self.source,
            name,
            Document::new(),
            Arc::new(|_| true),
            self.storage.clone(),
            on_collection,
            finish,
        )?;
        cloner.start()?;
        Ok(cloner)
    }

    fn on_each_db_clone_finish(&self, status: Result<()>, name: &str) {
        let finished = {
            let mut state = self.state.lock().unwrap();
            state.cloners_active = state.cloners_active.saturating_sub(1);
            match &status {
                Ok(()) => info!(db = name, "database clone finished"),
                Err(e) => {
                    error!(db = name, ?e, "database clone failed");
                    if state.status.is_none() {
                        state.status = Some(e.clone());
                    }
                }
            }
            if state.cloners_active == 0 && !state.spawning && state.active {
                state.active = false;
                self.cv.notify_all();
                true
            } else {
                false
            }
        };
        if finished {
            info!("all database clones finished");
            self.finish_once();
        }
    }
}

fn parse_database_names(doc: &Document) -> Result<Vec<String>> {
    let resp = fetcher::parse_command_ok(doc)?;
    let dbs = resp
        .get_array("databases")
        .map_err(|_| ReplError::FailedToParse("databases field missing".to_string()))?;
    let mut names = Vec::with_capacity(dbs.len());
    for item in dbs {
        match item {
            Bson::Document(d) => names.push(
                d.get_str("name")
                    .map_err(|_| {
                        ReplError::FailedToParse("database entry has no name".to_string())
                    })?
                    .to_string(),
            ),
            _ => {
                return Err(ReplError::FailedToParse(
                    "database entry is not a document".to_string(),
                ))
            }
        }
    }
    Ok(names)
}
