//! Driver-backed implementations of the outward-facing seams: the network
//! interface, the storage interface and a plain database cloner.

use crate::executor::{Executor, LockMode, NetworkInterface, RemoteCommandRequest};
use crate::ns::Namespace;
use crate::repl::cloner::{
    ClonePredicateFn, ClonerFinishFn, CollectionProgressFn, DatabaseCloner,
    DatabaseClonerFactory,
};
use crate::repl::storage::StorageInterface;
use crate::{ReplError, Result, ADMIN_DB_NAME, OPLOG_DB};
use bson::Document;
use mongodb::options::{FindOptions, ReplaceOptions};
use mongodb::sync::Client;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use tracing::info;

fn driver_err(e: mongodb::error::Error) -> ReplError {
    ReplError::Network(e.to_string())
}

/// Runs remote commands through pooled sync-driver clients, one per host.
pub struct MongoNetwork {
    clients: Mutex<HashMap<String, Client>>,
}

impl MongoNetwork {
    pub fn new() -> MongoNetwork {
        MongoNetwork {
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, host: &str) -> Result<Client> {
        let mut clients = self.clients.lock().unwrap();
        if let Some(c) = clients.get(host) {
            return Ok(c.clone());
        }
        let uri = if host.starts_with("mongodb://") {
            host.to_string()
        } else {
            format!("mongodb://{}", host)
        };
        let client = Client::with_uri_str(&uri).map_err(driver_err)?;
        clients.insert(host.to_string(), client.clone());
        Ok(client)
    }
}

impl Default for MongoNetwork {
    fn default() -> MongoNetwork {
        MongoNetwork::new()
    }
}

impl NetworkInterface for MongoNetwork {
    fn run_command(&self, req: &RemoteCommandRequest) -> Result<Document> {
        let client = self.client_for(&req.target)?;
        client
            .database(&req.db)
            .run_command(req.cmd.clone(), None)
            .map_err(driver_err)
    }
}

/// Storage interface backed by the local node's own server.
pub struct MongoStorage {
    client: Client,
}

impl MongoStorage {
    pub fn new(uri: &str) -> Result<MongoStorage> {
        Ok(MongoStorage {
            client: Client::with_uri_str(uri).map_err(driver_err)?,
        })
    }
}

impl StorageInterface for MongoStorage {
    fn drop_user_databases(&self, _txn: &mut crate::executor::DbTxn) -> Result<()> {
        let names = self
            .client
            .list_database_names(None, None)
            .map_err(driver_err)?;
        for name in names {
            if name == ADMIN_DB_NAME || name == OPLOG_DB || name == "config" {
                continue;
            }
            info!(db = %name, "dropping user database");
            self.client.database(&name).drop(None).map_err(driver_err)?;
        }
        Ok(())
    }

    fn insert_missing_doc(
        &self,
        _txn: &mut crate::executor::DbTxn,
        ns: &Namespace,
        doc: Document,
    ) -> Result<()> {
        let coll = self
            .client
            .database(ns.db())
            .collection::<Document>(ns.coll());
        // upsert so a retried insert stays idempotent.
        match doc.get(crate::ID_KEY) {
            Some(id) => {
                let filter = bson::doc! { crate::ID_KEY: id.clone() };
                coll.replace_one(
                    filter,
                    doc,
                    ReplaceOptions::builder().upsert(true).build(),
                )
                .map(|_| ())
                .map_err(driver_err)
            }
            None => coll.insert_one(doc, None).map(|_| ()).map_err(driver_err),
        }
    }

    fn insert_documents(
        &self,
        _txn: &mut crate::executor::DbTxn,
        ns: &Namespace,
        docs: Vec<Document>,
    ) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }
        self.client
            .database(ns.db())
            .collection::<Document>(ns.coll())
            .insert_many(docs, None)
            .map(|_| ())
            .map_err(driver_err)
    }
}

const CLONE_BATCH_SIZE: usize = 10000;

struct MongoClonerState {
    active: bool,
    started: bool,
}

struct MongoClonerInner {
    exec: Arc<dyn Executor>,
    client: Client,
    db_name: String,
    predicate: ClonePredicateFn,
    storage: Arc<dyn StorageInterface>,
    on_collection: CollectionProgressFn,
    finish: Mutex<Option<ClonerFinishFn>>,
    state: Mutex<MongoClonerState>,
    cv: Condvar,
    canceled: AtomicBool,
}

/// Copies one database collection by collection: read batches from the
/// source cursor, write them through the storage interface on the
/// executor's DB-work lane.  Index rebuilding is left to the server.
pub struct MongoDatabaseCloner {
    inner: Arc<MongoClonerInner>,
}

impl MongoClonerInner {
    fn run_clone(&self) -> Result<()> {
        let db = self.client.database(&self.db_name);
        let coll_names = db.list_collection_names(None).map_err(driver_err)?;
        for coll_name in coll_names {
            if self.canceled.load(Ordering::SeqCst) {
                return Err(ReplError::CallbackCanceled);
            }
            let ns = Namespace::new(&self.db_name, &coll_name);
            let result = self.clone_collection(&ns);
            (self.on_collection)(&ns, &result);
            result?;
        }
        Ok(())
    }

    fn clone_collection(&self, ns: &Namespace) -> Result<()> {
        let coll = self
            .client
            .database(ns.db())
            .collection::<Document>(ns.coll());
        let cursor = coll
            .find(
                None,
                FindOptions::builder().batch_size(CLONE_BATCH_SIZE as u32).build(),
            )
            .map_err(driver_err)?;
        let mut buffer = Vec::with_capacity(CLONE_BATCH_SIZE);
        for doc in cursor {
            if self.canceled.load(Ordering::SeqCst) {
                return Err(ReplError::CallbackCanceled);
            }
            let doc = doc.map_err(driver_err)?;
            if !(self.predicate)(&doc) {
                continue;
            }
            buffer.push(doc);
            if buffer.len() == CLONE_BATCH_SIZE {
                let mut data_to_write = Vec::with_capacity(CLONE_BATCH_SIZE);
                std::mem::swap(&mut buffer, &mut data_to_write);
                self.insert_batch(ns, data_to_write)?;
            }
        }
        if !buffer.is_empty() {
            self.insert_batch(ns, buffer)?;
        }
        Ok(())
    }

    fn insert_batch(&self, ns: &Namespace, docs: Vec<Document>) -> Result<()> {
        let storage = self.storage.clone();
        let insert_ns = ns.clone();
        let slot: Arc<Mutex<Option<Result<()>>>> = Arc::new(Mutex::new(None));
        let out = slot.clone();
        let handle = self.exec.schedule_db_work(
            Box::new(move |args, txn| {
                let r = if args.is_canceled() {
                    Err(ReplError::CallbackCanceled)
                } else {
                    storage.insert_documents(txn, &insert_ns, docs)
                };
                *out.lock().unwrap() = Some(r);
            }),
            Some(ns.clone()),
            LockMode::Ix,
        )?;
        self.exec.wait(&handle);
        let got = slot.lock().unwrap().take();
        got.unwrap_or_else(|| {
            Err(ReplError::BadValue(
                "collection clone insert produced no status".to_string(),
            ))
        })
    }

    fn finish_once(&self, status: Result<()>) {
        let finish = self.finish.lock().unwrap().take();
        if let Some(f) = finish {
            f(status);
        }
        let mut state = self.state.lock().unwrap();
        state.active = false;
        self.cv.notify_all();
    }
}

impl DatabaseCloner for MongoDatabaseCloner {
    fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.started {
                return Err(ReplError::IllegalOperation(
                    "database cloner already started".to_string(),
                ));
            }
            state.started = true;
            state.active = true;
        }
        let inner = self.inner.clone();
        std::thread::Builder::new()
            .name(format!("db-cloner-{}", inner.db_name))
            .spawn(move || {
                let result = inner.run_clone();
                inner.finish_once(result);
            })
            .map_err(|e| ReplError::BadValue(format!("could not spawn cloner thread: {}", e)))?;
        Ok(())
    }

    fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::SeqCst);
    }

    fn wait(&self) {
        let mut state = self.inner.state.lock().unwrap();
        while state.active {
            state = self.inner.cv.wait(state).unwrap();
        }
    }

    fn is_active(&self) -> bool {
        self.inner.state.lock().unwrap().active
    }
}

/// Builds [`MongoDatabaseCloner`]s sharing the network's client pool.
pub struct MongoDatabaseClonerFactory {
    network: Arc<MongoNetwork>,
}

impl MongoDatabaseClonerFactory {
    pub fn new(network: Arc<MongoNetwork>) -> MongoDatabaseClonerFactory {
        MongoDatabaseClonerFactory { network }
    }
}

impl DatabaseClonerFactory for MongoDatabaseClonerFactory {
    fn make(
        &self,
        exec: Arc<dyn Executor>,
        source: &str,
        db_name: &str,
        _filter: Document,
        predicate: ClonePredicateFn,
        storage: Arc<dyn StorageInterface>,
        on_collection: CollectionProgressFn,
        finish: ClonerFinishFn,
    ) -> Result<Arc<dyn DatabaseCloner>> {
        let client = self.network.client_for(source)?;
        Ok(Arc::new(MongoDatabaseCloner {
            inner: Arc::new(MongoClonerInner {
                exec,
                client,
                db_name: db_name.to_string(),
                predicate,
                storage,
                on_collection,
                finish: Mutex::new(Some(finish)),
                state: Mutex::new(MongoClonerState {
                    active: false,
                    started: false,
                }),
                cv: Condvar::new(),
                canceled: AtomicBool::new(false),
            }),
        }))
    }
}
