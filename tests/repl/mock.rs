//! Shared fixtures: a scripted network, coordinator/storage/cloner mocks
//! and small response builders used by the replication tests.

#![allow(dead_code)]

use bson::{doc, Bson, Document, Timestamp};
use repl_sync::executor::{
    DbTxn, Executor, LockMode, NetworkInterface, RemoteCommandRequest, ThreadPoolExecutor,
};
use repl_sync::repl::cloner::{
    ClonePredicateFn, ClonerFinishFn, CollectionProgressFn, DatabaseCloner,
    DatabaseClonerFactory,
};
use repl_sync::repl::coord::{MemberState, OpTime, ReplicationCoordinator};
use repl_sync::repl::storage::StorageInterface;
use repl_sync::{
    ApplierFn, Namespace, ReplError, Replicator, ReplicatorOptions, Result,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub fn ts(t: u32) -> Timestamp {
    Timestamp {
        time: t,
        increment: 0,
    }
}

/// A plausible oplog insert entry; carries `o2._id` so it can double as the
/// failed op in missing-document tests.
pub fn op_doc(t: u32) -> Document {
    doc! {
        "ts": ts(t),
        "op": "i",
        "ns": "test.coll",
        "o": { "_id": t as i32, "a": t as i32 },
        "o2": { "_id": t as i32 },
    }
}

pub fn oplog_range(from: u32, to: u32) -> Vec<Document> {
    (from..=to).map(op_doc).collect()
}

pub fn cursor_batch(
    ns: &str,
    cursor_id: i64,
    first: bool,
    docs: Vec<Document>,
) -> Result<Document> {
    let key = if first { "firstBatch" } else { "nextBatch" };
    Ok(doc! {
        "ok": 1.0,
        "cursor": {
            "id": cursor_id,
            "ns": ns,
            key: docs.into_iter().map(Bson::Document).collect::<Vec<Bson>>(),
        },
    })
}

pub fn latest_ts_resp(t: u32) -> Result<Document> {
    cursor_batch("local.oplog.rs", 0, true, vec![doc! {"ts": ts(t)}])
}

pub fn list_databases_resp(names: &[&str]) -> Result<Document> {
    Ok(doc! {
        "ok": 1.0,
        "databases": names
            .iter()
            .map(|n| Bson::Document(doc! {"name": *n}))
            .collect::<Vec<Bson>>(),
    })
}

pub fn ok_resp() -> Result<Document> {
    Ok(doc! {"ok": 1.0})
}

/// Routing key for scripted responses.  `find` commands are told apart by
/// shape: the latest-entry probe sorts on `$natural`, the oplog tail
/// filters on `ts`, the missing-document lookup filters on `_id`.
pub fn key_of(req: &RemoteCommandRequest) -> String {
    let name = req
        .cmd
        .keys()
        .next()
        .map(|k| k.to_string())
        .unwrap_or_default();
    if name != "find" {
        return name;
    }
    if let Ok(sort) = req.cmd.get_document("sort") {
        if sort.get("$natural").is_some() {
            return "find:latest".to_string();
        }
    }
    if let Ok(filter) = req.cmd.get_document("filter") {
        if filter.get("ts").is_some() {
            return "find:oplog".to_string();
        }
        if filter.get("_id").is_some() {
            return "find:missing".to_string();
        }
    }
    "find".to_string()
}

type DefaultFn = Box<dyn Fn(&RemoteCommandRequest) -> Result<Document> + Send + Sync>;

pub struct MockNetwork {
    scripts: Mutex<HashMap<String, VecDeque<Result<Document>>>>,
    default_fn: Mutex<Option<DefaultFn>>,
    requests: Mutex<Vec<RemoteCommandRequest>>,
}

impl MockNetwork {
    pub fn new() -> Arc<MockNetwork> {
        Arc::new(MockNetwork {
            scripts: Mutex::new(HashMap::new()),
            default_fn: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn enqueue(&self, key: &str, resp: Result<Document>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push_back(resp);
    }

    pub fn set_default<F>(&self, f: F)
    where
        F: Fn(&RemoteCommandRequest) -> Result<Document> + Send + Sync + 'static,
    {
        *self.default_fn.lock().unwrap() = Some(Box::new(f));
    }

    pub fn requests(&self) -> Vec<RemoteCommandRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_keyed(&self, key: &str) -> Vec<RemoteCommandRequest> {
        self.requests()
            .into_iter()
            .filter(|r| key_of(r) == key)
            .collect()
    }
}

impl NetworkInterface for MockNetwork {
    fn run_command(&self, req: &RemoteCommandRequest) -> Result<Document> {
        self.requests.lock().unwrap().push(req.clone());
        let key = key_of(req);
        if let Some(queue) = self.scripts.lock().unwrap().get_mut(&key) {
            if let Some(resp) = queue.pop_front() {
                return resp;
            }
        }
        if let Some(f) = &*self.default_fn.lock().unwrap() {
            return f(req);
        }
        Err(ReplError::Network(format!(
            "no scripted response for {}",
            key
        )))
    }
}

pub struct MockCoordinator {
    pub last_optime: Mutex<OpTime>,
    pub sources: Mutex<VecDeque<Option<String>>>,
    pub default_source: Mutex<Option<String>>,
    pub blacklisted: Mutex<Vec<(String, Instant)>>,
    pub follower_modes: Mutex<Vec<MemberState>>,
    pub optime_updates: Mutex<Vec<OpTime>>,
}

impl MockCoordinator {
    pub fn new(source: Option<&str>) -> Arc<MockCoordinator> {
        Arc::new(MockCoordinator {
            last_optime: Mutex::new(OpTime::new(ts(0), 0)),
            sources: Mutex::new(VecDeque::new()),
            default_source: Mutex::new(source.map(|s| s.to_string())),
            blacklisted: Mutex::new(Vec::new()),
            follower_modes: Mutex::new(Vec::new()),
            optime_updates: Mutex::new(Vec::new()),
        })
    }

    pub fn set_last_optime(&self, t: u32) {
        *self.last_optime.lock().unwrap() = OpTime::new(ts(t), 0);
    }

    pub fn push_source(&self, source: Option<&str>) {
        self.sources
            .lock()
            .unwrap()
            .push_back(source.map(|s| s.to_string()));
    }
}

impl ReplicationCoordinator for MockCoordinator {
    fn set_my_last_optime(&self, optime: OpTime) {
        *self.last_optime.lock().unwrap() = optime;
        self.optime_updates.lock().unwrap().push(optime);
    }

    fn get_my_last_optime(&self) -> OpTime {
        *self.last_optime.lock().unwrap()
    }

    fn choose_new_sync_source(&self) -> Option<String> {
        match self.sources.lock().unwrap().pop_front() {
            Some(s) => s,
            None => self.default_source.lock().unwrap().clone(),
        }
    }

    fn blacklist_sync_source(&self, host: &str, until: Instant) {
        self.blacklisted
            .lock()
            .unwrap()
            .push((host.to_string(), until));
    }

    fn set_follower_mode(&self, state: MemberState) -> bool {
        self.follower_modes.lock().unwrap().push(state);
        true
    }
}

pub struct MockStorage {
    pub missing_inserts: Mutex<Vec<(String, Document, LockMode)>>,
    pub bulk_inserts: Mutex<Vec<(String, usize)>>,
    pub dropped_user_dbs: AtomicUsize,
}

impl MockStorage {
    pub fn new() -> Arc<MockStorage> {
        Arc::new(MockStorage {
            missing_inserts: Mutex::new(Vec::new()),
            bulk_inserts: Mutex::new(Vec::new()),
            dropped_user_dbs: AtomicUsize::new(0),
        })
    }
}

impl StorageInterface for MockStorage {
    fn drop_user_databases(&self, _txn: &mut DbTxn) -> repl_sync::Result<()> {
        self.dropped_user_dbs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn insert_missing_doc(
        &self,
        txn: &mut DbTxn,
        ns: &Namespace,
        doc: Document,
    ) -> repl_sync::Result<()> {
        self.missing_inserts
            .lock()
            .unwrap()
            .push((ns.to_string(), doc, txn.lock_mode()));
        Ok(())
    }

    fn insert_documents(
        &self,
        _txn: &mut DbTxn,
        ns: &Namespace,
        docs: Vec<Document>,
    ) -> repl_sync::Result<()> {
        self.bulk_inserts
            .lock()
            .unwrap()
            .push((ns.to_string(), docs.len()));
        Ok(())
    }
}

#[derive(Clone)]
pub enum ClonerScript {
    Succeed,
    Fail(ReplError),
    FailConstruction,
}

pub struct MockClonerFactory {
    pub scripts: Mutex<HashMap<String, ClonerScript>>,
    pub made: Mutex<Vec<String>>,
}

impl MockClonerFactory {
    pub fn new() -> Arc<MockClonerFactory> {
        Arc::new(MockClonerFactory {
            scripts: Mutex::new(HashMap::new()),
            made: Mutex::new(Vec::new()),
        })
    }

    pub fn script(&self, db: &str, script: ClonerScript) {
        self.scripts
            .lock()
            .unwrap()
            .insert(db.to_string(), script);
    }
}

struct MockCloner {
    script: ClonerScript,
    finish: Mutex<Option<ClonerFinishFn>>,
    active: Mutex<bool>,
}

impl DatabaseCloner for MockCloner {
    fn start(&self) -> repl_sync::Result<()> {
        // completes inline, like a cloner over an empty database would.
        let finish = self.finish.lock().unwrap().take();
        *self.active.lock().unwrap() = false;
        if let Some(f) = finish {
            match &self.script {
                ClonerScript::Succeed => f(Ok(())),
                ClonerScript::Fail(e) => f(Err(e.clone())),
                ClonerScript::FailConstruction => f(Ok(())),
            }
        }
        Ok(())
    }

    fn cancel(&self) {
        let finish = self.finish.lock().unwrap().take();
        *self.active.lock().unwrap() = false;
        if let Some(f) = finish {
            f(Err(ReplError::CallbackCanceled));
        }
    }

    fn wait(&self) {}

    fn is_active(&self) -> bool {
        *self.active.lock().unwrap()
    }
}

impl DatabaseClonerFactory for MockClonerFactory {
    fn make(
        &self,
        _exec: Arc<dyn Executor>,
        _source: &str,
        db_name: &str,
        _filter: Document,
        _predicate: ClonePredicateFn,
        _storage: Arc<dyn StorageInterface>,
        _on_collection: CollectionProgressFn,
        finish: ClonerFinishFn,
    ) -> repl_sync::Result<Arc<dyn DatabaseCloner>> {
        self.made.lock().unwrap().push(db_name.to_string());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(db_name)
            .cloned()
            .unwrap_or(ClonerScript::Succeed);
        if matches!(script, ClonerScript::FailConstruction) {
            return Err(ReplError::BadValue(format!(
                "cannot build cloner for {}",
                db_name
            )));
        }
        Ok(Arc::new(MockCloner {
            script,
            finish: Mutex::new(Some(finish)),
            active: Mutex::new(false),
        }))
    }
}

/// Everything a replicator test needs, wired together.
pub struct Harness {
    pub network: Arc<MockNetwork>,
    pub exec: Arc<ThreadPoolExecutor>,
    pub coord: Arc<MockCoordinator>,
    pub storage: Arc<MockStorage>,
    pub factory: Arc<MockClonerFactory>,
}

impl Harness {
    pub fn new(source: Option<&str>) -> Harness {
        let network = MockNetwork::new();
        let exec = Arc::new(ThreadPoolExecutor::with_network_threads(
            network.clone() as Arc<dyn NetworkInterface>,
            4,
        ));
        Harness {
            network,
            exec,
            coord: MockCoordinator::new(source),
            storage: MockStorage::new(),
            factory: MockClonerFactory::new(),
        }
    }

    /// Options with short waits so retry loops finish quickly.
    pub fn options(&self, applier: ApplierFn) -> ReplicatorOptions {
        let mut opts = ReplicatorOptions::new(applier);
        opts.initial_sync_retry_wait = Duration::from_millis(5);
        opts.sync_source_retry_wait = Duration::from_millis(10);
        opts
    }

    pub fn replicator(&self, opts: ReplicatorOptions, with_coord: bool) -> Replicator {
        Replicator::new(
            opts,
            self.exec.clone(),
            if with_coord {
                Some(self.coord.clone() as Arc<dyn ReplicationCoordinator>)
            } else {
                None
            },
            self.storage.clone(),
            self.factory.clone(),
        )
    }
}

/// Ops-counting applier that reports the last `ts` of each batch.  Fails
/// the first `fail_first` invocations with a missing-document style error.
pub fn counting_applier(fail_first: usize) -> (ApplierFn, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let ops_applied = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));
    let ops_c = ops_applied.clone();
    let calls_c = calls.clone();
    let f: ApplierFn = Arc::new(move |_txn, ops| {
        let call = calls_c.fetch_add(1, Ordering::SeqCst);
        if call < fail_first {
            return Err(ReplError::BadValue("missing document".to_string()));
        }
        ops_c.fetch_add(ops.len(), Ordering::SeqCst);
        ops.iter()
            .rev()
            .find_map(|op| op.get_timestamp("ts").ok())
            .ok_or_else(|| ReplError::BadValue("batch has no ts".to_string()))
    });
    (f, ops_applied, calls)
}

pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
