//! Remote cursor plumbing: a find+getMore driver, the query-fetcher
//! adapter built on it, and the oplog tailing specialization that validates
//! its start position.

use crate::executor::{Executor, Handle, RemoteCommandRequest};
use crate::ns::Namespace;
use crate::{ReplError, Result, TIMESTAMP_KEY};
use bson::{doc, Bson, Document, Timestamp};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use tracing::warn;

/// What the cursor driver should do after a batch callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    /// Stop driving but leave the remote cursor open.
    Continue,
    /// Issue the next `getMore`.
    GetMore,
    /// The cursor is finished.
    NoAction,
}

/// One parsed cursor batch.
#[derive(Debug, Clone)]
pub struct BatchData {
    pub cursor_id: i64,
    pub ns: Namespace,
    pub documents: Vec<Document>,
}

/// Low-level callback: may fill the getMore builder to customize the next
/// request.
pub type FetchCallback =
    Arc<dyn Fn(&Result<BatchData>, &mut NextAction, Option<&mut Document>) + Send + Sync>;

/// Adapter-level callback used by [`QueryFetcher`] and [`OplogFetcher`].
pub type QueryCallback = Arc<dyn Fn(&Result<BatchData>, &mut NextAction) + Send + Sync>;

fn command_ok(doc: &Document) -> bool {
    match doc.get("ok") {
        Some(Bson::Double(v)) => *v == 1.0,
        Some(Bson::Int32(v)) => *v == 1,
        Some(Bson::Int64(v)) => *v == 1,
        Some(Bson::Boolean(b)) => *b,
        _ => false,
    }
}

/// Validate a command reply's `ok` field, returning the reply on success.
pub(crate) fn parse_command_ok(doc: &Document) -> Result<&Document> {
    if command_ok(doc) {
        Ok(doc)
    } else {
        let msg = doc.get_str("errmsg").unwrap_or("command returned ok: 0");
        Err(ReplError::CommandFailed(msg.to_string()))
    }
}

/// Parse a standard cursor reply: `{ok, cursor: {id, ns, firstBatch|nextBatch}}`.
pub(crate) fn parse_cursor_response(doc: &Document) -> Result<BatchData> {
    let doc = parse_command_ok(doc)?;
    let cursor = doc
        .get_document("cursor")
        .map_err(|_| ReplError::FailedToParse("cursor field missing or malformed".to_string()))?;
    let cursor_id = cursor
        .get_i64("id")
        .map_err(|_| ReplError::FailedToParse("cursor id missing".to_string()))?;
    let ns = Namespace::parse(
        cursor
            .get_str("ns")
            .map_err(|_| ReplError::FailedToParse("cursor ns missing".to_string()))?,
    )?;
    let batch = cursor
        .get_array("firstBatch")
        .or_else(|_| cursor.get_array("nextBatch"))
        .map_err(|_| ReplError::FailedToParse("cursor batch missing".to_string()))?;
    let mut documents = Vec::with_capacity(batch.len());
    for item in batch {
        match item {
            Bson::Document(d) => documents.push(d.clone()),
            _ => {
                return Err(ReplError::FailedToParse(
                    "cursor batch element is not a document".to_string(),
                ))
            }
        }
    }
    Ok(BatchData {
        cursor_id,
        ns,
        documents,
    })
}

struct FetchState {
    active: bool,
    scheduled: bool,
    canceled: bool,
    handle: Option<Handle>,
}

struct FetcherInner {
    weak_self: Weak<FetcherInner>,
    exec: Arc<dyn Executor>,
    source: String,
    db: String,
    cmd: Document,
    work: FetchCallback,
    state: Mutex<FetchState>,
    cv: Condvar,
}

/// Drives one remote cursor: issues the initial command, parses every
/// reply, hands each batch to the callback and keeps issuing `getMore`
/// while the callback asks for it.
pub struct Fetcher {
    inner: Arc<FetcherInner>,
}

impl Fetcher {
    pub fn new(
        exec: Arc<dyn Executor>,
        source: &str,
        db: &str,
        cmd: Document,
        work: FetchCallback,
    ) -> Fetcher {
        Fetcher {
            inner: Arc::new_cyclic(|weak| FetcherInner {
                weak_self: weak.clone(),
                exec,
                source: source.to_string(),
                db: db.to_string(),
                cmd,
                work,
                state: Mutex::new(FetchState {
                    active: false,
                    scheduled: false,
                    canceled: false,
                    handle: None,
                }),
                cv: Condvar::new(),
            }),
        }
    }

    pub fn schedule(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.canceled {
                return Err(ReplError::IllegalOperation(
                    "fetcher already canceled".to_string(),
                ));
            }
            if state.scheduled {
                return Err(ReplError::IllegalOperation(
                    "fetcher already scheduled".to_string(),
                ));
            }
            state.scheduled = true;
            state.active = true;
        }
        let cmd = self.inner.cmd.clone();
        if let Err(e) = self.inner.issue(cmd) {
            self.inner.finish();
            return Err(e);
        }
        Ok(())
    }

    /// Idempotent; the fetcher is inactive as soon as this returns.  A late
    /// completion from an in-flight request is delivered to the callback as
    /// `CallbackCanceled`.
    pub fn cancel(&self) {
        let handle = {
            let mut state = self.inner.state.lock().unwrap();
            if state.canceled {
                return;
            }
            state.canceled = true;
            state.active = false;
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

    pub fn is_active(&self) -> bool {
        self.inner.state.lock().unwrap().active
    }
}

impl FetcherInner {
    fn issue(&self, cmd: Document) -> Result<()> {
        let weak = self.weak_self.clone();
        let req = RemoteCommandRequest::new(self.source.clone(), self.db.clone(), cmd);
        let handle = self.exec.schedule_remote_command(
            req,
            Box::new(move |args, resp| {
                if let Some(inner) = weak.upgrade() {
                    let canceled = args.is_canceled();
                    inner.on_command_response(canceled, resp);
                }
            }),
        )?;
        self.state.lock().unwrap().handle = Some(handle);
        Ok(())
    }

    // Terminal paths deactivate BEFORE delivering the final callback: the
    // owner's callback is the natural place to decide on a replacement
    // fetcher, and it must observe this one as done.
    fn on_command_response(&self, args_canceled: bool, resp: Result<Document>) {
        debug_assert!(self.exec.is_run_thread());
        let canceled = args_canceled || self.state.lock().unwrap().canceled;
        if canceled {
            self.finish();
            let mut next = NextAction::NoAction;
            (self.work)(&Err(ReplError::CallbackCanceled), &mut next, None);
            return;
        }

        let result = resp.and_then(|doc| parse_cursor_response(&doc));
        match result {
            Ok(batch) => {
                let ended = batch.cursor_id == 0;
                let mut next = if ended {
                    NextAction::NoAction
                } else {
                    NextAction::GetMore
                };
                if ended {
                    self.finish();
                }
                let mut get_more = Document::new();
                let result = Ok(batch);
                (self.work)(&result, &mut next, Some(&mut get_more));
                if ended {
                    // the cursor is gone; whatever the callback asked for,
                    // there is nothing left to drive.
                    return;
                }
                if next != NextAction::GetMore {
                    self.finish();
                    return;
                }
                let batch = match &result {
                    Ok(b) => b,
                    Err(_) => unreachable!(),
                };
                if get_more.is_empty() {
                    get_more = doc! {"getMore": batch.cursor_id, "collection": batch.ns.coll()};
                }
                if let Err(e) = self.issue(get_more) {
                    warn!(?e, source = %self.source, "could not issue getMore");
                    self.finish();
                }
            }
            Err(e) => {
                self.finish();
                let mut next = NextAction::NoAction;
                (self.work)(&Err(e), &mut next, None);
            }
        }
    }

    fn finish(&self) {
        let mut state = self.state.lock().unwrap();
        state.active = false;
        self.cv.notify_all();
    }
}

/// Find+getMore over one namespace with a simplified callback; the getMore
/// request is built automatically from the batch's cursor id and collection.
pub struct QueryFetcher {
    fetcher: Fetcher,
}

impl QueryFetcher {
    pub fn new(
        exec: Arc<dyn Executor>,
        source: &str,
        ns: &Namespace,
        cmd: Document,
        work: QueryCallback,
    ) -> QueryFetcher {
        let cb: FetchCallback = Arc::new(move |result, next, get_more| {
            work(result, next);
            if let (Ok(batch), NextAction::GetMore, Some(bob)) = (result, *next, get_more) {
                bob.insert("getMore", batch.cursor_id);
                bob.insert("collection", batch.ns.coll());
            }
        });
        QueryFetcher {
            fetcher: Fetcher::new(exec, source, ns.db(), cmd, cb),
        }
    }

    pub fn schedule(&self) -> Result<()> {
        self.fetcher.schedule()
    }

    pub fn cancel(&self) {
        self.fetcher.cancel()
    }

    pub fn wait(&self) {
        self.fetcher.wait()
    }

    pub fn is_active(&self) -> bool {
        self.fetcher.is_active()
    }
}

/// Tails the remote oplog starting at a given timestamp.
///
/// The first batch must begin exactly at the requested timestamp; anything
/// else means the source's oplog no longer contains our position and the
/// callback sees [`ReplError::OplogStartMissing`].
pub struct OplogFetcher {
    query: QueryFetcher,
    start_ts: Timestamp,
}

impl OplogFetcher {
    pub fn new(
        exec: Arc<dyn Executor>,
        start_ts: Timestamp,
        source: &str,
        oplog_ns: &Namespace,
        work: QueryCallback,
    ) -> OplogFetcher {
        // TODO: request awaitData/oplogReplay cursor options in the find
        // command once the wire layer supports them.
        let cmd = doc! {
            "find": oplog_ns.coll(),
            "filter": { TIMESTAMP_KEY: { "$gte": start_ts } },
        };
        let responses = Arc::new(AtomicU64::new(0));
        let wrapped: QueryCallback = Arc::new(move |result, next| {
            let first = responses.fetch_add(1, Ordering::SeqCst) == 0;
            match result {
                Ok(batch) => {
                    if first {
                        let seen = batch
                            .documents
                            .first()
                            .and_then(|d| d.get_timestamp(TIMESTAMP_KEY).ok());
                        if seen != Some(start_ts) {
                            *next = NextAction::NoAction;
                            work(
                                &Err(ReplError::OplogStartMissing(format!(
                                    "first returned ts {:?} is not where we wanted to start: {:?}",
                                    seen, start_ts
                                ))),
                                next,
                            );
                            return;
                        }
                    }
                    // empty interim batches are just the tail idling, but a
                    // cursor ending must reach the owner even when empty.
                    if !batch.documents.is_empty() || *next == NextAction::NoAction {
                        work(result, next);
                    }
                }
                Err(_) => work(result, next),
            }
        });
        OplogFetcher {
            query: QueryFetcher::new(exec, source, oplog_ns, cmd, wrapped),
            start_ts,
        }
    }

    pub fn start_timestamp(&self) -> Timestamp {
        self.start_ts
    }

    pub fn schedule(&self) -> Result<()> {
        self.query.schedule()
    }

    pub fn cancel(&self) {
        self.query.cancel()
    }

    pub fn wait(&self) {
        self.query.wait()
    }

    pub fn is_active(&self) -> bool {
        self.query.is_active()
    }
}
