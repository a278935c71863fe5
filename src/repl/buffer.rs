//! Bounded in-memory queue between the oplog fetcher and the applier.

use bson::Document;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// FIFO of oplog documents, capped by cumulative document bytes.
///
/// `push` applies producer backpressure: it blocks until the document fits.
/// A document larger than the whole cap is still admitted once the buffer is
/// empty, so a single oversized entry cannot wedge the pipeline.  Consumers
/// never block; the applier polls through the progress dispatcher.
pub struct OplogBuffer {
    core: Mutex<BufCore>,
    not_full: Condvar,
}

struct BufCore {
    queue: VecDeque<(Document, usize)>,
    bytes: usize,
    max_bytes: usize,
}

pub(crate) fn doc_size(doc: &Document) -> usize {
    bson::to_vec(doc).map(|v| v.len()).unwrap_or(0)
}

impl OplogBuffer {
    pub fn new(max_bytes: usize) -> OplogBuffer {
        OplogBuffer {
            core: Mutex::new(BufCore {
                queue: VecDeque::new(),
                bytes: 0,
                max_bytes,
            }),
            not_full: Condvar::new(),
        }
    }

    /// Append one document, blocking until it fits under the byte cap.
    pub fn push(&self, doc: Document) {
        let size = doc_size(&doc);
        let mut core = self.core.lock().unwrap();
        while core.bytes + size > core.max_bytes && !core.queue.is_empty() {
            core = self.not_full.wait(core).unwrap();
        }
        core.bytes += size;
        core.queue.push_back((doc, size));
    }

    pub fn try_pop(&self) -> Option<Document> {
        let mut core = self.core.lock().unwrap();
        match core.queue.pop_front() {
            Some((doc, size)) => {
                core.bytes -= size;
                self.not_full.notify_all();
                Some(doc)
            }
            None => None,
        }
    }

    /// Pop documents in order until `max_docs` or `max_bytes` is reached.
    /// Always returns at least one document when the buffer is non-empty.
    pub fn drain_batch(&self, max_docs: usize, max_bytes: usize) -> Vec<Document> {
        let mut core = self.core.lock().unwrap();
        let mut out = Vec::new();
        let mut batch_bytes = 0usize;
        while out.len() < max_docs {
            match core.queue.front() {
                Some((_, size)) if out.is_empty() || batch_bytes + size <= max_bytes => {
                    let (doc, size) = core.queue.pop_front().unwrap();
                    core.bytes -= size;
                    batch_bytes += size;
                    out.push(doc);
                }
                _ => break,
            }
        }
        if !out.is_empty() {
            self.not_full.notify_all();
        }
        out
    }

    pub fn len(&self) -> usize {
        self.core.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> usize {
        self.core.lock().unwrap().bytes
    }

    /// Whether `extra` more bytes would fit right now without blocking.
    pub fn fits(&self, extra: usize) -> bool {
        let core = self.core.lock().unwrap();
        core.queue.is_empty() || core.bytes + extra <= core.max_bytes
    }

    /// Empty the buffer.  Blocked producers are released; consumers are not
    /// notified of anything.
    pub fn clear(&self) {
        let mut core = self.core.lock().unwrap();
        core.queue.clear();
        core.bytes = 0;
        self.not_full.notify_all();
    }
}
