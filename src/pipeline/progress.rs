// src/pipeline/progress.rs

//! Progress of one record's documents through the pipeline.
//!
//! Stage predicates scan the per-document atomic stages, so workers never
//! take a batch-wide lock. Any stage transition wakes waiters through a
//! `Notify`; waiters also re-check on a bounded poll interval and give up
//! on errors or after a timeout.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, OnceCell};

use crate::error::{AppError, Result};
use crate::models::{Document, Record};
use crate::pipeline::document::{IndexerDocument, StageKind};

/// Error messages kept per batch; later ones are only counted.
pub const ERROR_QUEUE_LIMIT: usize = 5;

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct BatchProgress {
    record_id: u64,
    declared_count: usize,
    tracked_offset: Option<u64>,
    hold_tracked: bool,

    documents: RwLock<Vec<Arc<IndexerDocument>>>,
    loading_complete: AtomicBool,
    loading_failed: AtomicBool,

    filtered: AtomicUsize,
    transformed: AtomicUsize,
    indexed: AtomicUsize,
    errored: AtomicUsize,

    errors: Mutex<VecDeque<String>>,
    discarded_errors: AtomicUsize,

    retry_later: AtomicBool,
    lock: OnceCell<bool>,
    settling: AtomicBool,
    settled: AtomicBool,

    batch_bytes: AtomicU64,
    started_at: DateTime<Utc>,
    started: Instant,
    changed: Notify,
}

impl BatchProgress {
    /// `tracked_offset` selects the tracked document (the first one when `None`).
    /// With `hold_tracked`, its committed search document is retained.
    pub fn new(
        record_id: u64,
        declared_count: usize,
        tracked_offset: Option<u64>,
        hold_tracked: bool,
    ) -> Self {
        Self {
            record_id,
            declared_count,
            tracked_offset,
            hold_tracked,
            documents: RwLock::new(Vec::with_capacity(declared_count)),
            loading_complete: AtomicBool::new(false),
            loading_failed: AtomicBool::new(false),
            filtered: AtomicUsize::new(0),
            transformed: AtomicUsize::new(0),
            indexed: AtomicUsize::new(0),
            errored: AtomicUsize::new(0),
            errors: Mutex::new(VecDeque::with_capacity(ERROR_QUEUE_LIMIT)),
            discarded_errors: AtomicUsize::new(0),
            retry_later: AtomicBool::new(false),
            lock: OnceCell::new(),
            settling: AtomicBool::new(false),
            settled: AtomicBool::new(false),
            batch_bytes: AtomicU64::new(0),
            started_at: Utc::now(),
            started: Instant::now(),
            changed: Notify::new(),
        }
    }

    pub fn record_id(&self) -> u64 {
        self.record_id
    }

    pub fn label(&self) -> String {
        Record::label(self.record_id)
    }

    pub fn declared_count(&self) -> usize {
        self.declared_count
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn batch_bytes(&self) -> u64 {
        self.batch_bytes.load(Ordering::Relaxed)
    }

    fn read_documents(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<IndexerDocument>>> {
        self.documents.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_tracked(&self, position: usize, document: &Document) -> bool {
        match self.tracked_offset {
            Some(offset) => document.offset == offset,
            None => position == 0,
        }
    }

    /// Add a document to the batch; it starts `queued`.
    pub fn add(&self, source: Document) -> Arc<IndexerDocument> {
        self.batch_bytes
            .fetch_add(source.content.len() as u64, Ordering::Relaxed);

        let mut documents = self.documents.write().unwrap_or_else(PoisonError::into_inner);
        let tracked = self.is_tracked(documents.len(), &source);
        let document = Arc::new(IndexerDocument::new(self.record_id, source));
        if tracked && self.hold_tracked {
            document.set_hold(true);
        }
        documents.push(Arc::clone(&document));
        document
    }

    pub fn documents(&self) -> Vec<Arc<IndexerDocument>> {
        self.read_documents().clone()
    }

    pub fn len(&self) -> usize {
        self.read_documents().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_documents().is_empty()
    }

    /// The document a synchronous caller is waiting for.
    pub fn tracked_document(&self) -> Option<Arc<IndexerDocument>> {
        let documents = self.read_documents();
        match self.tracked_offset {
            Some(offset) => documents.iter().find(|d| d.offset() == offset).cloned(),
            None => documents.first().cloned(),
        }
    }

    pub fn set_loading_complete(&self) {
        self.loading_complete.store(true, Ordering::Release);
        self.changed.notify_waiters();
    }

    pub fn set_loading_failed(&self, error: &AppError) {
        self.loading_failed.store(true, Ordering::Release);
        self.track_error(format!("loading failed: {}", error));
    }

    pub fn is_loading_complete(&self) -> bool {
        self.loading_complete.load(Ordering::Acquire)
    }

    pub fn is_loading_failed(&self) -> bool {
        self.loading_failed.load(Ordering::Acquire)
    }

    fn stage_complete(&self, kind: StageKind) -> bool {
        self.is_loading_complete()
            && self
                .read_documents()
                .iter()
                .all(|d| kind.is_past(d.stage()))
    }

    /// No document is `queued` or `filtering`.
    pub fn is_filter_complete(&self) -> bool {
        self.stage_complete(StageKind::Filter)
    }

    pub fn is_transform_complete(&self) -> bool {
        self.stage_complete(StageKind::Transform)
    }

    /// Every document is `indexed` or `errored`.
    pub fn is_index_complete(&self) -> bool {
        self.stage_complete(StageKind::Index)
    }

    pub fn is_stage_complete(&self, kind: StageKind) -> bool {
        self.stage_complete(kind)
    }

    pub fn has_errors(&self) -> bool {
        self.errored.load(Ordering::Acquire) > 0
            || self.discarded_errors.load(Ordering::Acquire) > 0
            || !guard(&self.errors).is_empty()
            || self.is_loading_failed()
    }

    pub fn finished(&self) -> bool {
        self.is_filter_complete() && self.is_transform_complete() && self.is_index_complete()
    }

    pub fn finished_without_error(&self) -> bool {
        self.finished() && !self.has_errors()
    }

    /// Successful completions of `kind` so far.
    pub fn completed(&self, kind: StageKind) -> usize {
        let counter = match kind {
            StageKind::Filter => &self.filtered,
            StageKind::Transform => &self.transformed,
            StageKind::Index => &self.indexed,
        };
        counter.load(Ordering::Acquire)
    }

    pub fn errored(&self) -> usize {
        self.errored.load(Ordering::Acquire)
    }

    pub(crate) fn record_stage_done(&self, kind: StageKind) {
        let counter = match kind {
            StageKind::Filter => &self.filtered,
            StageKind::Transform => &self.transformed,
            StageKind::Index => &self.indexed,
        };
        counter.fetch_add(1, Ordering::AcqRel);
        self.changed.notify_waiters();
    }

    pub(crate) fn record_document_error(&self, doc_id: &str, error: &AppError) {
        self.errored.fetch_add(1, Ordering::AcqRel);
        self.track_error(format!("{}: {}", doc_id, error));
    }

    /// Queue an error message, counting it as discarded once the queue is full.
    pub fn track_error(&self, message: String) {
        {
            let mut errors = guard(&self.errors);
            if errors.len() < ERROR_QUEUE_LIMIT {
                errors.push_back(message);
            } else {
                self.discarded_errors.fetch_add(1, Ordering::AcqRel);
            }
        }
        self.changed.notify_waiters();
    }

    pub fn errors(&self) -> Vec<String> {
        guard(&self.errors).iter().cloned().collect()
    }

    pub fn discarded_errors(&self) -> usize {
        self.discarded_errors.load(Ordering::Acquire)
    }

    pub fn mark_retry_later(&self) {
        self.retry_later.store(true, Ordering::Release);
    }

    /// The record was locked by another process while this batch filtered.
    pub fn is_retry_later(&self) -> bool {
        self.retry_later.load(Ordering::Acquire)
    }

    /// Run `acquire` once per batch; concurrent callers share its outcome.
    pub async fn claim_lock<F, Fut>(&self, acquire: F) -> Result<bool>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<bool>>,
    {
        self.lock.get_or_try_init(acquire).await.copied()
    }

    pub fn holds_lock(&self) -> bool {
        self.lock.get().copied().unwrap_or(false)
    }

    /// Claim the settlement of a batch whose documents are all terminal.
    /// True for exactly one caller, which must then call `complete_settle`.
    pub(crate) fn begin_settle(&self) -> bool {
        self.is_index_complete()
            && self
                .settling
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    pub(crate) fn complete_settle(&self) {
        self.settled.store(true, Ordering::Release);
        self.changed.notify_waiters();
    }

    /// Every document is terminal and the record lock has been released.
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Wait until `kind` is complete for every document.
    ///
    /// Fails as soon as the batch has errors, or when `timeout` passes.
    pub async fn wait_for(&self, kind: StageKind, poll: Duration, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.has_errors() {
                let first = self.errors().into_iter().next().unwrap_or_default();
                return Err(AppError::indexing_failed(self.record_id, first));
            }
            if self.stage_complete(kind) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(AppError::timeout(format!(
                    "{} stage of {}",
                    kind,
                    self.label()
                )));
            }
            let wait = poll.min(deadline - now);
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Wait until the batch settles, regardless of errors.
    pub async fn wait_settled(&self, poll: Duration, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_settled() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(AppError::timeout(format!("settling {}", self.label())));
            }
            let wait = poll.min(deadline - now);
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Drop per-document state once the batch is no longer watched.
    pub fn mothball(&self) {
        self.documents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
