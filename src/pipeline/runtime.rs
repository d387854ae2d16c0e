// src/pipeline/runtime.rs

//! Shared worker pools.
//!
//! One `PipelineRuntime` is built per process and handed to every strategy.
//! Each pool reads documents from its own bounded queue, so a slow stage
//! applies back-pressure to the one before it:
//!
//! ```text
//! enqueue -> [filter queue] -> filter workers -> [transform queue]
//!         -> transform workers -> [index queue] -> index workers -> settle
//! ```
//!
//! A batch settles when its last document turns terminal: the record lock
//! is released and waiters are woken.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_channel as chan;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::{AppError, Result};
use crate::lock::LockManager;
use crate::models::{PipelineConfig, Record};
use crate::rules::{AccessControl, SurtFilter};
use crate::services::TextExtractor;
use crate::storage::SearchSink;

use super::document::{IndexerDocument, StageKind};
use super::progress::BatchProgress;
use super::{filter, index, transform};

/// Collaborators shared by the stage workers.
pub struct PipelineDeps {
    pub surt_filter: SurtFilter,
    pub access: AccessControl,
    pub locks: Arc<LockManager>,
    pub sink: Arc<dyn SearchSink>,
    pub extractor: Arc<dyn TextExtractor>,
}

pub(crate) struct StageContext {
    pub(crate) deps: PipelineDeps,
    pub(crate) index_full_text: bool,
}

impl StageContext {
    /// Release the record lock and wake waiters once every document is terminal.
    pub(crate) async fn settle(&self, batch: &BatchProgress) {
        if !batch.begin_settle() {
            return;
        }
        if batch.holds_lock() {
            let key = Record::lock_key(batch.record_id());
            if let Err(e) = self.deps.locks.release(&key).await {
                log::error!("Failed to release lock {}: {}", key, e);
            }
        }
        log::debug!(
            "{} settled: {} indexed, {} errored in {:?}",
            batch.label(),
            batch.completed(StageKind::Index),
            batch.errored(),
            batch.elapsed()
        );
        batch.complete_settle();
    }
}

type Job = (Arc<BatchProgress>, Arc<IndexerDocument>);

struct Queue {
    tx: chan::Sender<Job>,
    rx: chan::Receiver<Job>,
}

impl Queue {
    fn bounded(capacity: usize) -> Self {
        let (tx, rx) = chan::bounded(capacity.max(1));
        Self { tx, rx }
    }
}

pub struct PipelineRuntime {
    config: PipelineConfig,
    context: Arc<StageContext>,
    filter: Queue,
    transform: Queue,
    index: Queue,
    started: AtomicBool,
    closed: AtomicBool,
    workers: Mutex<Vec<(StageKind, JoinHandle<()>)>>,
}

impl PipelineRuntime {
    pub fn new(config: PipelineConfig, deps: PipelineDeps) -> Self {
        let capacity = config.queue_capacity;
        Self {
            context: Arc::new(StageContext {
                deps,
                index_full_text: config.index_full_text,
            }),
            config,
            filter: Queue::bounded(capacity),
            transform: Queue::bounded(capacity),
            index: Queue::bounded(capacity),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.context.deps.locks
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
    }

    /// Spawn the worker pools. Safe to call from several strategies at once;
    /// only the first call spawns anything. Returns true for that call.
    pub async fn start(&self) -> bool {
        if self.started.load(Ordering::Acquire) {
            return false;
        }

        let mut workers = self.workers.lock().await;
        if self.started.load(Ordering::Acquire) {
            return false;
        }

        let pools = [
            (StageKind::Filter, self.config.filter_workers, &self.filter, Some(&self.transform)),
            (StageKind::Transform, self.config.transform_workers, &self.transform, Some(&self.index)),
            (StageKind::Index, self.config.index_workers, &self.index, None),
        ];
        for (kind, count, queue, next) in pools {
            for id in 0..count {
                let handle = tokio::spawn(run_worker(
                    kind,
                    id,
                    Arc::clone(&self.context),
                    queue.rx.clone(),
                    next.map(|q| q.tx.clone()),
                ));
                workers.push((kind, handle));
            }
        }

        log::info!(
            "Pipeline started: {} filter, {} transform, {} index workers",
            self.config.filter_workers,
            self.config.transform_workers,
            self.config.index_workers
        );
        self.started.store(true, Ordering::Release);
        true
    }

    /// Queue every document of `record` and return its tracker.
    ///
    /// `tracked_offset` picks the document a caller will wait for and `hold`
    /// keeps its committed search document in memory.
    pub async fn enqueue(
        &self,
        record: Record,
        tracked_offset: Option<u64>,
        hold: bool,
    ) -> Result<Arc<BatchProgress>> {
        if !self.is_started() {
            return Err(AppError::NotStarted(Record::label(record.id)));
        }

        let batch = Arc::new(BatchProgress::new(
            record.id,
            record.declared_count(),
            tracked_offset,
            hold,
        ));
        log::debug!(
            "Enqueueing {} ({} documents, {} bytes)",
            batch.label(),
            record.documents.len(),
            record.byte_size()
        );

        let mut documents = record.documents.into_iter();
        for source in documents.by_ref() {
            let doc = batch.add(source);
            if self
                .filter
                .tx
                .send((Arc::clone(&batch), Arc::clone(&doc)))
                .await
                .is_err()
            {
                self.abandon(&batch, &doc);
                break;
            }
        }
        for source in documents {
            let doc = batch.add(source);
            self.abandon(&batch, &doc);
        }

        batch.set_loading_complete();
        self.context.settle(&batch).await;
        Ok(batch)
    }

    fn abandon(&self, batch: &BatchProgress, doc: &IndexerDocument) {
        let error = AppError::NotStarted(format!("{} was not queued", doc.doc_id()));
        if doc.fail(StageKind::Filter, &error) {
            batch.record_document_error(doc.doc_id(), &error);
        }
    }

    /// Queued documents per stage: filter, transform, index.
    pub fn queue_depths(&self) -> [usize; 3] {
        [self.filter.tx.len(), self.transform.tx.len(), self.index.tx.len()]
    }

    /// Stop accepting work, drain each stage in order and join the workers.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut workers = std::mem::take(&mut *self.workers.lock().await);
        for (kind, queue) in [
            (StageKind::Filter, &self.filter),
            (StageKind::Transform, &self.transform),
            (StageKind::Index, &self.index),
        ] {
            queue.tx.close();
            let (pool, rest): (Vec<_>, Vec<_>) = workers.into_iter().partition(|(k, _)| *k == kind);
            workers = rest;
            for result in futures::future::join_all(pool.into_iter().map(|(_, h)| h)).await {
                if let Err(e) = result {
                    log::error!("{} worker panicked: {}", kind, e);
                }
            }
        }
        log::info!("Pipeline stopped");
    }
}

async fn run_worker(
    kind: StageKind,
    id: usize,
    context: Arc<StageContext>,
    rx: chan::Receiver<Job>,
    next: Option<chan::Sender<Job>>,
) {
    log::debug!("{} worker {} started", kind, id);

    while let Ok((batch, doc)) = rx.recv().await {
        let outcome = match doc.begin(kind) {
            Ok(()) => {
                let result = match kind {
                    StageKind::Filter => filter::process(&context, &batch, &doc).await,
                    StageKind::Transform => transform::process(&context, &batch, &doc).await,
                    StageKind::Index => index::process(&context, &doc).await,
                };
                result.and_then(|()| doc.finish(kind))
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                batch.record_stage_done(kind);
                match &next {
                    Some(tx) => {
                        if tx.send((Arc::clone(&batch), Arc::clone(&doc))).await.is_err() {
                            let error = AppError::NotStarted(format!("{} queue closed", kind));
                            fail(kind, &batch, &doc, &error);
                            context.settle(&batch).await;
                        }
                    }
                    None => context.settle(&batch).await,
                }
            }
            Err(e) => {
                log::warn!("{} failed for {}: {}", kind, doc.doc_id(), e);
                fail(kind, &batch, &doc, &e);
                context.settle(&batch).await;
            }
        }
    }

    log::debug!("{} worker {} stopped", kind, id);
}

fn fail(kind: StageKind, batch: &BatchProgress, doc: &IndexerDocument, error: &AppError) {
    if doc.fail(kind, error) {
        batch.record_document_error(doc.doc_id(), error);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::lock::MemoryLockStore;
    use crate::models::Document;
    use crate::pipeline::document::Stage;
    use crate::rules::{AccessRule, DocumentStatus};
    use crate::services::HtmlExtractor;
    use crate::storage::MemorySink;

    const WAIT: Duration = Duration::from_secs(10);
    const POLL: Duration = Duration::from_millis(20);

    struct Fixture {
        runtime: PipelineRuntime,
        sink: Arc<MemorySink>,
        locks: Arc<LockManager>,
    }

    fn fixture(filter: &str, rules: Vec<AccessRule>) -> Fixture {
        let sink = Arc::new(MemorySink::new());
        let locks = Arc::new(LockManager::new(
            Arc::new(MemoryLockStore::new()),
            "test",
            Duration::from_secs(60),
        ));
        let deps = PipelineDeps {
            surt_filter: SurtFilter::parse(filter).unwrap(),
            access: AccessControl::new(rules).unwrap(),
            locks: Arc::clone(&locks),
            sink: sink.clone(),
            extractor: Arc::new(HtmlExtractor),
        };
        let config = PipelineConfig {
            filter_workers: 2,
            transform_workers: 2,
            index_workers: 2,
            queue_capacity: 4,
            ..PipelineConfig::default()
        };
        Fixture {
            runtime: PipelineRuntime::new(config, deps),
            sink,
            locks,
        }
    }

    fn html(offset: u64, url: &str, body: &str) -> Document {
        Document::new(offset, url, "2015-06-01T00:00:00Z".parse().unwrap()).with_content(
            "text/html",
            format!("<html><head><title>Page {}</title></head><body>{}</body></html>", offset, body)
                .into_bytes(),
        )
    }

    #[tokio::test]
    async fn test_enqueue_requires_start() {
        let fx = fixture("", Vec::new());
        let result = fx.runtime.enqueue(Record::new(1, Vec::new()), None, false).await;
        assert!(matches!(result, Err(AppError::NotStarted(_))));
    }

    #[tokio::test]
    async fn test_start_gate_spawns_once() {
        let fx = Arc::new(fixture("", Vec::new()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let fx = Arc::clone(&fx);
                tokio::spawn(async move { fx.runtime.start().await })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(fx.runtime.is_started());
        assert_eq!(fx.runtime.workers.lock().await.len(), 6);
        fx.runtime.shutdown().await;
        assert!(!fx.runtime.is_started());
    }

    #[tokio::test]
    async fn test_batch_flows_to_sink() {
        let fx = fixture("", Vec::new());
        fx.runtime.start().await;

        let record = Record::new(
            3,
            vec![
                html(0, "http://www.nla.gov.au/a.html", "alpha   text"),
                html(10, "http://example.com/b.html", "beta"),
                Document::new(20, "http://example.com/logo.png", "2015-06-01T00:00:00Z".parse().unwrap())
                    .with_content("image/png", vec![0, 1, 2]),
            ],
        );
        let batch = fx.runtime.enqueue(record, Some(10), true).await.unwrap();
        batch.wait_for(StageKind::Index, POLL, WAIT).await.unwrap();
        batch.wait_settled(POLL, WAIT).await.unwrap();

        assert!(batch.finished_without_error());
        assert_eq!(fx.sink.len(), 3);
        assert_eq!(batch.completed(StageKind::Index), 3);

        let docs = fx.sink.documents();
        let gov = docs.iter().find(|d| d.id == "3/0").unwrap();
        assert!(gov.au_gov);
        assert_eq!(gov.full_text.as_deref(), Some("alpha text"));
        assert!((gov.boost - 1.35).abs() < 1e-6);

        let image = docs.iter().find(|d| d.id == "3/20").unwrap();
        assert!(image.full_text.is_none());
        assert!((image.boost - 0.9).abs() < 1e-6);

        let held = batch.tracked_document().unwrap().held_document().unwrap();
        assert_eq!(held.id, "3/10");
        assert_eq!(held.title, "Page 10");

        // lock released after settle
        assert!(fx.locks.store().get("warc-3").await.unwrap().is_none());
        fx.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_filter_rejects_and_access_rules() {
        let rule = AccessRule::new(9, "(com,example,", DocumentStatus::RestrictedForDelivery);
        let fx = fixture("+\n-(org,", vec![rule]);
        fx.runtime.start().await;

        let record = Record::new(
            4,
            vec![
                html(0, "http://example.com/", "kept"),
                html(1, "http://example.org/", "dropped"),
            ],
        );
        let batch = fx.runtime.enqueue(record, None, false).await.unwrap();
        batch.wait_settled(POLL, WAIT).await.unwrap();

        let docs = fx.sink.documents();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].rule_id, Some(9));
        assert_eq!(docs[0].status, DocumentStatus::RestrictedForDelivery);
        assert!(batch.documents().iter().all(|d| d.stage() == Stage::Indexed));
        fx.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_extraction_error_isolated_to_document() {
        let fx = fixture("", Vec::new());
        fx.runtime.start().await;

        let mut broken = html(5, "http://example.com/broken", "");
        broken.text_error = Some("corrupt payload".into());
        let record = Record::new(5, vec![html(0, "http://example.com/ok", "fine"), broken]);

        let batch = fx.runtime.enqueue(record, None, false).await.unwrap();
        let waited = batch.wait_for(StageKind::Index, POLL, WAIT).await;
        assert!(matches!(waited, Err(AppError::IndexingFailed { record_id: 5, .. })));
        batch.wait_settled(POLL, WAIT).await.unwrap();

        assert!(batch.has_errors());
        assert_eq!(batch.errored(), 1);
        assert_eq!(fx.sink.len(), 1);
        let states: Vec<_> = batch.documents().iter().map(|d| d.stage()).collect();
        assert_eq!(states, vec![Stage::Indexed, Stage::Errored]);
        fx.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_locked_record_is_deferred() {
        let fx = fixture("", Vec::new());
        fx.runtime.start().await;

        let other = LockManager::new(fx.locks.store().clone(), "other", Duration::from_secs(60));
        assert!(other.try_acquire("warc-6").await.unwrap());

        let record = Record::new(6, vec![html(0, "http://example.com/", "x")]);
        let batch = fx.runtime.enqueue(record, None, false).await.unwrap();
        batch.wait_settled(POLL, WAIT).await.unwrap();

        assert!(batch.is_retry_later());
        assert!(!batch.has_errors());
        assert!(fx.sink.is_empty());
        assert!(batch.documents()[0].is_deferred());
        // the other holder keeps its lock
        let lock = fx.locks.store().get("warc-6").await.unwrap().unwrap();
        assert_eq!(lock.holder, "other");
        fx.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_record_settles_immediately() {
        let fx = fixture("", Vec::new());
        fx.runtime.start().await;
        let batch = fx.runtime.enqueue(Record::new(7, Vec::new()), None, false).await.unwrap();
        assert!(batch.is_settled());
        assert!(batch.finished_without_error());
        fx.runtime.shutdown().await;
    }
}
