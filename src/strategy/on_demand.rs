// src/strategy/on_demand.rs

//! Synchronous single-record indexing.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::{AppError, Result};
use crate::models::{NOT_FOUND_MARKER, OFFLINE_MARKER, OnDemandConfig, Record};
use crate::pipeline::{BatchProgress, PipelineRuntime, StageKind};
use crate::storage::RecordSource;

use super::{DomainState, IndexingDomain};

pub const NAME: &str = "Web Archives On-Demand Indexing";

pub struct OnDemandIndexing {
    config: OnDemandConfig,
    indexing_disabled: bool,
    runtime: Arc<PipelineRuntime>,
    source: Arc<dyn RecordSource>,
    state: DomainState,
    outstanding: AtomicUsize,
    drained: Notify,
}

/// Counts one request as outstanding until dropped.
struct Outstanding<'a>(&'a OnDemandIndexing);

impl<'a> Outstanding<'a> {
    fn new(owner: &'a OnDemandIndexing) -> Self {
        owner.outstanding.fetch_add(1, Ordering::SeqCst);
        Self(owner)
    }
}

impl Drop for Outstanding<'_> {
    fn drop(&mut self) {
        if self.0.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

impl OnDemandIndexing {
    pub fn new(
        config: OnDemandConfig,
        indexing_disabled: bool,
        runtime: Arc<PipelineRuntime>,
        source: Arc<dyn RecordSource>,
    ) -> Self {
        Self {
            config,
            indexing_disabled,
            runtime,
            source,
            state: DomainState::default(),
            outstanding: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    /// Requests currently being served.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Index one record and return the tracked document as markup.
    ///
    /// With `offset` the document at that offset is tracked, otherwise the
    /// first one. Returns `OFFLINE_MARKER` when the strategy is not running
    /// and `NOT_FOUND_MARKER` when the record or offset does not exist or
    /// the tracked document was not indexed. Batch errors are returned as
    /// `AppError::IndexingFailed`.
    pub async fn index(&self, record_id: u64, offset: Option<u64>) -> Result<String> {
        let _outstanding = Outstanding::new(self);
        if !self.state.is_running() || self.state.is_stopping() {
            return Ok(OFFLINE_MARKER.to_string());
        }

        let mut attempts = 0;
        loop {
            let record = match offset {
                Some(offset) => self.source.fetch_batch_at(record_id, offset).await?,
                None => self.source.fetch_batch(record_id).await?,
            };
            let Some(record) = record else {
                log::debug!("{} not found", Record::label(record_id));
                return Ok(NOT_FOUND_MARKER.to_string());
            };
            let known = match offset {
                Some(offset) => record.documents.iter().any(|d| d.offset == offset),
                None => !record.documents.is_empty(),
            };
            if !known {
                log::debug!("{} has no document at {:?}", Record::label(record_id), offset);
                return Ok(NOT_FOUND_MARKER.to_string());
            }

            let batch = self.runtime.enqueue(record, offset, true).await?;
            let waited = self.wait(&batch).await;

            // Stop only returns once every batch has released its lock
            let config = self.runtime.config();
            if let Err(e) = batch.wait_settled(config.poll_interval(), config.batch_timeout()).await {
                log::warn!("{} did not settle: {}", batch.label(), e);
            }
            waited?;

            if batch.is_retry_later() {
                attempts += 1;
                if attempts > self.config.lock_retries {
                    return Err(AppError::lock_contention(Record::lock_key(record_id)));
                }
                log::info!(
                    "{} is locked elsewhere, retry {}/{}",
                    batch.label(),
                    attempts,
                    self.config.lock_retries
                );
                tokio::time::sleep(Duration::from_millis(self.config.lock_retry_delay_ms)).await;
                continue;
            }

            self.state.record(record_id);
            let markup = batch
                .tracked_document()
                .and_then(|doc| doc.held_document())
                .map(|doc| doc.to_xml())
                .unwrap_or_else(|| NOT_FOUND_MARKER.to_string());
            batch.mothball();
            return Ok(markup);
        }
    }

    async fn wait(&self, batch: &BatchProgress) -> Result<()> {
        let config = self.runtime.config();
        for kind in StageKind::ALL {
            batch
                .wait_for(kind, config.poll_interval(), config.batch_timeout())
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl IndexingDomain for OnDemandIndexing {
    fn name(&self) -> &'static str {
        NAME
    }

    fn is_running(&self) -> bool {
        self.state.is_running()
    }

    fn is_stopping(&self) -> bool {
        self.state.is_stopping()
    }

    async fn start(self: Arc<Self>) -> Result<()> {
        if self.indexing_disabled {
            return Err(AppError::indexing_disabled(NAME));
        }
        self.runtime.start().await;
        if self.state.begin() {
            log::info!("{} started", NAME);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.state.is_running() {
            return Ok(());
        }
        self.state.request_stop();
        log::info!("Stopping {}, {} requests outstanding", NAME, self.outstanding());

        let poll = Duration::from_millis(self.config.stop_poll_ms);
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.outstanding() == 0 {
                break;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }

        self.state.finish();
        log::info!("{} stopped", NAME);
        Ok(())
    }

    fn update_count(&self) -> u64 {
        self.state.update_count()
    }

    fn last_id_processed(&self) -> String {
        self.state
            .last_id()
            .map(Record::label)
            .unwrap_or_default()
    }
}
