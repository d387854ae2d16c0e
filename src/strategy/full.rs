// src/strategy/full.rs

//! Full-corpus sweep.
//!
//! Record ids are enqueued in ascending order without waiting for each
//! batch. Up to `queue_limit` batches are in flight at once. The persisted
//! cursor only moves past an id once every id at or below it has settled,
//! so a restart never skips a record.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::error::{AppError, Result};
use crate::models::{FullReindexConfig, Record};
use crate::pipeline::{BatchProgress, PipelineRuntime};
use crate::storage::{CursorStore, RecordSource};

use super::{DomainState, IndexingDomain};

pub const NAME: &str = "Web Archives Full Corpus Indexing";

/// Cursor name in the cursor store.
pub const CURSOR: &str = "full_reindex";

pub struct FullReindex {
    config: FullReindexConfig,
    indexing_disabled: bool,
    runtime: Arc<PipelineRuntime>,
    source: Arc<dyn RecordSource>,
    cursors: Arc<dyn CursorStore>,
    state: DomainState,
    persisted: Mutex<Option<u64>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Bookkeeping for one sweep.
#[derive(Default)]
struct Sweep {
    /// First id of this sweep
    start: u64,
    /// Next id to ask the source for
    next: u64,
    /// Listed ids not yet enqueued
    listed: VecDeque<u64>,
    /// Source has no more ids in range
    exhausted: bool,
    in_flight: VecDeque<Arc<BatchProgress>>,
    /// Lock-deferred ids and when to try them again
    retries: VecDeque<(Instant, u64)>,
    /// Ids handed out but not yet settled
    pending: BTreeSet<u64>,
    highest: Option<u64>,
}

impl Sweep {
    /// Highest id with every id up to it settled.
    fn resume_point(&self) -> Option<u64> {
        let point = match self.pending.first() {
            Some(&first) => first.checked_sub(1),
            None => self.highest,
        };
        point.filter(|&p| p >= self.start)
    }

    fn is_done(&self) -> bool {
        self.exhausted && self.listed.is_empty() && self.in_flight.is_empty() && self.retries.is_empty()
    }
}

impl FullReindex {
    pub fn new(
        config: FullReindexConfig,
        indexing_disabled: bool,
        runtime: Arc<PipelineRuntime>,
        source: Arc<dyn RecordSource>,
        cursors: Arc<dyn CursorStore>,
    ) -> Self {
        Self {
            config,
            indexing_disabled,
            runtime,
            source,
            cursors,
            state: DomainState::default(),
            persisted: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    fn in_range(&self, id: u64) -> bool {
        self.config.max_id.is_none_or(|max| id <= max)
    }

    fn in_partition(&self, id: u64) -> bool {
        id % self.config.modulo_divisor.max(1) == self.config.modulo_remainder
    }

    pub fn persisted(&self) -> Option<u64> {
        *self.persisted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run the sweep to completion (or until stopped) on the current task.
    pub async fn run(&self) -> Result<()> {
        if self.indexing_disabled {
            return Err(AppError::indexing_disabled(NAME));
        }
        self.runtime.start().await;
        if !self.state.begin() {
            return Ok(());
        }
        let result = self.sweep().await;
        self.state.finish();
        result
    }

    async fn sweep(&self) -> Result<()> {
        let resume = self.cursors.load_cursor(CURSOR).await?;
        *self.persisted.lock().unwrap_or_else(PoisonError::into_inner) = resume;

        let start = match resume {
            None => self.config.min_id,
            Some(id) => match id.checked_add(1) {
                Some(next) => next.max(self.config.min_id),
                None => {
                    log::info!("{} cursor is at the last possible id, nothing to do", NAME);
                    return Ok(());
                }
            },
        };
        log::info!(
            "{} starting at {} (max {:?}, partition {} of {})",
            NAME,
            Record::label(start),
            self.config.max_id,
            self.config.modulo_remainder,
            self.config.modulo_divisor
        );

        let mut sweep = Sweep {
            start,
            next: start,
            ..Sweep::default()
        };
        let poll = self.runtime.config().poll_interval();

        while !self.state.is_stopping() {
            self.collect_settled(&mut sweep).await?;
            if sweep.is_done() {
                break;
            }

            if sweep.in_flight.len() >= self.config.queue_limit {
                self.state.sleep(poll).await;
                continue;
            }

            let due = sweep
                .retries
                .front()
                .is_some_and(|(at, _)| *at <= Instant::now());
            let id = if due {
                sweep.retries.pop_front().map(|(_, id)| id)
            } else {
                self.next_id(&mut sweep).await?
            };

            match id {
                Some(id) => self.enqueue(&mut sweep, id).await?,
                // Nothing to enqueue until a retry comes due or a batch settles
                None => {
                    self.state.sleep(poll).await;
                }
            }
        }

        // Drain what is already in the pipeline
        let timeout = self.runtime.config().batch_timeout();
        for batch in &sweep.in_flight {
            if let Err(e) = batch.wait_settled(poll, timeout).await {
                log::warn!("{} did not settle: {}", batch.label(), e);
            }
        }
        self.collect_settled(&mut sweep).await?;

        log::info!(
            "{} {}: {} records indexed, last {}",
            NAME,
            if sweep.is_done() { "finished" } else { "stopped" },
            self.state.update_count(),
            self.last_id_processed()
        );
        Ok(())
    }

    async fn next_id(&self, sweep: &mut Sweep) -> Result<Option<u64>> {
        if sweep.listed.is_empty() && !sweep.exhausted {
            let ids = self.source.list_ids(sweep.next, self.config.batch_size).await?;
            match ids.last().map(|last| last.checked_add(1)) {
                Some(Some(next)) => sweep.next = next,
                // Nothing listed, or the id space ends here
                _ => sweep.exhausted = true,
            }
            for id in ids {
                if !self.in_range(id) {
                    sweep.exhausted = true;
                    break;
                }
                if self.in_partition(id) {
                    sweep.listed.push_back(id);
                }
            }
        }
        Ok(sweep.listed.pop_front())
    }

    async fn enqueue(&self, sweep: &mut Sweep, id: u64) -> Result<()> {
        sweep.pending.insert(id);
        sweep.highest = sweep.highest.max(Some(id));

        match self.source.fetch_batch(id).await {
            Ok(Some(record)) => {
                let batch = self.runtime.enqueue(record, None, false).await?;
                self.state.set_last_id(id);
                sweep.in_flight.push_back(batch);
            }
            Ok(None) => {
                log::debug!("{} vanished before it could be fetched", Record::label(id));
                sweep.pending.remove(&id);
            }
            Err(e) => {
                log::warn!("Skipping {}: {}", Record::label(id), e);
                sweep.pending.remove(&id);
            }
        }
        Ok(())
    }

    /// Retire settled batches and persist the resume point.
    async fn collect_settled(&self, sweep: &mut Sweep) -> Result<()> {
        let retry_delay = Duration::from_secs(self.config.retry_delay_secs);
        let mut still_running = VecDeque::with_capacity(sweep.in_flight.len());

        for batch in sweep.in_flight.drain(..) {
            if !batch.is_settled() {
                still_running.push_back(batch);
                continue;
            }
            let id = batch.record_id();
            if batch.is_retry_later() {
                log::info!("{} is locked elsewhere, retrying in {:?}", batch.label(), retry_delay);
                sweep.retries.push_back((Instant::now() + retry_delay, id));
            } else {
                if batch.has_errors() {
                    log::warn!("{} finished with errors: {:?}", batch.label(), batch.errors());
                } else {
                    self.state.record(id);
                }
                sweep.pending.remove(&id);
            }
            batch.mothball();
        }
        sweep.in_flight = still_running;

        if let Some(point) = sweep.resume_point() {
            if self.persisted().is_none_or(|p| point > p) {
                self.cursors.save_cursor(CURSOR, point).await?;
                *self.persisted.lock().unwrap_or_else(PoisonError::into_inner) = Some(point);
                log::debug!("{} cursor persisted at {}", NAME, Record::label(point));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl IndexingDomain for FullReindex {
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
        if !self.state.begin() {
            return Ok(());
        }

        let this = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            if let Err(e) = this.sweep().await {
                log::error!("{} failed: {}", NAME, e);
            }
            this.state.finish();
        });
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.state.is_running() {
            return Ok(());
        }
        self.state.request_stop();
        log::info!("Stopping {}", NAME);

        let handle = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    log::error!("{} task panicked: {}", NAME, e);
                    self.state.finish();
                }
            }
            None => self.state.wait_finished(self.runtime.config().poll_interval()).await,
        }
        Ok(())
    }

    fn update_count(&self) -> u64 {
        self.state.update_count()
    }

    fn last_id_processed(&self) -> String {
        let label = |id: Option<u64>| id.map_or_else(|| "none".to_string(), |id| id.to_string());
        format!(
            "warc#{} (#{} has been persisted)",
            label(self.state.last_id()),
            label(self.persisted())
        )
    }
}
