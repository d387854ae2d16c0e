// src/strategy/periodic.rs

//! Picks up new records, but only inside a daily time window.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, NaiveTime, Timelike};
use tokio::task::JoinHandle;

use crate::error::{AppError, Result};
use crate::models::{PeriodicConfig, Record};
use crate::pipeline::PipelineRuntime;
use crate::storage::{CursorStore, RecordSource};

use super::{DomainState, IndexingDomain};

pub const NAME: &str = "Web Archives Periodic Indexing";

/// Cursor name in the cursor store.
pub const CURSOR: &str = "periodic";

/// Daily `[start, stop]` window with minute resolution, both ends inclusive.
///
/// A stop time before the start time crosses midnight. Equal start and stop
/// times cover the whole day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunWindow {
    start_hour: u32,
    start_minute: u32,
    stop_hour: u32,
    stop_minute: u32,
    limit_running_time: bool,
}

fn check_hour(hour: u32) -> Result<u32> {
    if hour > 23 {
        return Err(AppError::validation(format!("hour must be within 0..=23, got {}", hour)));
    }
    Ok(hour)
}

fn check_minute(minute: u32) -> Result<u32> {
    if minute > 59 {
        return Err(AppError::validation(format!(
            "minute must be within 0..=59, got {}",
            minute
        )));
    }
    Ok(minute)
}

impl RunWindow {
    pub fn from_config(config: &PeriodicConfig) -> Result<Self> {
        let mut window = Self::default();
        window.set_start_hour(config.start_hour)?;
        window.set_start_minute(config.start_minute)?;
        window.set_stop_hour(config.stop_hour)?;
        window.set_stop_minute(config.stop_minute)?;
        window.set_limit_running_time(config.limit_running_time);
        Ok(window)
    }

    pub fn set_start_hour(&mut self, hour: u32) -> Result<()> {
        self.start_hour = check_hour(hour)?;
        Ok(())
    }

    pub fn set_start_minute(&mut self, minute: u32) -> Result<()> {
        self.start_minute = check_minute(minute)?;
        Ok(())
    }

    pub fn set_stop_hour(&mut self, hour: u32) -> Result<()> {
        self.stop_hour = check_hour(hour)?;
        Ok(())
    }

    pub fn set_stop_minute(&mut self, minute: u32) -> Result<()> {
        self.stop_minute = check_minute(minute)?;
        Ok(())
    }

    /// When false the window is ignored.
    pub fn set_limit_running_time(&mut self, limit: bool) {
        self.limit_running_time = limit;
    }

    pub fn limits_running_time(&self) -> bool {
        self.limit_running_time
    }

    pub fn start(&self) -> (u32, u32) {
        (self.start_hour, self.start_minute)
    }

    pub fn stop(&self) -> (u32, u32) {
        (self.stop_hour, self.stop_minute)
    }

    pub fn can_run_at(&self, now: NaiveTime) -> bool {
        if !self.limit_running_time {
            return true;
        }
        let now = (now.hour(), now.minute());
        let (start, stop) = (self.start(), self.stop());
        if start < stop {
            start <= now && now <= stop
        } else if start == stop {
            true
        } else {
            // Crosses midnight: outside the inverted window
            !(stop <= now && now <= start)
        }
    }

    pub fn can_run_now(&self) -> bool {
        self.can_run_at(Local::now().time())
    }
}

fn hh_mm((hour, minute): (u32, u32)) -> String {
    format!("{}:{:02}", hour, minute)
}

pub struct PeriodicIndexing {
    config: PeriodicConfig,
    window: Mutex<RunWindow>,
    indexing_disabled: bool,
    runtime: Arc<PipelineRuntime>,
    source: Arc<dyn RecordSource>,
    cursors: Arc<dyn CursorStore>,
    state: DomainState,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicIndexing {
    pub fn new(
        config: PeriodicConfig,
        indexing_disabled: bool,
        runtime: Arc<PipelineRuntime>,
        source: Arc<dyn RecordSource>,
        cursors: Arc<dyn CursorStore>,
    ) -> Result<Self> {
        Ok(Self {
            window: Mutex::new(RunWindow::from_config(&config)?),
            config,
            indexing_disabled,
            runtime,
            source,
            cursors,
            state: DomainState::default(),
            task: Mutex::new(None),
        })
    }

    fn lock_window(&self) -> MutexGuard<'_, RunWindow> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn window(&self) -> RunWindow {
        *self.lock_window()
    }

    /// Replace the window; takes effect at the next check.
    pub fn set_window(&self, window: RunWindow) {
        *self.lock_window() = window;
    }

    /// Keep indexing new records until a stop is requested.
    async fn run_loop(&self) -> Result<()> {
        let mut next = self
            .cursors
            .load_cursor(CURSOR)
            .await?
            .map_or(0, |id| id.saturating_add(1));
        let mut paused = false;

        while !self.state.is_stopping() {
            let window = self.window();
            if !window.can_run_now() {
                if !paused {
                    log::info!("{} outside its window, restart at {}", NAME, hh_mm(window.start()));
                    paused = true;
                }
                self.state
                    .sleep(Duration::from_secs(self.config.wait_interval_secs))
                    .await;
                continue;
            }
            if paused {
                log::info!("{} inside its window, pause at {}", NAME, hh_mm(window.stop()));
                paused = false;
            }

            let ids = self.source.list_ids(next, self.config.batch_size).await?;
            if ids.is_empty() {
                log::debug!("{}: nothing new after {}", NAME, Record::label(next));
                self.state
                    .sleep(Duration::from_secs(self.config.idle_poll_secs))
                    .await;
                continue;
            }

            let round = self.index_round(&ids).await?;
            if let Some(done) = round.done {
                self.cursors.save_cursor(CURSOR, done).await?;
                next = done.saturating_add(1);
            }
            if round.deferred {
                // Resume at the locked record after a pause
                self.state
                    .sleep(Duration::from_secs(self.config.idle_poll_secs))
                    .await;
            }
        }
        Ok(())
    }

    /// Index `ids` in order, stopping at the first record locked elsewhere.
    async fn index_round(&self, ids: &[u64]) -> Result<Round> {
        let poll = self.runtime.config().poll_interval();
        let timeout = self.runtime.config().batch_timeout();
        let mut round = Round::default();

        let mut batches = Vec::with_capacity(ids.len());
        for &id in ids {
            if self.state.is_stopping() || !self.window().can_run_now() {
                break;
            }
            match self.source.fetch_batch(id).await {
                Ok(Some(record)) => {
                    let batch = self.runtime.enqueue(record, None, false).await?;
                    batches.push((id, Some(batch)));
                }
                Ok(None) => batches.push((id, None)),
                Err(e) => {
                    log::warn!("Skipping {}: {}", Record::label(id), e);
                    batches.push((id, None));
                }
            }
        }

        for (id, batch) in batches {
            if let Some(batch) = batch {
                batch.wait_settled(poll, timeout).await?;
                if batch.is_retry_later() {
                    round.deferred = true;
                }
                if !round.deferred {
                    if batch.has_errors() {
                        log::warn!("{} finished with errors: {:?}", batch.label(), batch.errors());
                    } else {
                        self.state.record(id);
                    }
                }
                batch.mothball();
            }
            if !round.deferred {
                round.done = Some(id);
            }
        }
        Ok(round)
    }
}

#[derive(Debug, Default)]
struct Round {
    /// Highest id with everything up to it handled
    done: Option<u64>,
    deferred: bool,
}

#[async_trait]
impl IndexingDomain for PeriodicIndexing {
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
        log::info!("{} started", NAME);

        let this = Arc::clone(&self);
        let restart_delay = Duration::from_secs(self.config.restart_delay_secs);
        let handle = tokio::spawn(async move {
            loop {
                match this.run_loop().await {
                    Ok(()) => break,
                    Err(e) => {
                        log::error!("{} stopped unexpectedly: {}", NAME, e);
                        if !this.state.sleep(restart_delay).await {
                            break;
                        }
                        log::info!("{} restarting", NAME);
                    }
                }
            }
            this.state.finish();
            log::info!("{} stopped", NAME);
        });
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.state.is_running() {
            return Ok(());
        }
        self.state.request_stop();

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
        let mut status = self
            .state
            .last_id()
            .map(Record::label)
            .unwrap_or_else(|| "none".to_string());
        let window = self.window();
        if window.limits_running_time() {
            if window.can_run_now() {
                status.push_str(&format!(" pause at {}", hh_mm(window.stop())));
            } else {
                status.push_str(&format!(" restart at {}", hh_mm(window.start())));
            }
        }
        status
    }
}
