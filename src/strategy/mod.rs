// src/strategy/mod.rs

//! Scheduling strategies.
//!
//! Each strategy decides which records to index and when, and feeds them
//! into the shared `PipelineRuntime` it was constructed with:
//! - `OnDemandIndexing`: one record at a time, caller waits for the result
//! - `FullReindex`: ascending sweep over an id range with a persisted cursor
//! - `PeriodicIndexing`: picks up new records inside a daily time window
//! - `RuleRecheck`: re-applies access rules to committed documents when the
//!   rules change; it works on the index directly, not through the runtime

pub mod full;
pub mod on_demand;
pub mod periodic;
pub mod rule_recheck;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::Result;

pub use full::FullReindex;
pub use on_demand::OnDemandIndexing;
pub use periodic::{PeriodicIndexing, RunWindow};
pub use rule_recheck::RuleRecheck;

/// Control surface shared by every strategy.
#[async_trait]
pub trait IndexingDomain: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_running(&self) -> bool;

    /// A stop was requested and outstanding work is draining.
    fn is_stopping(&self) -> bool;

    /// Refuses with `AppError::IndexingDisabled` when indexing is turned off.
    async fn start(self: Arc<Self>) -> Result<()>;

    /// Stop taking new work and wait until in-flight batches settle.
    async fn stop(&self) -> Result<()>;

    /// Records indexed since start.
    fn update_count(&self) -> u64;

    /// Human-readable progress marker for status pages.
    fn last_id_processed(&self) -> String;
}

/// Run state shared by the strategy implementations.
#[derive(Debug, Default)]
pub(crate) struct DomainState {
    running: AtomicBool,
    stopping: AtomicBool,
    update_count: AtomicU64,
    last_id: Mutex<Option<u64>>,
    wake: Notify,
}

impl DomainState {
    /// Flip to running. False if already running.
    pub(crate) fn begin(&self) -> bool {
        let begun = self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if begun {
            self.stopping.store(false, Ordering::SeqCst);
        }
        begun
    }

    // SeqCst: stop stores this flag then reads the on-demand request counter,
    // a request bumps the counter then reads this flag
    pub(crate) fn request_stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    pub(crate) fn finish(&self) {
        self.running.store(false, Ordering::Release);
        self.stopping.store(false, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub(crate) fn record(&self, record_id: u64) {
        self.update_count.fetch_add(1, Ordering::AcqRel);
        self.set_last_id(record_id);
    }

    pub(crate) fn set_last_id(&self, record_id: u64) {
        *self.last_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(record_id);
    }

    pub(crate) fn last_id(&self) -> Option<u64> {
        *self.last_id.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn update_count(&self) -> u64 {
        self.update_count.load(Ordering::Acquire)
    }

    /// Sleep for `duration`, waking early on a stop request.
    /// Returns false if the strategy is stopping.
    pub(crate) async fn sleep(&self, duration: Duration) -> bool {
        let notified = self.wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_stopping() {
            return false;
        }
        tokio::select! {
            _ = &mut notified => {}
            _ = tokio::time::sleep(duration) => {}
        }
        !self.is_stopping()
    }

    /// Wait until the running flag drops.
    pub(crate) async fn wait_finished(&self, poll: Duration) {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_running() {
                return;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let state = DomainState::default();
        assert!(state.begin());
        assert!(!state.begin());
        assert!(state.is_running());

        state.request_stop();
        assert!(state.is_stopping());
        state.finish();
        assert!(!state.is_running());
        assert!(!state.is_stopping());

        state.record(12);
        state.record(13);
        assert_eq!(state.update_count(), 2);
        assert_eq!(state.last_id(), Some(13));
    }

    #[tokio::test]
    async fn test_sleep_wakes_on_stop() {
        let state = Arc::new(DomainState::default());
        state.begin();

        let sleeper = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.sleep(Duration::from_secs(60)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        state.request_stop();

        let slept = tokio::time::timeout(Duration::from_secs(5), sleeper)
            .await
            .unwrap()
            .unwrap();
        assert!(!slept);
    }
}
