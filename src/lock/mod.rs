// src/lock/mod.rs

//! Persisted mutual exclusion keyed by record id.
//!
//! A `Lock` row names its holder and an expiry deadline. Acquisition is a
//! compare-and-insert at the store: it succeeds only when no live lock
//! exists for the key. Locks are not reentrant, a holder asking twice is
//! refused until it releases.
//!
//! Crashed holders stop checking in, their locks pass the deadline and the
//! periodic sweep (`expire_stale`) removes them.

pub mod memory;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::models::LockConfig;

pub use memory::MemoryLockStore;

/// One row of the lock table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub key: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub checked_in: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lock {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at >= now
    }
}

/// Storage backend for the lock table.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Insert `lock` unless a live lock exists for its key. Expired rows are replaced.
    async fn try_insert(&self, lock: Lock, now: DateTime<Utc>) -> Result<bool>;

    /// Delete the lock for `key` if `holder` owns it.
    async fn remove(&self, key: &str, holder: &str) -> Result<bool>;

    /// Delete every lock whose deadline is before `now`.
    async fn remove_expired(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Move the deadline of every lock owned by `holder`.
    async fn refresh(
        &self,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<usize>;

    async fn get(&self, key: &str) -> Result<Option<Lock>>;

    async fn list(&self) -> Result<Vec<Lock>>;
}

pub struct LockManager {
    store: Arc<dyn LockStore>,
    owner: String,
    ttl: TimeDelta,
}

impl LockManager {
    pub fn new(store: Arc<dyn LockStore>, owner: impl Into<String>, ttl: Duration) -> Self {
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
        Self {
            store,
            owner: owner.into(),
            ttl,
        }
    }

    pub fn from_config(store: Arc<dyn LockStore>, config: &LockConfig) -> Self {
        Self::new(store, &config.owner, Duration::from_millis(config.ttl_ms))
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn store(&self) -> &Arc<dyn LockStore> {
        &self.store
    }

    fn deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Take the lock for `key`; false when a live lock already exists.
    pub async fn try_acquire(&self, key: &str) -> Result<bool> {
        let now = Utc::now();
        let lock = Lock {
            key: key.to_string(),
            holder: self.owner.clone(),
            acquired_at: now,
            checked_in: now,
            expires_at: self.deadline(now),
        };
        let acquired = self.store.try_insert(lock, now).await?;
        if acquired {
            log::debug!("Lock '{}' acquired by {}", key, self.owner);
        } else {
            log::debug!("Lock '{}' is held elsewhere", key);
        }
        Ok(acquired)
    }

    /// Release a lock this process holds. Returns false if it was not ours.
    pub async fn release(&self, key: &str) -> Result<bool> {
        let released = self.store.remove(key, &self.owner).await?;
        if released {
            log::debug!("Lock '{}' released by {}", key, self.owner);
        } else {
            log::warn!("Lock '{}' was not held by {} at release", key, self.owner);
        }
        Ok(released)
    }

    /// Delete every lock past its deadline.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired = self.store.remove_expired(now).await?;
        if expired > 0 {
            log::info!("Expired {} stale locks", expired);
        }
        Ok(expired)
    }

    /// Push back the deadline of every lock this process holds.
    pub async fn check_in(&self) -> Result<usize> {
        let now = Utc::now();
        self.store.refresh(&self.owner, now, self.deadline(now)).await
    }

    /// Run `work` while holding `key`, releasing on every exit path.
    ///
    /// Returns `Ok(None)` without running `work` when the lock is taken.
    pub async fn with_lock<T, F, Fut>(&self, key: &str, work: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.try_acquire(key).await? {
            return Ok(None);
        }
        let outcome = work().await;
        let released = self.release(key).await;
        let value = outcome?;
        released?;
        Ok(Some(value))
    }

    /// Spawn the check-in and stale-sweep loop.
    pub fn spawn_keepalive(self: Arc<Self>, keepalive: Duration, sweep: Duration) -> Keepalive {
        let shutdown = Arc::new(Notify::new());
        let stop = Arc::clone(&shutdown);

        let handle = tokio::spawn(async move {
            let mut checkin_timer = tokio::time::interval(keepalive);
            let mut sweep_timer = tokio::time::interval(sweep);
            loop {
                tokio::select! {
                    _ = stop.notified() => break,
                    _ = checkin_timer.tick() => {
                        if let Err(e) = self.check_in().await {
                            log::error!("Lock check-in failed for {}: {}", self.owner, e);
                        }
                    }
                    _ = sweep_timer.tick() => {
                        if let Err(e) = self.expire_stale(Utc::now()).await {
                            log::error!("Stale lock sweep failed: {}", e);
                        }
                    }
                }
            }
            log::debug!("Lock keepalive for {} stopped", self.owner);
        });

        Keepalive { shutdown, handle }
    }
}

/// Handle to a running keepalive loop.
pub struct Keepalive {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl Keepalive {
    pub async fn stop(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.handle.await {
            log::error!("Lock keepalive task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;

    fn manager(owner: &str, store: Arc<MemoryLockStore>) -> LockManager {
        LockManager::new(store, owner, Duration::from_secs(120))
    }

    #[tokio::test]
    async fn test_lock_round_trip() {
        let locks = manager("a", Arc::new(MemoryLockStore::new()));

        assert!(locks.try_acquire("warc-1").await.unwrap());
        assert!(!locks.try_acquire("warc-1").await.unwrap());
        assert!(locks.release("warc-1").await.unwrap());
        assert!(locks.try_acquire("warc-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_release_requires_holder() {
        let store = Arc::new(MemoryLockStore::new());
        let a = manager("a", Arc::clone(&store));
        let b = manager("b", Arc::clone(&store));

        assert!(a.try_acquire("warc-2").await.unwrap());
        assert!(!b.try_acquire("warc-2").await.unwrap());
        assert!(!b.release("warc-2").await.unwrap());
        assert!(a.release("warc-2").await.unwrap());
        assert!(b.try_acquire("warc-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_is_reclaimed() {
        let store = Arc::new(MemoryLockStore::new());
        let crashed = LockManager::new(store.clone(), "crashed", Duration::ZERO);
        let survivor = manager("survivor", Arc::clone(&store));

        assert!(crashed.try_acquire("warc-3").await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;

        // acquisition replaces the expired row directly
        assert!(survivor.try_acquire("warc-3").await.unwrap());
        let lock = store.get("warc-3").await.unwrap().unwrap();
        assert_eq!(lock.holder, "survivor");
    }

    #[tokio::test]
    async fn test_expire_stale() {
        let store = Arc::new(MemoryLockStore::new());
        let short = LockManager::new(store.clone(), "short", Duration::ZERO);
        let long = manager("long", Arc::clone(&store));

        assert!(short.try_acquire("warc-4").await.unwrap());
        assert!(long.try_acquire("warc-5").await.unwrap());

        let later = Utc::now() + TimeDelta::seconds(1);
        assert_eq!(long.expire_stale(later).await.unwrap(), 1);
        assert!(store.get("warc-4").await.unwrap().is_none());
        assert!(store.get("warc-5").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_check_in_extends_deadline() {
        let store = Arc::new(MemoryLockStore::new());
        let locks = manager("a", Arc::clone(&store));
        assert!(locks.try_acquire("warc-6").await.unwrap());
        let before = store.get("warc-6").await.unwrap().unwrap().expires_at;

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(locks.check_in().await.unwrap(), 1);
        let after = store.get("warc-6").await.unwrap().unwrap().expires_at;
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_has_one_winner() {
        let store = Arc::new(MemoryLockStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let locks = manager(&format!("worker-{}", i), Arc::clone(&store));
            handles.push(tokio::spawn(async move {
                locks.try_acquire("warc-7").await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_error() {
        let store = Arc::new(MemoryLockStore::new());
        let locks = manager("a", Arc::clone(&store));

        let result: Result<Option<()>> = locks
            .with_lock("warc-8", || async { Err(AppError::validation("boom")) })
            .await;
        assert!(result.is_err());
        assert!(store.get("warc-8").await.unwrap().is_none());

        let value = locks.with_lock("warc-8", || async { Ok(5) }).await.unwrap();
        assert_eq!(value, Some(5));
        assert!(store.get("warc-8").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_with_lock_skips_when_held() {
        let store = Arc::new(MemoryLockStore::new());
        let a = manager("a", Arc::clone(&store));
        let b = manager("b", Arc::clone(&store));
        assert!(a.try_acquire("warc-9").await.unwrap());

        let value = b.with_lock("warc-9", || async { Ok(1) }).await.unwrap();
        assert_eq!(value, None);
        assert_eq!(store.get("warc-9").await.unwrap().unwrap().holder, "a");
    }

    #[tokio::test]
    async fn test_keepalive_sweeps_and_stops() {
        let store = Arc::new(MemoryLockStore::new());
        let stale = LockManager::new(store.clone(), "stale", Duration::ZERO);
        assert!(stale.try_acquire("warc-10").await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;

        let locks = Arc::new(manager("live", Arc::clone(&store)));
        let keepalive = Arc::clone(&locks)
            .spawn_keepalive(Duration::from_millis(10), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        keepalive.stop().await;

        assert!(store.get("warc-10").await.unwrap().is_none());
    }
}
