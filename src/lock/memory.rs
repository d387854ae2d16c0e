// src/lock/memory.rs

//! In-process lock table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::Result;
use crate::lock::{Lock, LockStore};

/// Lock table held in a `DashMap`; the entry API gives per-key compare-and-insert.
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    locks: DashMap<String, Lock>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_insert(&self, lock: Lock, now: DateTime<Utc>) -> Result<bool> {
        match self.locks.entry(lock.key.clone()) {
            Entry::Occupied(mut existing) => {
                if existing.get().is_live(now) {
                    return Ok(false);
                }
                existing.insert(lock);
                Ok(true)
            }
            Entry::Vacant(slot) => {
                slot.insert(lock);
                Ok(true)
            }
        }
    }

    async fn remove(&self, key: &str, holder: &str) -> Result<bool> {
        Ok(self
            .locks
            .remove_if(key, |_, lock| lock.holder == holder)
            .is_some())
    }

    async fn remove_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        self.locks.retain(|_, lock| {
            let live = lock.is_live(now);
            if !live {
                removed += 1;
            }
            live
        });
        Ok(removed)
    }

    async fn refresh(
        &self,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<usize> {
        let mut refreshed = 0;
        for mut lock in self.locks.iter_mut() {
            if lock.holder == holder {
                lock.checked_in = now;
                lock.expires_at = expires_at;
                refreshed += 1;
            }
        }
        Ok(refreshed)
    }

    async fn get(&self, key: &str) -> Result<Option<Lock>> {
        Ok(self.locks.get(key).map(|lock| lock.clone()))
    }

    async fn list(&self) -> Result<Vec<Lock>> {
        let mut locks: Vec<Lock> = self.locks.iter().map(|lock| lock.clone()).collect();
        locks.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(locks)
    }
}
