// src/storage/memory.rs

//! In-memory backends for embedding and tests.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{AppError, Result};
use crate::models::{Record, SearchDocument};
use crate::rules::AccessControl;
use crate::storage::{
    CursorStore, RecordSource, RuleFeed, RuleRun, RuleStore, SearchIndex, SearchSink,
};

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Records kept in an ordered map. Every fetch is logged in call order.
#[derive(Debug, Default)]
pub struct MemoryRecordSource {
    records: Mutex<BTreeMap<u64, Record>>,
    fetched: Mutex<Vec<u64>>,
    failing: Mutex<Vec<u64>>,
}

impl MemoryRecordSource {
    pub fn new(records: impl IntoIterator<Item = Record>) -> Self {
        let source = Self::default();
        for record in records {
            source.insert(record);
        }
        source
    }

    pub fn insert(&self, record: Record) {
        guard(&self.records).insert(record.id, record);
    }

    /// Make fetches of `record_id` fail, simulating a corrupt record.
    pub fn fail_on(&self, record_id: u64) {
        guard(&self.failing).push(record_id);
    }

    /// Record ids in the order they were fetched.
    pub fn fetched(&self) -> Vec<u64> {
        guard(&self.fetched).clone()
    }
}

#[async_trait]
impl RecordSource for MemoryRecordSource {
    async fn fetch_batch(&self, record_id: u64) -> Result<Option<Record>> {
        guard(&self.fetched).push(record_id);
        if guard(&self.failing).contains(&record_id) {
            return Err(AppError::source_failed(format!(
                "record {} is unreadable",
                record_id
            )));
        }
        Ok(guard(&self.records).get(&record_id).cloned())
    }

    async fn list_ids(&self, from: u64, limit: usize) -> Result<Vec<u64>> {
        Ok(guard(&self.records)
            .range(from..)
            .map(|(id, _)| *id)
            .take(limit)
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    cursors: DashMap<String, u64>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load_cursor(&self, name: &str) -> Result<Option<u64>> {
        Ok(self.cursors.get(name).map(|id| *id))
    }

    async fn save_cursor(&self, name: &str, last_id: u64) -> Result<()> {
        self.cursors.insert(name.to_string(), last_id);
        Ok(())
    }
}

/// Collects committed documents in commit order.
///
/// Recommits are appended too; lookups see the latest version per id.
#[derive(Debug, Default)]
pub struct MemorySink {
    documents: Mutex<Vec<SearchDocument>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn documents(&self) -> Vec<SearchDocument> {
        guard(&self.documents).clone()
    }

    /// Latest version of every committed document, ordered by id.
    pub fn latest(&self) -> Vec<SearchDocument> {
        let documents = guard(&self.documents);
        let mut latest = BTreeMap::new();
        for document in documents.iter() {
            latest.insert(document.id.as_str(), document);
        }
        latest.into_values().cloned().collect()
    }

    fn find(&self, matches: impl Fn(&SearchDocument) -> bool) -> Vec<SearchDocument> {
        self.latest().into_iter().filter(|d| matches(d)).collect()
    }

    pub fn len(&self) -> usize {
        guard(&self.documents).len()
    }

    pub fn is_empty(&self) -> bool {
        guard(&self.documents).is_empty()
    }
}

#[async_trait]
impl SearchSink for MemorySink {
    async fn commit(&self, document: &SearchDocument) -> Result<()> {
        guard(&self.documents).push(document.clone());
        Ok(())
    }
}

#[async_trait]
impl SearchIndex for MemorySink {
    async fn find_by_surt(&self, surt: &str, exact: bool) -> Result<Vec<SearchDocument>> {
        Ok(self.find(|d| if exact { d.surt == surt } else { d.surt.starts_with(surt) }))
    }

    async fn find_by_rule(&self, rule_id: u64) -> Result<Vec<SearchDocument>> {
        Ok(self.find(|d| d.rule_id == Some(rule_id)))
    }
}

#[derive(Debug, Default)]
pub struct MemoryRuleStore {
    rules: Mutex<AccessControl>,
    run: Mutex<Option<RuleRun>>,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn load_rules(&self) -> Result<AccessControl> {
        Ok(guard(&self.rules).clone())
    }

    async fn save_rules(&self, rules: &AccessControl) -> Result<()> {
        *guard(&self.rules) = rules.clone();
        Ok(())
    }

    async fn load_run(&self) -> Result<Option<RuleRun>> {
        Ok(guard(&self.run).clone())
    }

    async fn save_run(&self, run: &RuleRun) -> Result<()> {
        *guard(&self.run) = Some(run.clone());
        Ok(())
    }

    async fn clear_run(&self) -> Result<()> {
        *guard(&self.run) = None;
        Ok(())
    }
}

/// Rule feed whose contents tests replace at will.
#[derive(Debug, Default)]
pub struct MemoryRuleFeed {
    rules: Mutex<AccessControl>,
}

impl MemoryRuleFeed {
    pub fn new(rules: AccessControl) -> Self {
        Self {
            rules: Mutex::new(rules),
        }
    }

    pub fn set(&self, rules: AccessControl) {
        *guard(&self.rules) = rules;
    }
}

#[async_trait]
impl RuleFeed for MemoryRuleFeed {
    async fn fetch_rules(&self) -> Result<AccessControl> {
        Ok(guard(&self.rules).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_ids_is_ordered_and_bounded() {
        let source = MemoryRecordSource::new([5, 1, 3, 9].map(|id| Record::new(id, Vec::new())));
        assert_eq!(source.list_ids(0, 10).await.unwrap(), vec![1, 3, 5, 9]);
        assert_eq!(source.list_ids(3, 2).await.unwrap(), vec![3, 5]);
        assert!(source.list_ids(10, 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_log_and_failures() {
        let source = MemoryRecordSource::new([Record::new(1, Vec::new())]);
        source.fail_on(2);

        assert!(source.fetch_batch(1).await.unwrap().is_some());
        assert!(matches!(source.fetch_batch(2).await, Err(AppError::Source(_))));
        assert!(source.fetch_batch(3).await.unwrap().is_none());
        assert_eq!(source.fetched(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_cursor_store() {
        let cursors = MemoryCursorStore::new();
        assert_eq!(cursors.load_cursor("full").await.unwrap(), None);
        cursors.save_cursor("full", 42).await.unwrap();
        assert_eq!(cursors.load_cursor("full").await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_sink_lookups_see_latest_version() {
        let sink = MemorySink::new();
        let date = "2015-01-01T00:00:00Z".parse().unwrap();
        let mut first = SearchDocument::new(1, 0, "http://www.nla.gov.au/", date);
        first.surt = "(au,gov,nla,www,)/".into();
        let mut other = SearchDocument::new(2, 0, "http://example.com/", date);
        other.surt = "(com,example,)/".into();
        sink.commit(&first).await.unwrap();
        sink.commit(&other).await.unwrap();

        first.rule_id = Some(7);
        sink.commit(&first).await.unwrap();

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.latest().len(), 2);

        let found = sink.find_by_surt("(au,gov,", false).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].rule_id, Some(7));
        assert!(sink.find_by_surt("(au,gov,", true).await.unwrap().is_empty());
        assert_eq!(sink.find_by_surt("(com,example,)/", true).await.unwrap().len(), 1);

        assert_eq!(sink.find_by_rule(7).await.unwrap()[0].id, "1/0");
        assert!(sink.find_by_rule(8).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rule_store_and_feed() {
        use crate::rules::{AccessRule, DocumentStatus};

        let store = MemoryRuleStore::new();
        assert!(store.load_rules().await.unwrap().is_empty());
        assert!(store.load_run().await.unwrap().is_none());

        let rules =
            AccessControl::new(vec![AccessRule::new(1, "(au,", DocumentStatus::RestrictedForBoth)])
                .unwrap();
        store.save_rules(&rules).await.unwrap();
        assert_eq!(store.load_rules().await.unwrap(), rules);

        let run = RuleRun::new("2020-01-01T00:00:00Z".parse().unwrap());
        store.save_run(&run).await.unwrap();
        assert_eq!(store.load_run().await.unwrap(), Some(run));
        store.clear_run().await.unwrap();
        assert!(store.load_run().await.unwrap().is_none());

        let feed = MemoryRuleFeed::default();
        assert!(feed.fetch_rules().await.unwrap().is_empty());
        feed.set(rules.clone());
        assert_eq!(feed.fetch_rules().await.unwrap(), rules);
    }
}
