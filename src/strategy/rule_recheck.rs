// src/strategy/rule_recheck.rs

//! Keeps committed documents in line with the access rules.
//!
//! A run has two phases. First every date-based rule of the current set is
//! re-applied, since embargoes and access windows change their outcome as
//! time passes. Then the current set is compared with the published one
//! and each new, changed or deleted rule is applied to the documents it
//! can affect. Progress is saved after each rule, so an interrupted run
//! resumes after the last rule it finished. The published set becomes the
//! current one once the run completes.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveTime, TimeDelta, Utc};
use futures::stream::{self, StreamExt};
use tokio::task::JoinHandle;

use crate::error::{AppError, Result};
use crate::models::{RuleRecheckConfig, SearchDocument};
use crate::rules::{AccessControl, ChangeReason, DocumentStatus, RuleChange, RulesDiff};
use crate::storage::{RuleFeed, RuleRun, RuleStore, SearchIndex, SearchSink};
use crate::utils::to_surt;

use super::{DomainState, IndexingDomain};

pub const NAME: &str = "Access Rule Change Updates";

const STOP_POLL: Duration = Duration::from_millis(100);

/// Time left until the next `at`, never zero.
fn until_next(at: NaiveTime, now: NaiveTime) -> Duration {
    let mut wait = at - now;
    if wait <= TimeDelta::zero() {
        wait += TimeDelta::days(1);
    }
    wait.to_std().unwrap_or(Duration::ZERO)
}

pub struct RuleRecheck {
    config: RuleRecheckConfig,
    schedule: NaiveTime,
    indexing_disabled: bool,
    index: Arc<dyn SearchIndex>,
    store: Arc<dyn RuleStore>,
    feed: Arc<dyn RuleFeed>,
    state: DomainState,
    progress: Mutex<Option<String>>,
    last_completed: Mutex<Option<DateTime<Utc>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RuleRecheck {
    pub fn new(
        config: RuleRecheckConfig,
        indexing_disabled: bool,
        index: Arc<dyn SearchIndex>,
        store: Arc<dyn RuleStore>,
        feed: Arc<dyn RuleFeed>,
    ) -> Result<Self> {
        let schedule = NaiveTime::from_hms_opt(config.schedule_hour, config.schedule_minute, 0)
            .ok_or_else(|| {
                AppError::validation(format!(
                    "rule recheck schedule {}:{:02} is not a time of day",
                    config.schedule_hour, config.schedule_minute
                ))
            })?;
        if config.workers == 0 {
            return Err(AppError::validation("rule recheck needs at least one worker"));
        }
        Ok(Self {
            config,
            schedule,
            indexing_disabled,
            index,
            store,
            feed,
            state: DomainState::default(),
            progress: Mutex::new(None),
            last_completed: Mutex::new(None),
            task: Mutex::new(None),
        })
    }

    fn set_progress(&self, progress: Option<String>) {
        *lock(&self.progress) = progress;
    }

    /// Run one recheck, resuming an unfinished one if there is one.
    ///
    /// Returns false when a stop request cut the run short.
    pub async fn run_once(&self) -> Result<bool> {
        let mut run = match self.store.load_run().await? {
            Some(run) => {
                log::info!(
                    "{}: resuming run from {} after rule {:?}",
                    NAME,
                    run.started,
                    run.last_rule_id
                );
                run
            }
            None => {
                let run = RuleRun::new(Utc::now());
                self.store.save_run(&run).await?;
                run
            }
        };
        let now = run.started;
        let current = self.store.load_rules().await?;

        if !run.dates_completed {
            for rule in current.date_based_rules() {
                if run.last_rule_id.is_some_and(|last| rule.id <= last) {
                    continue;
                }
                if self.state.is_stopping() {
                    return Ok(false);
                }
                self.set_progress(Some(format!("date rule {}", rule.id)));

                let mut candidates = self.index.find_by_rule(rule.id).await?;
                candidates.extend(self.index.find_by_surt(&rule.surt, rule.exact).await?);
                self.recheck(candidates, &current, now).await?;

                run.last_rule_id = Some(rule.id);
                self.store.save_run(&run).await?;
            }
            run.dates_completed = true;
            run.last_rule_id = None;
            self.store.save_run(&run).await?;
        }

        let fresh = self.feed.fetch_rules().await?;
        let mut diff = RulesDiff::between(&current, &fresh);
        if let Some(last) = run.last_rule_id {
            diff.filter_rules(last);
        }
        while let Some(change) = diff.next_rule() {
            if self.state.is_stopping() {
                return Ok(false);
            }
            self.set_progress(Some(format!("{} rule {}", change.reason, change.id())));

            let candidates = self.affected_by(&change, now).await?;
            self.recheck(candidates, &fresh, now).await?;

            run.last_rule_id = Some(change.id());
            self.store.save_run(&run).await?;
        }

        self.store.save_rules(&fresh).await?;
        self.store.clear_run().await?;
        self.set_progress(None);
        *lock(&self.last_completed) = Some(Utc::now());
        log::info!("{}: run from {} complete, {} rules now current", NAME, now, fresh.len());
        Ok(true)
    }

    /// Committed documents whose decision `change` may alter.
    async fn affected_by(&self, change: &RuleChange, now: DateTime<Utc>) -> Result<Vec<SearchDocument>> {
        let rule = &change.rule;
        match change.reason {
            ChangeReason::New => {
                // Not in force today, so no decision can change yet
                if rule.accessed.as_ref().is_some_and(|range| !range.contains(now)) {
                    log::debug!("{}: rule {} not in force, skipped", NAME, rule.id);
                    return Ok(Vec::new());
                }
                self.index.find_by_surt(&rule.surt, rule.exact).await
            }
            ChangeReason::Deleted => self.index.find_by_rule(rule.id).await,
            ChangeReason::Changed => {
                let mut documents = self.index.find_by_rule(rule.id).await?;
                if let Some(new_rule) = &change.new_rule {
                    documents.extend(self.index.find_by_surt(&new_rule.surt, new_rule.exact).await?);
                }
                Ok(documents)
            }
        }
    }

    /// Re-apply `rules` to each candidate, committing the ones whose
    /// decision changed. Returns how many were rewritten.
    async fn recheck(
        &self,
        mut candidates: Vec<SearchDocument>,
        rules: &AccessControl,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut seen = HashSet::new();
        candidates.retain(|d| d.status != DocumentStatus::NotApplicable && seen.insert(d.id.clone()));

        let total = candidates.len();
        let mut rewritten = 0;
        let mut failures = 0;
        let mut results = stream::iter(candidates)
            .map(|document| async move {
                let id = document.id.clone();
                (id, self.recheck_one(document, rules, now).await)
            })
            .buffer_unordered(self.config.workers);

        while let Some((id, result)) = results.next().await {
            match result {
                Ok(true) => rewritten += 1,
                Ok(false) => {}
                Err(e) => {
                    failures += 1;
                    log::warn!("{}: recheck of {} failed: {}", NAME, id, e);
                }
            }
        }

        log::debug!("{}: {} of {} documents rewritten", NAME, rewritten, total);
        if failures > 0 {
            // Leave the rule unfinished so the next run repeats it
            return Err(AppError::sink(format!(
                "{} of {} documents could not be rechecked",
                failures, total
            )));
        }
        Ok(rewritten)
    }

    async fn recheck_one(
        &self,
        mut document: SearchDocument,
        rules: &AccessControl,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if document.surt.is_empty() {
            document.surt = to_surt(&document.url)?;
        }
        let decision = rules.check(&document.surt, document.date, now);
        if decision.rule_id == document.rule_id && decision.status == document.status {
            return Ok(false);
        }

        log::debug!(
            "{}: rule {:?} -> {:?}, {} -> {}",
            document.id,
            document.rule_id,
            decision.rule_id,
            document.status.as_str(),
            decision.status.as_str()
        );
        document.rule_id = decision.rule_id;
        document.status = decision.status;
        self.index.commit(&document).await?;
        self.state.record(document.record_id);
        Ok(true)
    }

    async fn schedule_loop(&self) {
        // An interrupted run is picked up straight away
        let mut due = matches!(self.store.load_run().await, Ok(Some(_)));
        loop {
            if !due {
                let wait = until_next(self.schedule, Local::now().time());
                log::info!("{}: next run in {}s", NAME, wait.as_secs());
                if !self.state.sleep(wait).await {
                    return;
                }
            }
            due = false;

            match self.run_once().await {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => log::error!("{}: run failed: {}", NAME, e),
            }
        }
    }
}

#[async_trait]
impl IndexingDomain for RuleRecheck {
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
        if !self.state.begin() {
            return Ok(());
        }
        log::info!("{} started", NAME);

        let this = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            this.schedule_loop().await;
            this.set_progress(None);
            this.state.finish();
            log::info!("{} stopped", NAME);
        });
        *lock(&self.task) = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.state.is_running() {
            return Ok(());
        }
        self.state.request_stop();

        let handle = lock(&self.task).take();
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    log::error!("{} task panicked: {}", NAME, e);
                    self.state.finish();
                }
            }
            None => self.state.wait_finished(STOP_POLL).await,
        }
        Ok(())
    }

    /// Documents rewritten since start.
    fn update_count(&self) -> u64 {
        self.state.update_count()
    }

    fn last_id_processed(&self) -> String {
        if let Some(progress) = lock(&self.progress).clone() {
            return progress;
        }
        match *lock(&self.last_completed) {
            Some(at) => format!("Rules last processed : {}", at.to_rfc3339()),
            None => "none".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{AccessRule, DateRange};
    use crate::storage::{MemoryRuleFeed, MemoryRuleStore, MemorySink};

    struct Fixture {
        domain: Arc<RuleRecheck>,
        sink: Arc<MemorySink>,
        store: Arc<MemoryRuleStore>,
    }

    fn control(rules: Vec<AccessRule>) -> AccessControl {
        AccessControl::new(rules).unwrap()
    }

    async fn fixture(current: AccessControl, fresh: AccessControl) -> Fixture {
        let sink = Arc::new(MemorySink::new());
        let store = Arc::new(MemoryRuleStore::new());
        store.save_rules(&current).await.unwrap();
        let feed = Arc::new(MemoryRuleFeed::new(fresh));
        let config = RuleRecheckConfig {
            workers: 2,
            ..RuleRecheckConfig::default()
        };
        let domain = RuleRecheck::new(config, false, sink.clone(), store.clone(), feed).unwrap();
        Fixture {
            domain: Arc::new(domain),
            sink,
            store,
        }
    }

    /// Commit a document as the pipeline would have under `rules`.
    async fn commit(sink: &MemorySink, record_id: u64, url: &str, rules: &AccessControl) -> SearchDocument {
        let date = "2015-06-01T00:00:00Z".parse().unwrap();
        let mut document = SearchDocument::new(record_id, 0, url, date);
        document.surt = to_surt(url).unwrap();
        let decision = rules.check(&document.surt, date, Utc::now());
        document.rule_id = decision.rule_id;
        document.status = decision.status;
        sink.commit(&document).await.unwrap();
        document
    }

    fn latest(sink: &MemorySink, id: &str) -> SearchDocument {
        sink.latest().into_iter().find(|d| d.id == id).unwrap()
    }

    #[tokio::test]
    async fn test_new_rule_restricts_matching_documents() {
        let fresh = control(vec![AccessRule::new(1, "(au,gov,", DocumentStatus::RestrictedForBoth)]);
        let f = fixture(AccessControl::default(), fresh.clone()).await;
        let none = AccessControl::default();
        commit(&f.sink, 1, "http://www.nla.gov.au/a", &none).await;
        commit(&f.sink, 2, "http://www.aec.gov.au/b", &none).await;
        commit(&f.sink, 3, "http://example.com/", &none).await;

        assert!(f.domain.run_once().await.unwrap());

        for id in ["1/0", "2/0"] {
            let document = latest(&f.sink, id);
            assert_eq!(document.rule_id, Some(1));
            assert_eq!(document.status, DocumentStatus::RestrictedForBoth);
        }
        assert_eq!(latest(&f.sink, "3/0").rule_id, None);
        assert_eq!(f.sink.len(), 5);
        assert_eq!(f.domain.update_count(), 2);

        assert_eq!(f.store.load_rules().await.unwrap(), fresh);
        assert!(f.store.load_run().await.unwrap().is_none());
        assert!(f.domain.last_id_processed().starts_with("Rules last processed : "));
    }

    #[tokio::test]
    async fn test_deleted_rule_releases_documents() {
        let current = control(vec![AccessRule::new(4, "(au,gov,", DocumentStatus::RestrictedForDelivery)]);
        let f = fixture(current.clone(), AccessControl::default()).await;
        let before = commit(&f.sink, 1, "http://www.nla.gov.au/", &current).await;
        assert_eq!(before.rule_id, Some(4));

        assert!(f.domain.run_once().await.unwrap());

        let after = latest(&f.sink, "1/0");
        assert_eq!(after.rule_id, None);
        assert_eq!(after.status, DocumentStatus::Accepted);
        assert!(f.store.load_rules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_changed_rule_moves_documents() {
        let current = control(vec![AccessRule::new(1, "(au,gov,nla,", DocumentStatus::RestrictedForBoth)]);
        let fresh = control(vec![AccessRule::new(1, "(au,gov,", DocumentStatus::RestrictedForDelivery)]);
        let f = fixture(current.clone(), fresh).await;
        commit(&f.sink, 1, "http://www.nla.gov.au/", &current).await;
        commit(&f.sink, 2, "http://www.aec.gov.au/", &current).await;

        assert!(f.domain.run_once().await.unwrap());

        for id in ["1/0", "2/0"] {
            let document = latest(&f.sink, id);
            assert_eq!(document.rule_id, Some(1), "{}", id);
            assert_eq!(document.status, DocumentStatus::RestrictedForDelivery, "{}", id);
        }
    }

    #[tokio::test]
    async fn test_expired_embargo_releases_documents() {
        let mut embargo = AccessRule::new(2, "(au,", DocumentStatus::RestrictedForBoth);
        embargo.embargo_secs = Some(86_400);
        let rules = control(vec![embargo]);
        let f = fixture(rules.clone(), rules).await;

        // Committed while the capture was still under embargo
        let mut document = commit(&f.sink, 1, "http://www.nla.gov.au/", &AccessControl::default()).await;
        document.rule_id = Some(2);
        document.status = DocumentStatus::RestrictedForBoth;
        f.sink.commit(&document).await.unwrap();

        assert!(f.domain.run_once().await.unwrap());

        let after = latest(&f.sink, "1/0");
        assert_eq!(after.rule_id, None);
        assert_eq!(after.status, DocumentStatus::Accepted);
    }

    #[tokio::test]
    async fn test_new_rule_outside_access_window_is_skipped() {
        let mut later = AccessRule::new(3, "(au,", DocumentStatus::RestrictedForBoth);
        later.accessed = Some(DateRange {
            start: Some(Utc::now() + TimeDelta::days(30)),
            end: None,
        });
        let f = fixture(AccessControl::default(), control(vec![later])).await;
        commit(&f.sink, 1, "http://www.nla.gov.au/", &AccessControl::default()).await;

        assert!(f.domain.run_once().await.unwrap());
        assert_eq!(f.sink.len(), 1);
        assert_eq!(f.store.load_rules().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resumes_after_last_finished_rule() {
        let fresh = control(vec![
            AccessRule::new(1, "(au,gov,", DocumentStatus::RestrictedForBoth),
            AccessRule::new(2, "(com,", DocumentStatus::RestrictedForDiscovery),
        ]);
        let f = fixture(AccessControl::default(), fresh).await;
        let started: DateTime<Utc> = "2020-01-01T00:00:00Z".parse().unwrap();
        f.store
            .save_run(&RuleRun {
                started,
                dates_completed: true,
                last_rule_id: Some(1),
            })
            .await
            .unwrap();
        commit(&f.sink, 1, "http://www.nla.gov.au/", &AccessControl::default()).await;
        commit(&f.sink, 2, "http://example.com/", &AccessControl::default()).await;

        assert!(f.domain.run_once().await.unwrap());

        // Rule 1 was finished before the interruption
        assert_eq!(latest(&f.sink, "1/0").rule_id, None);
        let com = latest(&f.sink, "2/0");
        assert_eq!(com.rule_id, Some(2));
        assert_eq!(com.status, DocumentStatus::RestrictedForDiscovery);
        assert!(f.store.load_run().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unchanged_documents_are_not_recommitted() {
        let mut windowed = AccessRule::new(5, "(au,", DocumentStatus::RestrictedForDelivery);
        windowed.captured = Some(DateRange {
            start: Some("2010-01-01T00:00:00Z".parse().unwrap()),
            end: Some("2020-01-01T00:00:00Z".parse().unwrap()),
        });
        let rules = control(vec![windowed]);
        let f = fixture(rules.clone(), rules.clone()).await;
        commit(&f.sink, 1, "http://www.nla.gov.au/", &rules).await;
        commit(&f.sink, 2, "http://example.com/", &rules).await;

        assert!(f.domain.run_once().await.unwrap());
        assert_eq!(f.sink.len(), 2);
        assert_eq!(f.domain.update_count(), 0);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let f = fixture(AccessControl::default(), AccessControl::default()).await;
        Arc::clone(&f.domain).start().await.unwrap();
        assert!(f.domain.is_running());
        assert_eq!(f.domain.last_id_processed(), "none");

        tokio::time::timeout(Duration::from_secs(5), f.domain.stop())
            .await
            .unwrap()
            .unwrap();
        assert!(!f.domain.is_running());
        // Nothing ran: the schedule is hours away and no run was pending
        assert!(f.store.load_run().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_start_resumes_unfinished_run() {
        let fresh = control(vec![AccessRule::new(1, "(au,", DocumentStatus::RestrictedForBoth)]);
        let f = fixture(AccessControl::default(), fresh).await;
        f.store.save_run(&RuleRun::new(Utc::now())).await.unwrap();
        commit(&f.sink, 1, "http://www.nla.gov.au/", &AccessControl::default()).await;

        Arc::clone(&f.domain).start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while f.store.load_run().await.unwrap().is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        f.domain.stop().await.unwrap();

        assert_eq!(latest(&f.sink, "1/0").rule_id, Some(1));
        assert_eq!(f.domain.update_count(), 1);
    }

    #[tokio::test]
    async fn test_disabled_refuses_to_start() {
        let domain = RuleRecheck::new(
            RuleRecheckConfig::default(),
            true,
            Arc::new(MemorySink::new()),
            Arc::new(MemoryRuleStore::new()),
            Arc::new(MemoryRuleFeed::default()),
        )
        .unwrap();
        let result = Arc::new(domain).start().await;
        assert!(matches!(result, Err(AppError::IndexingDisabled { .. })));
    }

    #[test]
    fn test_bad_schedule_is_rejected() {
        let config = RuleRecheckConfig {
            schedule_hour: 24,
            ..RuleRecheckConfig::default()
        };
        let result = RuleRecheck::new(
            config,
            false,
            Arc::new(MemorySink::new()),
            Arc::new(MemoryRuleStore::new()),
            Arc::new(MemoryRuleFeed::default()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_until_next() {
        let at = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
        assert_eq!(until_next(at(2, 0), at(1, 30)), Duration::from_secs(30 * 60));
        assert_eq!(until_next(at(2, 0), at(2, 0)), Duration::from_secs(24 * 3600));
        assert_eq!(until_next(at(2, 0), at(23, 0)), Duration::from_secs(3 * 3600));
    }
}
