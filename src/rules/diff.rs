// src/rules/diff.rs

//! Differences between two access rule sets.
//!
//! Changes are keyed by rule id and handed out in ascending id order, so a
//! recheck run can record the last id it finished and resume after it.

use std::collections::BTreeMap;
use std::fmt;

use super::access::{AccessControl, AccessRule};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeReason {
    New,
    Changed,
    Deleted,
}

impl fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "NEW",
            Self::Changed => "CHANGED",
            Self::Deleted => "DELETED",
        };
        f.write_str(name)
    }
}

/// One rule needing action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleChange {
    /// The rule as it was; the added rule for `New`
    pub rule: AccessRule,
    /// Replacement, only for `Changed`
    pub new_rule: Option<AccessRule>,
    pub reason: ChangeReason,
}

impl RuleChange {
    pub fn id(&self) -> u64 {
        self.rule.id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RulesDiff {
    changes: BTreeMap<u64, RuleChange>,
}

impl RulesDiff {
    /// Compare `current` against `fresh`. Rules are matched by id.
    pub fn between(current: &AccessControl, fresh: &AccessControl) -> Self {
        let mut diff = Self::default();
        for rule in current.rules() {
            match fresh.rule(rule.id) {
                Some(new_rule) if new_rule != rule => diff.add_changed(rule.clone(), new_rule.clone()),
                Some(_) => {}
                None => diff.add_deleted(rule.clone()),
            }
        }
        for rule in fresh.rules() {
            if current.rule(rule.id).is_none() {
                diff.add_new(rule.clone());
            }
        }

        log::info!(
            "Compared {} current rules to {} fresh rules: {} new, {} changed, {} deleted",
            current.len(),
            fresh.len(),
            diff.count(ChangeReason::New),
            diff.count(ChangeReason::Changed),
            diff.count(ChangeReason::Deleted)
        );
        diff
    }

    pub fn add_new(&mut self, rule: AccessRule) {
        self.insert(rule, None, ChangeReason::New);
    }

    pub fn add_changed(&mut self, rule: AccessRule, new_rule: AccessRule) {
        self.insert(rule, Some(new_rule), ChangeReason::Changed);
    }

    pub fn add_deleted(&mut self, rule: AccessRule) {
        self.insert(rule, None, ChangeReason::Deleted);
    }

    fn insert(&mut self, rule: AccessRule, new_rule: Option<AccessRule>, reason: ChangeReason) {
        self.changes.insert(
            rule.id,
            RuleChange {
                rule,
                new_rule,
                reason,
            },
        );
    }

    /// Drop every change with an id at or below `last_id`.
    pub fn filter_rules(&mut self, last_id: u64) {
        self.changes = self.changes.split_off(&last_id.saturating_add(1));
        if last_id == u64::MAX {
            self.changes.clear();
        }
    }

    /// Take the change with the lowest id.
    pub fn next_rule(&mut self) -> Option<RuleChange> {
        self.changes.pop_first().map(|(_, change)| change)
    }

    pub fn has_work_left(&self) -> bool {
        !self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    fn count(&self, reason: ChangeReason) -> usize {
        self.changes.values().filter(|c| c.reason == reason).count()
    }
}
