// src/rules/access.rs

//! Time-bounded access rules.
//!
//! A rule restricts a SURT (exact or prefix) and may carry date conditions:
//! - `embargo_secs`: only captures newer than `now - embargo` are restricted
//! - `captured`: inclusive window on the capture date
//! - `accessed`: inclusive window on the time of evaluation
//! - `period_secs`: restricted only until `capture + period`
//!
//! All present conditions must hold for the rule to match.

use std::path::Path;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Search-engine visibility of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    #[default]
    Accepted,
    RestrictedForDelivery,
    RestrictedForDiscovery,
    RestrictedForBoth,
    /// No rule was consulted (document not indexed)
    NotApplicable,
}

impl DocumentStatus {
    pub fn deliverable(self) -> bool {
        !matches!(self, Self::RestrictedForDelivery | Self::RestrictedForBoth)
    }

    pub fn discoverable(self) -> bool {
        !matches!(self, Self::RestrictedForDiscovery | Self::RestrictedForBoth)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::RestrictedForDelivery => "restricted_for_delivery",
            Self::RestrictedForDiscovery => "restricted_for_discovery",
            Self::RestrictedForBoth => "restricted_for_both",
            Self::NotApplicable => "not_applicable",
        }
    }
}

/// Inclusive date range with optional ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn contains(&self, date: DateTime<Utc>) -> bool {
        self.start.is_none_or(|start| date >= start) && self.end.is_none_or(|end| date <= end)
    }

    pub fn has_data(&self) -> bool {
        self.start.is_some() || self.end.is_some()
    }

    pub fn is_valid(&self) -> bool {
        match (self.start, self.end) {
            (Some(start), Some(end)) => end >= start,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRule {
    pub id: u64,

    pub surt: String,

    /// Match the SURT exactly instead of as a prefix
    #[serde(default)]
    pub exact: bool,

    pub policy: DocumentStatus,

    #[serde(default)]
    pub embargo_secs: Option<u64>,

    #[serde(default)]
    pub captured: Option<DateRange>,

    #[serde(default)]
    pub accessed: Option<DateRange>,

    #[serde(default)]
    pub period_secs: Option<u64>,

    #[serde(default = "enabled")]
    pub enabled: bool,
}

fn enabled() -> bool {
    true
}

fn seconds(secs: u64) -> Option<TimeDelta> {
    i64::try_from(secs).ok().and_then(TimeDelta::try_seconds)
}

impl AccessRule {
    pub fn new(id: u64, surt: impl Into<String>, policy: DocumentStatus) -> Self {
        Self {
            id,
            surt: surt.into(),
            exact: false,
            policy,
            embargo_secs: None,
            captured: None,
            accessed: None,
            period_secs: None,
            enabled: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id == 0 {
            return Err(AppError::validation("access rule id must be > 0"));
        }
        if self.surt.is_empty() && self.exact {
            return Err(AppError::validation(format!(
                "access rule {} has an empty exact SURT",
                self.id
            )));
        }
        for (name, range) in [("captured", &self.captured), ("accessed", &self.accessed)] {
            if range.as_ref().is_some_and(|r| !r.is_valid()) {
                return Err(AppError::validation(format!(
                    "access rule {}: {} range ends before it starts",
                    self.id, name
                )));
            }
        }
        Ok(())
    }

    pub fn matches_surt(&self, surt: &str) -> bool {
        if self.exact {
            surt == self.surt
        } else {
            surt.starts_with(&self.surt)
        }
    }

    pub fn matches_dates(&self, captured: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if let Some(embargo) = self.embargo_secs {
            // An embargo too large to represent covers every capture
            if let Some(cutoff) = seconds(embargo).and_then(|d| now.checked_sub_signed(d)) {
                if captured <= cutoff {
                    return false;
                }
            }
        }
        if let Some(range) = &self.captured {
            if !range.contains(captured) {
                return false;
            }
        }
        if let Some(range) = &self.accessed {
            if !range.contains(now) {
                return false;
            }
        }
        if let Some(period) = self.period_secs {
            if let Some(until) = seconds(period).and_then(|d| captured.checked_add_signed(d)) {
                if now >= until {
                    return false;
                }
            }
        }
        true
    }

    /// True when the rule's outcome can change with the passing of time.
    pub fn has_date_component(&self) -> bool {
        self.embargo_secs.is_some()
            || self.period_secs.is_some()
            || self.captured.as_ref().is_some_and(DateRange::has_data)
            || self.accessed.as_ref().is_some_and(DateRange::has_data)
    }

    fn specificity(&self) -> (usize, bool) {
        (self.surt.len(), self.exact)
    }
}

/// Outcome of an access check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessDecision {
    /// None when no rule matched
    pub rule_id: Option<u64>,
    pub status: DocumentStatus,
}

impl Default for AccessDecision {
    fn default() -> Self {
        Self {
            rule_id: None,
            status: DocumentStatus::Accepted,
        }
    }
}

/// Access rule set, ordered from least to most specific.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessControl {
    rules: Vec<AccessRule>,
}

impl AccessControl {
    pub fn new(mut rules: Vec<AccessRule>) -> Result<Self> {
        for rule in &rules {
            rule.validate()?;
        }
        // Stable sort keeps file order among equally specific rules
        rules.sort_by_key(AccessRule::specificity);
        Ok(Self { rules })
    }

    /// Parse a JSON array of rules.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let rules: Vec<AccessRule> = serde_json::from_slice(bytes)?;
        Self::new(rules)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let control = Self::from_json(&bytes)?;
        log::info!(
            "Loaded {} access rules from {}",
            control.len(),
            path.as_ref().display()
        );
        Ok(control)
    }

    /// Find the most specific enabled rule matching both SURT and dates.
    pub fn check(&self, surt: &str, captured: DateTime<Utc>, now: DateTime<Utc>) -> AccessDecision {
        self.rules
            .iter()
            .filter(|r| r.enabled && r.matches_surt(surt) && r.matches_dates(captured, now))
            .last()
            .map(|r| AccessDecision {
                rule_id: Some(r.id),
                status: r.policy,
            })
            .unwrap_or_default()
    }

    pub fn rules(&self) -> &[AccessRule] {
        &self.rules
    }

    pub fn rule(&self, id: u64) -> Option<&AccessRule> {
        self.rules.iter().find(|r| r.id == id)
    }

    /// Enabled rules whose outcome depends on the current date, by id.
    pub fn date_based_rules(&self) -> Vec<&AccessRule> {
        let mut rules: Vec<_> = self
            .rules
            .iter()
            .filter(|r| r.enabled && r.has_date_component())
            .collect();
        rules.sort_by_key(|r| r.id);
        rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
