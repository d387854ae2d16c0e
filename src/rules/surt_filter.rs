// src/rules/surt_filter.rs

//! Sequential-override SURT prefix filter.
//!
//! Rule text is one policy per line:
//!
//! ```text
//! -                  deny everything
//! +(au,gov,          allow government sites
//! -(au,gov,act,      but not the ACT
//! ```
//!
//! Every rule whose prefix matches the key overwrites the decision, so the
//! last matching line wins. Blank lines are ignored.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{AppError, Result};

/// Whether a matching prefix allows or denies the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Policy {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilterRule {
    pub policy: Policy,
    pub prefix: String,
}

/// Ordered list of prefix rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SurtFilter {
    rules: Vec<FilterRule>,
}

impl SurtFilter {
    /// Parse rule text, failing on the first line without a `+` or `-`.
    pub fn parse(text: &str) -> Result<Self> {
        let mut rules = Vec::new();
        for (number, raw) in text.split('\n').enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            let policy = match line.as_bytes()[0] {
                b'+' => Policy::Allow,
                b'-' => Policy::Deny,
                _ => {
                    return Err(AppError::config(format!(
                        "line {}: filter policies must begin with + or -: {:?}",
                        number + 1,
                        line
                    )));
                }
            };
            rules.push(FilterRule {
                policy,
                prefix: line[1..].to_string(),
            });
        }
        Ok(Self { rules })
    }

    /// Load rules from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let filter = Self::parse(&text)?;
        log::info!(
            "Loaded {} SURT filter rules from {}",
            filter.len(),
            path.as_ref().display()
        );
        Ok(filter)
    }

    pub fn accepts(&self, surt: &str) -> bool {
        self.rules
            .iter()
            .filter(|rule| surt.starts_with(&rule.prefix))
            .fold(true, |_, rule| rule.policy == Policy::Allow)
    }

    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl FromStr for SurtFilter {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for SurtFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for rule in &self.rules {
            let sign = match rule.policy {
                Policy::Allow => '+',
                Policy::Deny => '-',
            };
            writeln!(f, "{}{}", sign, rule.prefix)?;
        }
        Ok(())
    }
}
