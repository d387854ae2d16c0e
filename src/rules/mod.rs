//! Inclusion rules applied during filtering.
//!
//! - `SurtFilter`: `+`/`-` prefix policy, last matching line wins
//! - `AccessControl`: embargo and date-window rules deciding visibility
//! - `RulesDiff`: new, changed and deleted rules between two rule sets

pub mod access;
pub mod diff;
pub mod surt_filter;

pub use access::{AccessControl, AccessDecision, AccessRule, DateRange, DocumentStatus};
pub use diff::{ChangeReason, RuleChange, RulesDiff};
pub use surt_filter::{FilterRule, Policy, SurtFilter};
