//! Storage abstractions for the indexer's external collaborators.
//!
//! The pipeline only talks to the outside world through these traits:
//! - `RecordSource`: fetch a record's documents, list record ids
//! - `CursorStore`: persist the last processed record id per strategy
//! - `SearchSink`: commit finished search documents
//! - `SearchIndex`: look committed documents up again by SURT or rule
//! - `RuleStore` / `RuleFeed`: the access rules the index reflects, and
//!   where fresh ones come from
//!
//! ## Directory Structure (`LocalStorage`)
//!
//! ```text
//! storage/
//! ├── config.toml
//! ├── locks.json            # lock table
//! ├── records/
//! │   └── 123.json          # one record per file
//! ├── cursors/
//! │   └── full_reindex.json
//! ├── index/
//! │   └── 123/
//! │       └── 0.json        # committed search documents
//! └── rules/
//!     ├── current.json      # access rules applied to the index
//!     └── run.json          # progress of an unfinished recheck
//! ```

pub mod local;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{Record, SearchDocument};
use crate::rules::AccessControl;

// Re-export for convenience
pub use local::{LocalStorage, RuleFile};
pub use memory::{MemoryCursorStore, MemoryRecordSource, MemoryRuleFeed, MemoryRuleStore, MemorySink};

/// Source of records to index.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Fetch a record with all of its documents; `None` if the id is unknown.
    async fn fetch_batch(&self, record_id: u64) -> Result<Option<Record>>;

    /// Fetch a record for a request that targets one document offset.
    ///
    /// Sources that cannot narrow the fetch return the whole record.
    async fn fetch_batch_at(&self, record_id: u64, _offset: u64) -> Result<Option<Record>> {
        self.fetch_batch(record_id).await
    }

    /// Known record ids `>= from`, ascending, at most `limit` of them.
    async fn list_ids(&self, from: u64, limit: usize) -> Result<Vec<u64>>;
}

/// Persisted position of a strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    pub name: String,
    pub last_id: u64,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load_cursor(&self, name: &str) -> Result<Option<u64>>;

    async fn save_cursor(&self, name: &str, last_id: u64) -> Result<()>;
}

/// Destination for committed search documents.
#[async_trait]
pub trait SearchSink: Send + Sync {
    async fn commit(&self, document: &SearchDocument) -> Result<()>;
}

/// A sink whose committed documents can be found again.
///
/// Lookups return the latest committed version of each document.
#[async_trait]
pub trait SearchIndex: SearchSink {
    /// Documents whose SURT starts with `surt`, or equals it when `exact`.
    async fn find_by_surt(&self, surt: &str, exact: bool) -> Result<Vec<SearchDocument>>;

    /// Documents committed under access rule `rule_id`.
    async fn find_by_rule(&self, rule_id: u64) -> Result<Vec<SearchDocument>>;
}

/// Progress of a rule recheck, persisted so a restart resumes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleRun {
    /// Start of the run; date rules are evaluated against this instant
    pub started: DateTime<Utc>,
    /// Date-based rules of the current set have all been rechecked
    #[serde(default)]
    pub dates_completed: bool,
    /// Highest rule id finished in the current phase
    #[serde(default)]
    pub last_rule_id: Option<u64>,
}

impl RuleRun {
    pub fn new(started: DateTime<Utc>) -> Self {
        Self {
            started,
            dates_completed: false,
            last_rule_id: None,
        }
    }
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Rules the committed documents were last checked against; empty if none.
    async fn load_rules(&self) -> Result<AccessControl>;

    async fn save_rules(&self, rules: &AccessControl) -> Result<()>;

    async fn load_run(&self) -> Result<Option<RuleRun>>;

    async fn save_run(&self, run: &RuleRun) -> Result<()>;

    async fn clear_run(&self) -> Result<()>;
}

/// Where the latest access rules are published.
#[async_trait]
pub trait RuleFeed: Send + Sync {
    async fn fetch_rules(&self) -> Result<AccessControl>;
}
