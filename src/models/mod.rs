// src/models/mod.rs

//! Domain models for the indexer.

mod config;
mod record;
mod search;

// Re-export all public types
pub use config::{
    Config, FullReindexConfig, LockConfig, OnDemandConfig, PeriodicConfig, PipelineConfig,
    RuleRecheckConfig, RulesConfig,
};
pub use record::{Document, Record};
pub use search::{NOT_FOUND_MARKER, OFFLINE_MARKER, SearchDocument, escape_xml};
