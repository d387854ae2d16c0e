// src/error.rs

//! Unified error handling for the indexer.

use std::fmt;

use thiserror::Error;

/// Result type alias for indexer operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization failed
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// Configuration error (bad config file or malformed rule line)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Text extraction failed for a single document
    #[error("Extraction error for {doc_id}: {message}")]
    Extraction { doc_id: String, message: String },

    /// Another holder owns the lock for this key
    #[error("Lock contention on '{key}'")]
    LockContention { key: String },

    /// Unexpected failure inside a pipeline stage
    #[error("Stage '{stage}' failed for {doc_id}: {message}")]
    Stage {
        doc_id: String,
        stage: String,
        message: String,
    },

    /// A strategy refused to start
    #[error("Indexing is disabled, refusing to start {domain}")]
    IndexingDisabled { domain: String },

    /// A batch finished with errors
    #[error("Indexing failed for warc#{record_id}: {message}")]
    IndexingFailed { record_id: u64, message: String },

    /// A bounded wait expired
    #[error("Timed out waiting for {context}")]
    Timeout { context: String },

    /// The record source failed
    #[error("Record source error: {0}")]
    Source(String),

    /// The search sink failed
    #[error("Search sink error: {0}")]
    Sink(String),

    /// The pipeline runtime was used before `start`
    #[error("Pipeline not started: {0}")]
    NotStarted(String),
}

impl AppError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create an extraction error for a document.
    pub fn extraction(doc_id: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Extraction {
            doc_id: doc_id.into(),
            message: message.to_string(),
        }
    }

    /// Create a lock contention error.
    pub fn lock_contention(key: impl Into<String>) -> Self {
        Self::LockContention { key: key.into() }
    }

    /// Create a stage failure with context.
    pub fn stage(
        doc_id: impl Into<String>,
        stage: impl fmt::Display,
        message: impl fmt::Display,
    ) -> Self {
        Self::Stage {
            doc_id: doc_id.into(),
            stage: stage.to_string(),
            message: message.to_string(),
        }
    }

    /// Create an indexing-disabled refusal.
    pub fn indexing_disabled(domain: impl Into<String>) -> Self {
        Self::IndexingDisabled {
            domain: domain.into(),
        }
    }

    /// Create a batch failure.
    pub fn indexing_failed(record_id: u64, message: impl fmt::Display) -> Self {
        Self::IndexingFailed {
            record_id,
            message: message.to_string(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(context: impl Into<String>) -> Self {
        Self::Timeout {
            context: context.into(),
        }
    }

    /// Create a record source error.
    pub fn source_failed(message: impl fmt::Display) -> Self {
        Self::Source(message.to_string())
    }

    /// Create a search sink error.
    pub fn sink(message: impl fmt::Display) -> Self {
        Self::Sink(message.to_string())
    }
}
