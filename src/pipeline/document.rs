// src/pipeline/document.rs

//! Per-document pipeline state.
//!
//! ```text
//! queued -> filtering -> filtered -> transforming -> transformed -> indexing -> indexed
//!               \                         \                            \
//!                +-------------------------+----------------------------+--> errored
//! ```
//!
//! The stage lives in an `AtomicU8` so the batch can read every document's
//! progress without locking. Transitions are compare-and-swap, a document
//! cannot enter a stage twice or skip one.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{AppError, Result};
use crate::models::{Document, SearchDocument};
use crate::rules::{AccessDecision, DocumentStatus};
use crate::services::ContentThreshold;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Stage {
    Queued = 0,
    Filtering = 1,
    Filtered = 2,
    Transforming = 3,
    Transformed = 4,
    Indexing = 5,
    Indexed = 6,
    Errored = 7,
}

impl Stage {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Queued,
            1 => Self::Filtering,
            2 => Self::Filtered,
            3 => Self::Transforming,
            4 => Self::Transformed,
            5 => Self::Indexing,
            6 => Self::Indexed,
            _ => Self::Errored,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Indexed | Self::Errored)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Filtering => "filtering",
            Self::Filtered => "filtered",
            Self::Transforming => "transforming",
            Self::Transformed => "transformed",
            Self::Indexing => "indexing",
            Self::Indexed => "indexed",
            Self::Errored => "errored",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three worker pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Filter,
    Transform,
    Index,
}

impl StageKind {
    pub const ALL: [StageKind; 3] = [Self::Filter, Self::Transform, Self::Index];

    /// Stage a document must be in before this pool takes it.
    pub fn pending(self) -> Stage {
        match self {
            Self::Filter => Stage::Queued,
            Self::Transform => Stage::Filtered,
            Self::Index => Stage::Transformed,
        }
    }

    pub fn running(self) -> Stage {
        match self {
            Self::Filter => Stage::Filtering,
            Self::Transform => Stage::Transforming,
            Self::Index => Stage::Indexing,
        }
    }

    pub fn done(self) -> Stage {
        match self {
            Self::Filter => Stage::Filtered,
            Self::Transform => Stage::Transformed,
            Self::Index => Stage::Indexed,
        }
    }

    /// True once a document in `stage` can no longer be waiting on this pool.
    pub fn is_past(self, stage: Stage) -> bool {
        stage == Stage::Errored || stage as u8 >= self.done() as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Filter => "filter",
            Self::Transform => "transform",
            Self::Index => "index",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct AtomicStage(AtomicU8);

impl AtomicStage {
    pub fn new(stage: Stage) -> Self {
        Self(AtomicU8::new(stage as u8))
    }

    pub fn load(&self) -> Stage {
        Stage::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`; false if the document was not in `from`.
    pub fn transition(&self, from: Stage, to: Stage) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move any non-terminal stage to `Errored`. Returns the stage it left.
    pub fn fail(&self) -> Option<Stage> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if Stage::from_u8(current).is_terminal() {
                return None;
            }
            match self.0.compare_exchange_weak(
                current,
                Stage::Errored as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(Stage::from_u8(current)),
                Err(actual) => current = actual,
            }
        }
    }
}

/// Result of the filter stage.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterOutcome {
    pub surt: Option<String>,
    pub threshold: ContentThreshold,
    pub access: AccessDecision,
    /// Record locked by another process; document skipped for a later retry
    pub deferred: bool,
}

impl FilterOutcome {
    fn skipped(surt: Option<String>, deferred: bool) -> Self {
        Self {
            surt,
            threshold: ContentThreshold::None,
            access: AccessDecision {
                rule_id: None,
                status: DocumentStatus::NotApplicable,
            },
            deferred,
        }
    }

    /// Rejected by the SURT filter.
    pub fn excluded(surt: String) -> Self {
        Self::skipped(Some(surt), false)
    }

    pub fn deferred() -> Self {
        Self::skipped(None, true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageError {
    pub stage: StageKind,
    pub message: String,
}

#[derive(Debug)]
struct DocumentState {
    filtering: Option<FilterOutcome>,
    boost: f32,
    converted: Option<SearchDocument>,
    held: Option<SearchDocument>,
    errors: Vec<StageError>,
}

/// One source document moving through the pipeline.
#[derive(Debug)]
pub struct IndexerDocument {
    doc_id: String,
    record_id: u64,
    source: Document,
    stage: AtomicStage,
    hold: AtomicBool,
    state: Mutex<DocumentState>,
}

impl IndexerDocument {
    pub fn new(record_id: u64, source: Document) -> Self {
        Self {
            doc_id: format!("{}/{}", record_id, source.offset),
            record_id,
            source,
            stage: AtomicStage::new(Stage::Queued),
            hold: AtomicBool::new(false),
            state: Mutex::new(DocumentState {
                filtering: None,
                boost: 1.0,
                converted: None,
                held: None,
                errors: Vec::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, DocumentState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn record_id(&self) -> u64 {
        self.record_id
    }

    pub fn offset(&self) -> u64 {
        self.source.offset
    }

    pub fn source(&self) -> &Document {
        &self.source
    }

    pub fn stage(&self) -> Stage {
        self.stage.load()
    }

    /// Enter the running state of `kind`.
    pub fn begin(&self, kind: StageKind) -> Result<()> {
        if self.stage.transition(kind.pending(), kind.running()) {
            return Ok(());
        }
        Err(AppError::stage(
            &self.doc_id,
            kind,
            format!("cannot start from stage '{}'", self.stage()),
        ))
    }

    /// Leave the running state of `kind` successfully.
    pub fn finish(&self, kind: StageKind) -> Result<()> {
        if self.stage.transition(kind.running(), kind.done()) {
            return Ok(());
        }
        Err(AppError::stage(
            &self.doc_id,
            kind,
            format!("cannot finish from stage '{}'", self.stage()),
        ))
    }

    /// Mark the document errored. False if it had already reached a terminal stage.
    pub fn fail(&self, kind: StageKind, error: &AppError) -> bool {
        if self.stage.fail().is_none() {
            return false;
        }
        self.state().errors.push(StageError {
            stage: kind,
            message: error.to_string(),
        });
        true
    }

    pub fn errors(&self) -> Vec<StageError> {
        self.state().errors.clone()
    }

    pub fn set_hold(&self, hold: bool) {
        self.hold.store(hold, Ordering::Release);
    }

    /// Whether the committed search document is kept for the caller.
    pub fn is_held(&self) -> bool {
        self.hold.load(Ordering::Acquire)
    }

    pub fn apply_filtering(&self, outcome: FilterOutcome) {
        self.state().filtering = Some(outcome);
    }

    pub fn filter_outcome(&self) -> Option<FilterOutcome> {
        self.state().filtering.clone()
    }

    pub fn threshold(&self) -> ContentThreshold {
        self.state()
            .filtering
            .as_ref()
            .map_or(ContentThreshold::None, |f| f.threshold)
    }

    pub fn is_deferred(&self) -> bool {
        self.state().filtering.as_ref().is_some_and(|f| f.deferred)
    }

    pub fn modify_boost(&self, factor: f32) {
        self.state().boost *= factor;
    }

    pub fn boost(&self) -> f32 {
        self.state().boost
    }

    /// Store the transform output.
    pub fn converted(&self, document: SearchDocument) {
        self.state().converted = Some(document);
    }

    pub fn take_converted(&self) -> Option<SearchDocument> {
        self.state().converted.take()
    }

    /// Keep a committed document for synchronous retrieval.
    pub fn retain(&self, document: SearchDocument) {
        self.state().held = Some(document);
    }

    pub fn held_document(&self) -> Option<SearchDocument> {
        self.state().held.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document() -> IndexerDocument {
        let source = Document::new(
            77,
            "http://example.com/",
            "2020-01-01T00:00:00Z".parse().unwrap(),
        );
        IndexerDocument::new(5, source)
    }

    #[test]
    fn test_stage_order_is_enforced() {
        let doc = document();
        assert_eq!(doc.doc_id(), "5/77");
        assert_eq!(doc.stage(), Stage::Queued);

        // cannot transform before filtering
        assert!(doc.begin(StageKind::Transform).is_err());

        doc.begin(StageKind::Filter).unwrap();
        assert!(doc.begin(StageKind::Filter).is_err());
        doc.finish(StageKind::Filter).unwrap();
        assert!(doc.finish(StageKind::Filter).is_err());
        assert_eq!(doc.stage(), Stage::Filtered);

        assert!(doc.begin(StageKind::Index).is_err());
        doc.begin(StageKind::Transform).unwrap();
        doc.finish(StageKind::Transform).unwrap();
        doc.begin(StageKind::Index).unwrap();
        doc.finish(StageKind::Index).unwrap();
        assert_eq!(doc.stage(), Stage::Indexed);
        assert!(doc.stage().is_terminal());
    }

    #[test]
    fn test_fail_records_error_once() {
        let doc = document();
        doc.begin(StageKind::Filter).unwrap();

        let error = AppError::stage(doc.doc_id(), StageKind::Filter, "boom");
        assert!(doc.fail(StageKind::Filter, &error));
        assert!(!doc.fail(StageKind::Filter, &error));
        assert_eq!(doc.stage(), Stage::Errored);
        assert_eq!(doc.errors().len(), 1);
        assert_eq!(doc.errors()[0].stage, StageKind::Filter);

        // terminal documents cannot restart
        assert!(doc.begin(StageKind::Transform).is_err());
    }

    #[test]
    fn test_is_past() {
        assert!(!StageKind::Filter.is_past(Stage::Filtering));
        assert!(StageKind::Filter.is_past(Stage::Filtered));
        assert!(StageKind::Filter.is_past(Stage::Indexing));
        assert!(StageKind::Index.is_past(Stage::Errored));
        assert!(!StageKind::Index.is_past(Stage::Transformed));
    }

    #[test]
    fn test_boost_and_hold() {
        let doc = document();
        doc.modify_boost(1.35);
        doc.modify_boost(0.9);
        assert!((doc.boost() - 1.215).abs() < 1e-6);

        assert!(!doc.is_held());
        doc.set_hold(true);
        assert!(doc.is_held());
        assert_eq!(doc.threshold(), ContentThreshold::None);

        doc.apply_filtering(FilterOutcome::deferred());
        assert!(doc.is_deferred());
    }
}
