//! Staged indexing pipeline.
//!
//! - `document`: per-document stage machine
//! - `progress`: batch tracker and completion signal
//! - `runtime`: shared worker pools and the start gate
//! - `filter`, `transform`, `index`: the work done by each pool

pub mod document;
mod filter;
mod index;
pub mod progress;
pub mod runtime;
pub mod transform;

pub use document::{FilterOutcome, IndexerDocument, Stage, StageKind};
pub use progress::BatchProgress;
pub use runtime::{PipelineDeps, PipelineRuntime};
