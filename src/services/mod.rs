//! Document-level services used by the stage workers.
//!
//! - Content-safety decoding and ranking signals (`classifier`)
//! - Content thresholds and search categories (`quality`)
//! - Payload text extraction (`extract`)

pub mod classifier;
pub mod extract;
pub mod quality;

pub use classifier::{Classification, LinkTextScore, PAGE_RANK_THRESHOLD, PageRank, classify};
pub use extract::{Extracted, HtmlExtractor, TextExtractor};
pub use quality::{ContentThreshold, SearchCategory, content_threshold};
