// src/services/quality.rs

//! Content thresholds and search categories.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::Document;

pub const HTML_CONTENT_TYPES: &[&str] = &["text/html"];
pub const PDF_CONTENT_TYPES: &[&str] = &["application/pdf"];
pub const DOCUMENT_CONTENT_TYPES: &[&str] = &[
    "application/rtf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.oasis.opendocument.text",
];
pub const PRESENTATION_CONTENT_TYPES: &[&str] = &[
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    "application/vnd.oasis.opendocument.presentation",
];
pub const SPREADSHEET_CONTENT_TYPES: &[&str] = &[
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "text/csv",
    "application/csv",
    "application/vnd.oasis.opendocument.spreadsheet",
];

/// How much of a document reaches the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentThreshold {
    /// Nothing is committed
    None,
    MetadataOnly,
    /// Text is cut to the first few thousand chars
    DocumentStartOnly,
    FullText,
}

impl ContentThreshold {
    pub fn is_indexed(self) -> bool {
        self != Self::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchCategory {
    Html,
    Pdf,
    Document,
    Presentation,
    Spreadsheet,
    None,
}

impl SearchCategory {
    /// Category of a searchable content type, `None` for everything else.
    pub fn from_content_type(content_type: &str) -> Self {
        let content_type = normalize(content_type);
        let content_type = content_type.as_str();
        if HTML_CONTENT_TYPES.contains(&content_type) {
            Self::Html
        } else if PDF_CONTENT_TYPES.contains(&content_type) {
            Self::Pdf
        } else if DOCUMENT_CONTENT_TYPES.contains(&content_type) {
            Self::Document
        } else if PRESENTATION_CONTENT_TYPES.contains(&content_type) {
            Self::Presentation
        } else if SPREADSHEET_CONTENT_TYPES.contains(&content_type) {
            Self::Spreadsheet
        } else {
            Self::None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Pdf => "pdf",
            Self::Document => "document",
            Self::Presentation => "presentation",
            Self::Spreadsheet => "spreadsheet",
            Self::None => "none",
        }
    }
}

impl fmt::Display for SearchCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strip parameters (`; charset=...`) and lowercase.
fn normalize(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase()
}

pub fn is_searchable(content_type: &str) -> bool {
    SearchCategory::from_content_type(content_type) != SearchCategory::None
}

/// Sites whose full text is kept regardless of size.
pub fn is_full_text_site(site: &str, pandora: bool) -> bool {
    site.ends_with(".gov.au") || pandora
}

/// Decide how much of a harvested document is indexed.
pub fn content_threshold(document: &Document, site: &str) -> ContentThreshold {
    // Unless the content was actually harvested, only describe it
    if document.status_code != 200 {
        return ContentThreshold::MetadataOnly;
    }
    if is_searchable(&document.content_type) {
        if is_full_text_site(site, document.pandora) {
            return ContentThreshold::FullText;
        }
        return ContentThreshold::DocumentStartOnly;
    }
    ContentThreshold::MetadataOnly
}
