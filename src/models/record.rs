//! Archive records and the documents extracted from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::services::PageRank;
use crate::utils::surt;

/// One WARC unit as delivered by the record source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    /// Monotonic record identifier
    pub id: u64,

    /// Document count reported by the source (may differ from `documents.len()`)
    #[serde(default)]
    pub declared_count: Option<usize>,

    #[serde(default)]
    pub documents: Vec<Document>,
}

impl Record {
    pub fn new(id: u64, documents: Vec<Document>) -> Self {
        Self {
            id,
            declared_count: None,
            documents,
        }
    }

    /// The declared document count, falling back to the number delivered.
    pub fn declared_count(&self) -> usize {
        self.declared_count.unwrap_or(self.documents.len())
    }

    /// Lock key shared by every process indexing this record.
    pub fn lock_key(id: u64) -> String {
        format!("warc-{}", id)
    }

    /// Display form used in status strings.
    pub fn label(id: u64) -> String {
        format!("warc#{}", id)
    }

    /// Total raw bytes across all documents.
    pub fn byte_size(&self) -> u64 {
        self.documents.iter().map(|d| d.content.len() as u64).sum()
    }
}

/// One captured resource inside a record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    /// Position of the capture inside its WARC file
    pub offset: u64,

    pub url: String,

    /// Canonical replay URL, defaults to `url`
    #[serde(default)]
    pub delivery_url: Option<String>,

    pub captured_at: DateTime<Utc>,

    #[serde(default = "default_status")]
    pub status_code: u16,

    #[serde(default)]
    pub content_type: String,

    #[serde(default)]
    pub title: Option<String>,

    /// Raw payload
    #[serde(default)]
    pub content: Vec<u8>,

    /// Text already extracted upstream
    #[serde(default)]
    pub text: Option<String>,

    /// Upstream extraction failure
    #[serde(default)]
    pub text_error: Option<String>,

    /// Member of the Pandora selective collection
    #[serde(default)]
    pub pandora: bool,

    #[serde(default)]
    pub page_rank: Option<PageRank>,
}

fn default_status() -> u16 {
    200
}

impl Document {
    /// Minimal document, used by sources that only know url and capture time.
    pub fn new(offset: u64, url: impl Into<String>, captured_at: DateTime<Utc>) -> Self {
        Self {
            offset,
            url: url.into(),
            delivery_url: None,
            captured_at,
            status_code: default_status(),
            content_type: String::new(),
            title: None,
            content: Vec::new(),
            text: None,
            text_error: None,
            pandora: false,
            page_rank: None,
        }
    }

    pub fn with_content(mut self, content_type: impl Into<String>, content: Vec<u8>) -> Self {
        self.content_type = content_type.into();
        self.content = content;
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn delivery_url(&self) -> &str {
        self.delivery_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .unwrap_or(&self.url)
    }

    pub fn surt(&self) -> Result<String> {
        surt::to_surt(&self.url)
    }

    pub fn host(&self) -> Result<String> {
        surt::host(&self.url)
    }

    /// Host without a leading `www` label.
    pub fn site(&self) -> Result<String> {
        Ok(surt::site(&self.host()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Document {
        Document::new(
            42,
            "http://www.nla.gov.au/fish.html",
            "2015-06-01T00:00:00Z".parse().unwrap(),
        )
    }

    #[test]
    fn test_derived_fields() {
        let doc = sample();
        assert_eq!(doc.surt().unwrap(), "(au,gov,nla,www,)/fish.html");
        assert_eq!(doc.host().unwrap(), "www.nla.gov.au");
        assert_eq!(doc.site().unwrap(), "nla.gov.au");
        assert_eq!(doc.delivery_url(), "http://www.nla.gov.au/fish.html");
    }

    #[test]
    fn test_record_defaults_from_json() {
        let record: Record = serde_json::from_str(
            r#"{"id": 7, "documents": [
                {"offset": 0, "url": "http://example.com/", "captured_at": "2020-01-01T00:00:00Z"}
            ]}"#,
        )
        .unwrap();

        assert_eq!(record.declared_count(), 1);
        assert_eq!(record.documents[0].status_code, 200);
        assert_eq!(Record::lock_key(record.id), "warc-7");
        assert_eq!(Record::label(record.id), "warc#7");
    }
}
