// src/services/extract.rs

//! Text extraction from raw payloads.
//!
//! Extraction is a pure function of content type and bytes; the pipeline only
//! calls it when a document arrives without upstream text.

use scraper::{ElementRef, Html, Selector};

use crate::error::{AppError, Result};

/// Title and body text pulled out of a payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extracted {
    pub title: Option<String>,
    pub text: String,
}

pub trait TextExtractor: Send + Sync {
    fn extract(&self, doc_id: &str, content_type: &str, content: &[u8]) -> Result<Extracted>;
}

/// Handles HTML through `scraper` and plain text formats as UTF-8.
#[derive(Debug, Clone, Default)]
pub struct HtmlExtractor;

impl HtmlExtractor {
    fn extract_html(&self, doc_id: &str, content: &[u8]) -> Result<Extracted> {
        let html = String::from_utf8_lossy(content);
        let document = Html::parse_document(&html);

        let title_selector = Selector::parse("title")
            .map_err(|e| AppError::extraction(doc_id, format!("title selector: {e}")))?;
        let body_selector = Selector::parse("body")
            .map_err(|e| AppError::extraction(doc_id, format!("body selector: {e}")))?;

        let title = document
            .select(&title_selector)
            .next()
            .map(|t| t.text().collect::<String>().trim().to_string())
            .filter(|t| !t.is_empty());

        let root = document
            .select(&body_selector)
            .next()
            .unwrap_or_else(|| document.root_element());

        Ok(Extracted {
            title,
            text: visible_text(root),
        })
    }
}

/// Text nodes under `root`, skipping script and style content.
fn visible_text(root: ElementRef<'_>) -> String {
    let mut parts = Vec::new();
    for node in root.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(|p| p.value().as_element().map(|e| e.name()))
            .is_some_and(|name| matches!(name, "script" | "style" | "noscript"));
        let trimmed = text.trim();
        if !hidden && !trimmed.is_empty() {
            parts.push(trimmed);
        }
    }
    parts.join(" ")
}

impl TextExtractor for HtmlExtractor {
    fn extract(&self, doc_id: &str, content_type: &str, content: &[u8]) -> Result<Extracted> {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_lowercase();
        match mime.as_str() {
            "text/html" | "application/xhtml+xml" => self.extract_html(doc_id, content),
            "text/plain" | "text/csv" | "application/csv" => Ok(Extracted {
                title: None,
                text: String::from_utf8_lossy(content).into_owned(),
            }),
            other => Err(AppError::extraction(
                doc_id,
                format!("no extractor for content type '{}'", other),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_html() {
        let html = br#"<html><head><title> Fish </title><style>p{}</style></head>
            <body><h1>Fish</h1><script>var x = 1;</script><p>Swim   well</p></body></html>"#;
        let extracted = HtmlExtractor.extract("1/0", "text/html; charset=utf-8", html).unwrap();
        assert_eq!(extracted.title.as_deref(), Some("Fish"));
        assert_eq!(extracted.text, "Fish Swim   well");
    }

    #[test]
    fn test_extract_plain_text() {
        let extracted = HtmlExtractor.extract("1/0", "text/plain", b"hello").unwrap();
        assert_eq!(extracted.text, "hello");
        assert_eq!(extracted.title, None);
    }

    #[test]
    fn test_unsupported_type_is_extraction_error() {
        let result = HtmlExtractor.extract("1/0", "application/pdf", b"%PDF");
        assert!(matches!(result, Err(AppError::Extraction { .. })));
    }
}
