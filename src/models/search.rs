// src/models/search.rs

//! Search-engine documents produced by the transform stage.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::rules::DocumentStatus;
use crate::services::{Classification, SearchCategory};

/// Returned when the strategy is not running.
pub const OFFLINE_MARKER: &str = "<error>Offline</error>";

/// Returned when no document matches the request.
pub const NOT_FOUND_MARKER: &str = "<ResultNotFound/>";

/// A document as committed to the search index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDocument {
    /// `<record>/<offset>`
    pub id: String,
    pub record_id: u64,
    pub offset: u64,

    pub url: String,
    pub delivery_url: String,
    /// SURT of `url`, used to find documents affected by access rule changes
    #[serde(default)]
    pub surt: String,
    pub date: DateTime<Utc>,
    pub year: i32,
    /// First three digits of the year, e.g. `201` for 2015
    pub decade: String,

    pub site: String,
    pub host: String,
    pub host_reversed: String,
    pub title: String,
    pub content_type: String,

    pub au_gov: bool,

    pub rule_id: Option<u64>,
    pub status: DocumentStatus,
    pub text_error: bool,

    pub search_category: SearchCategory,
    pub full_text: Option<String>,
    pub boost: f32,

    pub page_rank: Option<f32>,
    pub restricted: bool,
    pub link_text: Vec<String>,
    pub classifications: Vec<Classification>,
}

impl SearchDocument {
    pub fn new(record_id: u64, offset: u64, url: impl Into<String>, date: DateTime<Utc>) -> Self {
        let url = url.into();
        let year = date.year();
        Self {
            id: format!("{}/{}", record_id, offset),
            record_id,
            offset,
            delivery_url: url.clone(),
            url,
            surt: String::new(),
            date,
            year,
            decade: decade_of(year),
            site: String::new(),
            host: String::new(),
            host_reversed: String::new(),
            title: String::new(),
            content_type: String::new(),
            au_gov: false,
            rule_id: None,
            status: DocumentStatus::Accepted,
            text_error: false,
            search_category: SearchCategory::None,
            full_text: None,
            boost: 1.0,
            page_rank: None,
            restricted: false,
            link_text: Vec::new(),
            classifications: Vec::new(),
        }
    }

    pub fn deliverable(&self) -> bool {
        self.status.deliverable()
    }

    pub fn discoverable(&self) -> bool {
        self.status.discoverable()
    }

    /// Flattened `(field, value)` pairs in output order.
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("id", self.id.clone()),
            ("url", self.url.clone()),
            ("deliveryUrl", self.delivery_url.clone()),
            ("date", self.date.to_rfc3339()),
            ("year", self.year.to_string()),
            ("decade", self.decade.clone()),
            ("site", self.site.clone()),
            ("host", self.host.clone()),
            ("hostReversed", self.host_reversed.clone()),
            ("title", self.title.clone()),
            ("contentType", self.content_type.clone()),
            ("warcId", self.record_id.to_string()),
            ("warcOffset", self.offset.to_string()),
        ];
        if self.au_gov {
            fields.push(("auGov", "true".into()));
        }
        if let Some(rule_id) = self.rule_id {
            fields.push(("ruleId", rule_id.to_string()));
        }
        // Restrictions are only written when they take something away
        if !self.deliverable() {
            fields.push(("deliverable", "false".into()));
        }
        if !self.discoverable() {
            fields.push(("discoverable", "false".into()));
        }
        if self.text_error {
            fields.push(("textError", "true".into()));
        }
        fields.push(("searchCategory", self.search_category.to_string()));
        if let Some(text) = &self.full_text {
            fields.push(("fulltext", text.clone()));
        }
        fields.push(("boost", self.boost.to_string()));
        if let Some(rank) = self.page_rank {
            fields.push(("pageRank", rank.to_string()));
            fields.push(("restricted", self.restricted.to_string()));
        }
        for text in &self.link_text {
            fields.push(("linkText", text.clone()));
        }
        for label in &self.classifications {
            fields.push((label.field_name(), "true".into()));
        }
        fields
    }

    /// Serialize as a tagged markup payload.
    pub fn to_xml(&self) -> String {
        let mut out = String::from("<doc>");
        for (name, value) in self.fields() {
            out.push_str("<field name=\"");
            out.push_str(name);
            out.push_str("\">");
            out.push_str(&escape_xml(&value));
            out.push_str("</field>");
        }
        out.push_str("</doc>");
        out
    }
}

fn decade_of(year: i32) -> String {
    let year = format!("{:04}", year);
    year[..3].to_string()
}

pub fn escape_xml(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
