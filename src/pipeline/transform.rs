// src/pipeline/transform.rs

//! Transform stage: build the search document.
//!
//! Boosts multiply from 1.0: government sites x1.35, education sites x1.1,
//! metadata-only documents x0.9. Text is kept whole for full-text documents
//! and cut to the first `TEXT_LIMIT` chars for document-start ones.

use crate::error::{AppError, Result};
use crate::models::SearchDocument;
use crate::services::{ContentThreshold, Extracted, SearchCategory};
use crate::utils::{remove_extra_spaces, shorten_text, surt};

use super::document::{IndexerDocument, StageKind};
use super::progress::BatchProgress;
use super::runtime::StageContext;

pub const GOV_BOOST: f32 = 1.35;
pub const EDU_BOOST: f32 = 1.1;
pub const METADATA_ONLY_MALUS: f32 = 0.9;

/// Chars of text kept for document-start documents.
pub const TEXT_LIMIT: usize = 3000;

pub(crate) async fn process(
    context: &StageContext,
    batch: &BatchProgress,
    doc: &IndexerDocument,
) -> Result<()> {
    let Some(filtering) = doc.filter_outcome() else {
        return Err(AppError::stage(
            doc.doc_id(),
            StageKind::Transform,
            "document reached transform without a filter outcome",
        ));
    };
    if !filtering.threshold.is_indexed() {
        return Ok(());
    }

    let source = doc.source();
    let host = source.host()?;
    let site = surt::site(&host);

    let mut search = SearchDocument::new(
        batch.record_id(),
        source.offset,
        source.url.clone(),
        source.captured_at,
    );
    search.delivery_url = source.delivery_url().to_string();
    search.surt = match &filtering.surt {
        Some(surt) => surt.clone(),
        None => source.surt()?,
    };
    search.host_reversed = host.chars().rev().collect();
    search.host = host;
    search.content_type = source.content_type.clone();

    if site.ends_with(".gov.au") {
        doc.modify_boost(GOV_BOOST);
        search.au_gov = true;
    } else if site.ends_with(".edu.au") {
        doc.modify_boost(EDU_BOOST);
    }
    search.site = site;

    let mut title = source.title.clone();
    match filtering.threshold {
        ContentThreshold::MetadataOnly => {
            doc.modify_boost(METADATA_ONLY_MALUS);
            search.search_category = SearchCategory::None;
            search.text_error = source.text_error.is_some();
        }
        threshold => {
            search.search_category = SearchCategory::from_content_type(&source.content_type);

            let extracted = extract(context, doc)?;
            if title.is_none() {
                title = extracted.title;
            }
            let text = remove_extra_spaces(&extracted.text);
            let text = if threshold == ContentThreshold::DocumentStartOnly {
                shorten_text(&text, TEXT_LIMIT).to_string()
            } else {
                text
            };
            if context.index_full_text {
                search.full_text = Some(text.trim().to_string());
            }
        }
    }

    search.title = title
        .map(|t| remove_extra_spaces(&t).trim().to_string())
        .unwrap_or_default();

    if let Some(rank) = &source.page_rank {
        search.page_rank = Some(rank.ranking);
        search.restricted = rank.is_restricted();
        search.link_text = rank.link_text.iter().map(|l| l.text.clone()).collect();
        search.classifications = rank.classifications();
    }

    search.rule_id = filtering.access.rule_id;
    search.status = filtering.access.status;
    search.boost = doc.boost();

    doc.converted(search);
    Ok(())
}

/// Upstream text when present, otherwise run the extractor over the payload.
fn extract(context: &StageContext, doc: &IndexerDocument) -> Result<Extracted> {
    let source = doc.source();
    if let Some(text) = &source.text {
        return Ok(Extracted {
            title: None,
            text: text.clone(),
        });
    }
    if let Some(error) = &source.text_error {
        return Err(AppError::extraction(doc.doc_id(), error));
    }
    if source.content.is_empty() {
        return Ok(Extracted::default());
    }
    context
        .deps
        .extractor
        .extract(doc.doc_id(), &source.content_type, &source.content)
}
