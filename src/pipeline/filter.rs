// src/pipeline/filter.rs

//! Filter stage: record lock, SURT filter, content threshold and access decision.

use chrono::Utc;

use crate::error::{AppError, Result};
use crate::models::Record;
use crate::services::content_threshold;

use super::document::{FilterOutcome, IndexerDocument, StageKind};
use super::progress::BatchProgress;
use super::runtime::StageContext;

pub(crate) async fn process(
    context: &StageContext,
    batch: &BatchProgress,
    doc: &IndexerDocument,
) -> Result<()> {
    // The first document of a record to reach a worker takes the lock for the whole batch
    let key = Record::lock_key(batch.record_id());
    let locks = &context.deps.locks;
    if !batch.claim_lock(|| locks.try_acquire(&key)).await? {
        if !batch.is_retry_later() {
            log::info!("{} is locked by another process, deferring", batch.label());
        }
        batch.mark_retry_later();
        doc.apply_filtering(FilterOutcome::deferred());
        return Ok(());
    }

    let source = doc.source();
    let surt = source
        .surt()
        .map_err(|e| AppError::stage(doc.doc_id(), StageKind::Filter, e))?;

    if !context.deps.surt_filter.accepts(&surt) {
        log::debug!("{} excluded by SURT filter: {}", doc.doc_id(), surt);
        doc.apply_filtering(FilterOutcome::excluded(surt));
        return Ok(());
    }

    let site = source
        .site()
        .map_err(|e| AppError::stage(doc.doc_id(), StageKind::Filter, e))?;
    let threshold = content_threshold(source, &site);
    let access = context.deps.access.check(&surt, source.captured_at, Utc::now());

    log::debug!(
        "{} filtered: {:?}, {} (rule {:?})",
        doc.doc_id(),
        threshold,
        access.status.as_str(),
        access.rule_id
    );
    doc.apply_filtering(FilterOutcome {
        surt: Some(surt),
        threshold,
        access,
        deferred: false,
    });
    Ok(())
}
