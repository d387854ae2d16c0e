// src/pipeline/index.rs

//! Index stage: commit converted documents to the search sink.

use crate::error::Result;

use super::document::IndexerDocument;
use super::runtime::StageContext;

pub(crate) async fn process(context: &StageContext, doc: &IndexerDocument) -> Result<()> {
    let Some(search) = doc.take_converted() else {
        // Filtered out or deferred, nothing to commit
        return Ok(());
    };

    context.deps.sink.commit(&search).await?;
    log::debug!("{} committed", search.id);

    if doc.is_held() {
        doc.retain(search);
    }
    Ok(())
}
