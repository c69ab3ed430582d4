//! Cancellation token management for document preprocessing.

use dashmap::DashMap;
use std::sync::atomic::Ordering;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{ProcessingError, ServiceResult};
use crate::service::DocpipeService;

/// Tokens of the runs currently preprocessing each document
pub(crate) type ProcessingTokens = DashMap<String, Vec<(u64, CancellationToken)>>;

/// A registered preprocessing run. Dropping it unregisters only this run,
/// including when the run is abandoned mid-flight by a task timeout.
pub(crate) struct ProcessingRun<'a> {
    tokens: &'a ProcessingTokens,
    document_id: String,
    run_id: u64,
    pub token: CancellationToken,
}

impl Drop for ProcessingRun<'_> {
    fn drop(&mut self) {
        if let Some(mut runs) = self.tokens.get_mut(&self.document_id) {
            runs.retain(|(id, _)| *id != self.run_id);
        }
        self.tokens
            .remove_if(&self.document_id, |_, runs| runs.is_empty());
    }
}

impl DocpipeService {
    /// Register a run for a document about to be preprocessed.
    ///
    /// The run's token is a child of the task's token, so cancelling the task
    /// also stops the document.
    pub(crate) fn register_processing_run(
        &self,
        document_id: &str,
        task_token: &CancellationToken,
    ) -> ProcessingRun<'_> {
        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        let token = task_token.child_token();
        self.processing_tokens
            .entry(document_id.to_string())
            .or_default()
            .push((run_id, token.clone()));
        ProcessingRun {
            tokens: &self.processing_tokens,
            document_id: document_id.to_string(),
            run_id,
            token,
        }
    }

    /// Cancel every in-progress preprocessing run of a document.
    pub(crate) fn cancel_document_processing(&self, document_id: &str) -> bool {
        let Some((_, runs)) = self.processing_tokens.remove(document_id) else {
            return false;
        };
        for (_, token) in &runs {
            token.cancel();
        }
        info!(doc_id = %document_id, runs = runs.len(), "Document preprocessing cancellation triggered");
        !runs.is_empty()
    }

    /// Stage boundary check.
    pub(crate) fn check_cancellation(
        &self,
        document_id: &str,
        token: &CancellationToken,
    ) -> ServiceResult<()> {
        if token.is_cancelled() {
            Err(ProcessingError::Cancelled {
                document_id: document_id.to_string(),
            }
            .into())
        } else {
            Ok(())
        }
    }
}
