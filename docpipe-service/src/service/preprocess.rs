//! Preprocessing pipeline: parse, clean, chunk.
//!
//! Each stage persists its output before the next one starts, so a rerun
//! picks up after the last finished stage. Cancellation is checked at stage
//! boundaries.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::{Document, DocumentStatus, PreprocessStatus, Stage};
use crate::error::{ProcessingError, ServiceError, ServiceResult, StorageError};
use crate::events::PipelineEvent;
use crate::queue::{Task, TaskExecutor, TaskType};
use crate::service::DocpipeService;
use crate::storage::read_object;

impl DocpipeService {
    /// Run the pipeline for one document. Returns the number of chunks.
    ///
    /// With `reprocess`, every earlier output is discarded and parsing starts
    /// over; otherwise persisted stage outputs are reused.
    pub async fn preprocess_document(
        &self,
        document_id: &str,
        reprocess: bool,
        cancel: &CancellationToken,
    ) -> ServiceResult<usize> {
        let doc = self.get_document(document_id)?;

        if reprocess {
            self.db.reset_preprocessing(document_id)?;
            info!(doc_id = %document_id, "Preprocessing outputs cleared for reprocess");
        } else if let Some(status) = self.db.get_processing_status(document_id)?
            && status.preprocess_status == PreprocessStatus::Completed
        {
            debug!(doc_id = %document_id, "Document already preprocessed");
            return Ok(doc.chunk_count);
        }

        let run = self.register_processing_run(document_id, cancel);
        let result = self.run_stages(&doc, &run.token).await;
        drop(run);

        match &result {
            Ok(chunk_count) => {
                self.db.mark_preprocess_completed(document_id)?;
                info!(doc_id = %document_id, chunk_count, "Document preprocessed");
                self.emit(PipelineEvent::PreprocessCompleted {
                    document_id: document_id.to_string(),
                    chunk_count: *chunk_count,
                });
            }
            Err(ServiceError::Processing(ProcessingError::Cancelled { .. })) => {
                self.record_cancellation(document_id)
            }
            Err(e) => self.record_failure(document_id, e),
        }
        result
    }

    /// A cancelled run keeps its persisted stages and goes back to pending,
    /// unless the document was deleted while it ran.
    fn record_cancellation(&self, document_id: &str) {
        match self.db.get_document(document_id) {
            Ok(Some(_)) => {
                if let Err(e) = self.db.mark_preprocess_pending(document_id) {
                    warn!(doc_id = %document_id, error = %e, "Failed to reset cancelled preprocessing");
                }
                info!(doc_id = %document_id, "Preprocessing cancelled");
            }
            Ok(None) => debug!(doc_id = %document_id, "Preprocessing stopped for deleted document"),
            Err(e) => warn!(doc_id = %document_id, error = %e, "Failed to look up cancelled document"),
        }
    }

    /// Persist a failed status and announce it.
    fn record_failure(&self, document_id: &str, error: &ServiceError) {
        let message = error.to_string();
        if let Err(e) = self.db.mark_preprocess_failed(document_id, &message) {
            warn!(doc_id = %document_id, error = %e, "Failed to record preprocessing failure");
        }
        self.emit(PipelineEvent::PreprocessFailed {
            document_id: document_id.to_string(),
            error: message,
            retryable: error.is_retryable(),
        });
    }

    async fn run_stages(&self, doc: &Document, token: &CancellationToken) -> ServiceResult<usize> {
        let id = doc.id.as_str();
        if doc.status == DocumentStatus::Failed {
            return Err(StorageError::NotFound {
                key: doc.storage_key.clone(),
            }
            .into());
        }

        let texts = self.db.get_document_texts(id)?;

        self.check_cancellation(id, token)?;
        let raw_text = match texts.raw_text {
            Some(raw) => {
                debug!(doc_id = %id, "Reusing persisted raw text");
                raw
            }
            None => {
                self.db.mark_stage_started(id, Stage::Parse)?;
                let raw = self.parse_stage(doc).await?;
                self.db.save_raw_text(id, &raw)?;
                self.finish_stage(id, Stage::Parse)?;
                raw
            }
        };

        self.check_cancellation(id, token)?;
        let cleaned_text = match texts.cleaned_text {
            Some(cleaned) => {
                debug!(doc_id = %id, "Reusing persisted cleaned text");
                cleaned
            }
            None => {
                self.db.mark_stage_started(id, Stage::Clean)?;
                let cleaned = self.ingestion.clean(&raw_text)?;
                self.db.save_cleaned_text(id, &cleaned)?;
                self.finish_stage(id, Stage::Clean)?;
                cleaned
            }
        };

        self.check_cancellation(id, token)?;
        self.db.mark_stage_started(id, Stage::Chunk)?;
        let chunks = self.ingestion.chunk(id, &cleaned_text)?;
        self.db.replace_chunks(id, &chunks)?;
        self.finish_stage(id, Stage::Chunk)?;

        Ok(chunks.len())
    }

    /// Fetch the stored bytes and extract raw text off the async runtime.
    async fn parse_stage(&self, doc: &Document) -> ServiceResult<String> {
        let bytes = match read_object(self.store.as_ref(), &doc.storage_key).await {
            Ok(bytes) => bytes,
            Err(e @ StorageError::NotFound { .. }) => {
                warn!(doc_id = %doc.id, key = %doc.storage_key, "Stored object is missing");
                self.db.set_document_status(&doc.id, DocumentStatus::Failed)?;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        let ingestion = self.ingestion.clone();
        let file_name = doc.file_name.clone();
        let mime_type = doc.mime_type.clone();
        tokio::task::spawn_blocking(move || ingestion.parse(&file_name, &mime_type, &bytes))
            .await
            .map_err(|e| ProcessingError::TextExtraction {
                message: format!("parser task failed: {e}"),
            })?
            .map_err(ServiceError::from)
    }

    fn finish_stage(&self, document_id: &str, stage: Stage) -> ServiceResult<()> {
        self.db.mark_stage_finished(document_id, stage)?;
        debug!(doc_id = %document_id, stage = stage.as_str(), "Stage finished");
        self.emit(PipelineEvent::StageCompleted {
            document_id: document_id.to_string(),
            stage,
        });
        Ok(())
    }

    /// Reset documents a previous process left mid-pipeline.
    ///
    /// Returns their ids so they can be enqueued again.
    pub fn reconcile_interrupted(&self) -> ServiceResult<Vec<String>> {
        let ids = self.db.reset_interrupted_processing()?;
        if !ids.is_empty() {
            info!(count = ids.len(), "Reset interrupted preprocessing");
        }
        Ok(ids)
    }
}

#[async_trait]
impl TaskExecutor for DocpipeService {
    async fn execute(&self, task: &Task, cancel: &CancellationToken) -> ServiceResult<()> {
        match task.task_type {
            TaskType::Process => self
                .preprocess_document(&task.document_id, false, cancel)
                .await
                .map(|_| ()),
            TaskType::Reprocess => self
                .preprocess_document(&task.document_id, true, cancel)
                .await
                .map(|_| ()),
            TaskType::Batch => {
                // Keep going past failures; report a retryable one if any so
                // the retry reruns the batch, and finished documents are skipped
                let mut failure: Option<ServiceError> = None;
                for document_id in task.document_ids() {
                    self.check_cancellation(document_id, cancel)?;
                    if let Err(e) = self.preprocess_document(document_id, false, cancel).await {
                        warn!(task_id = %task.id, doc_id = %document_id, error = %e, "Batch document failed");
                        let replace = failure
                            .as_ref()
                            .is_none_or(|current| !current.is_retryable() && e.is_retryable());
                        if replace {
                            failure = Some(e);
                        }
                    }
                }
                failure.map_or(Ok(()), Err)
            }
        }
    }

    async fn on_timeout(&self, task: &Task, error: &ServiceError) {
        // The timed-out run's registration was dropped with its future
        for document_id in task.document_ids() {
            if let Ok(Some(status)) = self.db.get_processing_status(document_id)
                && status.preprocess_status == PreprocessStatus::Processing
            {
                self.record_failure(document_id, error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::config::AppConfig;
    use crate::service::test_support;

    const GUIDE: &[u8] = b"# Install\n\nRun the installer.\n\nPage 1 of 2\n\n# Usage\n\nCall the binary with --help.\n";

    fn small_chunks() -> AppConfig {
        let mut config = AppConfig::default();
        config.preprocess.chunk_size = 40;
        config.preprocess.chunk_overlap = 10;
        config
    }

    #[tokio::test]
    async fn test_pipeline_runs_all_stages() {
        let dir = tempfile::tempdir().unwrap();
        let svc = test_support::service_with_config(dir.path(), small_chunks());
        let doc = svc
            .upload_document("guide.md", Bytes::from_static(GUIDE), None)
            .await
            .unwrap()
            .document;

        let count = svc
            .preprocess_document(&doc.id, false, &CancellationToken::new())
            .await
            .unwrap();
        assert!(count > 1);

        let status = svc.get_status(&doc.id).unwrap();
        assert_eq!(status.preprocess_status, PreprocessStatus::Completed);
        assert_eq!(status.stage, Some(Stage::Chunk));
        assert_eq!(status.progress, 100);
        assert!(status.completed_at.is_some());

        let texts = svc.db.get_document_texts(&doc.id).unwrap();
        let cleaned = texts.cleaned_text.unwrap();
        assert!(!cleaned.contains("Page 1 of 2"));

        let chunks = svc.list_chunks(&doc.id).unwrap();
        assert_eq!(chunks.len(), count);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i);
            assert!(chunk.end_offset > chunk.start_offset);
        }
        assert_eq!(svc.get_document(&doc.id).unwrap().chunk_count, count);
    }

    #[tokio::test]
    async fn test_resume_skips_persisted_stages() {
        let dir = tempfile::tempdir().unwrap();
        let svc = test_support::service(dir.path());
        let doc = svc
            .upload_document("notes.txt", Bytes::from_static(b"original bytes"), None)
            .await
            .unwrap()
            .document;

        // A previous run got as far as parsing
        svc.db.save_raw_text(&doc.id, "persisted raw text").unwrap();
        // The stored object is gone, so parsing again would fail
        svc.store.remove(&doc.storage_key).await.unwrap();

        svc.preprocess_document(&doc.id, false, &CancellationToken::new())
            .await
            .unwrap();
        let chunks = svc.list_chunks(&doc.id).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "persisted raw text");
    }

    #[tokio::test]
    async fn test_reprocess_restarts_from_parse() {
        let dir = tempfile::tempdir().unwrap();
        let svc = test_support::service(dir.path());
        let doc = svc
            .upload_document("notes.txt", Bytes::from_static(b"fresh content"), None)
            .await
            .unwrap()
            .document;

        svc.db.save_raw_text(&doc.id, "stale").unwrap();
        svc.db.save_cleaned_text(&doc.id, "stale").unwrap();

        svc.preprocess_document(&doc.id, true, &CancellationToken::new())
            .await
            .unwrap();
        let chunks = svc.list_chunks(&doc.id).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "fresh content");
    }

    #[tokio::test]
    async fn test_unsupported_format_fails_terminally() {
        let dir = tempfile::tempdir().unwrap();
        let svc = test_support::service(dir.path());
        let doc = svc
            .upload_document("photo.png", Bytes::from_static(b"\x89PNG"), Some("image/png"))
            .await
            .unwrap()
            .document;

        let err = svc
            .preprocess_document(&doc.id, false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Processing(ProcessingError::UnsupportedFormat { .. })
        ));
        assert!(!err.is_retryable());

        let status = svc.get_status(&doc.id).unwrap();
        assert_eq!(status.preprocess_status, PreprocessStatus::Failed);
        assert_eq!(status.stage, Some(Stage::Parse));
        assert!(status.error.unwrap().contains("Unsupported"));
    }

    #[tokio::test]
    async fn test_missing_object_marks_document_failed() {
        let dir = tempfile::tempdir().unwrap();
        let svc = test_support::service(dir.path());
        let doc = svc
            .upload_document("notes.txt", Bytes::from_static(b"content"), None)
            .await
            .unwrap()
            .document;
        svc.store.remove(&doc.storage_key).await.unwrap();

        let err = svc
            .preprocess_document(&doc.id, false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Storage(StorageError::NotFound { .. })));
        assert_eq!(
            svc.get_document(&doc.id).unwrap().status,
            DocumentStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_first_stage() {
        let dir = tempfile::tempdir().unwrap();
        let svc = test_support::service(dir.path());
        let doc = svc
            .upload_document("notes.txt", Bytes::from_static(b"content"), None)
            .await
            .unwrap()
            .document;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = svc
            .preprocess_document(&doc.id, false, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Processing(ProcessingError::Cancelled { .. })
        ));
        assert_eq!(
            svc.get_status(&doc.id).unwrap().preprocess_status,
            PreprocessStatus::Pending
        );
        assert!(svc.processing_tokens.is_empty());
    }

    #[tokio::test]
    async fn test_batch_task_processes_every_document() {
        let dir = tempfile::tempdir().unwrap();
        let svc = test_support::service(dir.path());
        let a = svc
            .upload_document("a.txt", Bytes::from_static(b"first"), None)
            .await
            .unwrap()
            .document;
        let b = svc
            .upload_document("b.txt", Bytes::from_static(b"second"), None)
            .await
            .unwrap()
            .document;

        let task = Task::batch(vec![a.id.clone(), b.id.clone()]).unwrap();
        svc.execute(&task, &CancellationToken::new()).await.unwrap();

        for id in [&a.id, &b.id] {
            assert_eq!(
                svc.get_status(id).unwrap().preprocess_status,
                PreprocessStatus::Completed
            );
        }
    }

    #[tokio::test]
    async fn test_reconcile_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        let svc = test_support::service(dir.path());
        let doc = svc
            .upload_document("a.txt", Bytes::from_static(b"first"), None)
            .await
            .unwrap()
            .document;
        svc.db.mark_stage_started(&doc.id, Stage::Clean).unwrap();

        assert_eq!(svc.reconcile_interrupted().unwrap(), vec![doc.id.clone()]);
        assert_eq!(
            svc.get_status(&doc.id).unwrap().preprocess_status,
            PreprocessStatus::Pending
        );
        assert!(svc.reconcile_interrupted().unwrap().is_empty());
    }
}
