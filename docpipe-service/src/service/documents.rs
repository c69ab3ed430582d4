//! Document lookups and reference-counted deletion.

use tracing::info;

use crate::db::{Document, DocumentChunk, ProcessingStatus};
use crate::error::{ServiceError, ServiceResult};
use crate::events::PipelineEvent;
use crate::service::DocpipeService;

impl DocpipeService {
    pub fn get_document(&self, document_id: &str) -> ServiceResult<Document> {
        self.db
            .get_document(document_id)?
            .ok_or_else(|| ServiceError::DocumentNotFound {
                document_id: document_id.to_string(),
            })
    }

    /// List documents, newest first
    pub fn list_documents(&self, limit: usize, offset: usize) -> ServiceResult<Vec<Document>> {
        self.db.list_documents(limit, offset)
    }

    /// Chunks of a document in index order
    pub fn list_chunks(&self, document_id: &str) -> ServiceResult<Vec<DocumentChunk>> {
        self.get_document(document_id)?;
        self.db.list_chunks(document_id)
    }

    pub fn get_status(&self, document_id: &str) -> ServiceResult<ProcessingStatus> {
        self.db
            .get_processing_status(document_id)?
            .ok_or_else(|| ServiceError::DocumentNotFound {
                document_id: document_id.to_string(),
            })
    }

    /// Delete a document and its processing data.
    ///
    /// The stored object is removed only when no other completed document
    /// references the same fingerprint, and only after the rows are gone.
    /// Returns whether the object was removed.
    pub async fn delete_document(&self, document_id: &str) -> ServiceResult<bool> {
        let doc = self.get_document(document_id)?;

        // Cancel any in-progress preprocessing first
        if self.cancel_document_processing(document_id) {
            info!(doc_id = %document_id, "Cancelled in-progress preprocessing for deleted document");
        }

        let _guard = self.lock_fingerprint(&doc.content_hash, doc.file_size).await;

        let removal =
            self.db
                .remove_document(document_id)?
                .ok_or_else(|| ServiceError::DocumentNotFound {
                    document_id: document_id.to_string(),
                })?;

        let object_removed = removal.remaining_refs == 0;
        if object_removed {
            self.store.remove(&removal.storage_key).await?;
        }

        info!(
            doc_id = %document_id,
            remaining_refs = removal.remaining_refs,
            object_removed,
            "Document deleted"
        );
        self.emit(PipelineEvent::DocumentDeleted {
            document_id: document_id.to_string(),
            object_removed,
        });
        Ok(object_removed)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::service::test_support;

    use super::*;

    #[tokio::test]
    async fn test_reference_counted_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let svc = test_support::service(dir.path());

        let first = svc
            .upload_document("a.txt", Bytes::from_static(b"hello"), None)
            .await
            .unwrap()
            .document;
        let second = svc
            .upload_document("b.txt", Bytes::from_static(b"hello"), None)
            .await
            .unwrap()
            .document;
        let key = first.storage_key.clone();

        // Deleting the primary keeps the object; the duplicate becomes primary
        assert!(!svc.delete_document(&first.id).await.unwrap());
        assert!(svc.store.stat(&key).await.unwrap().is_some());
        let promoted = svc.db.get_document(&second.id).unwrap().unwrap();
        assert_eq!(promoted.ref_count, 1);

        assert!(svc.delete_document(&second.id).await.unwrap());
        assert!(svc.store.stat(&key).await.unwrap().is_none());
        assert!(svc.db.find_by_fingerprint(&first.content_hash, 5).unwrap().is_none());

        assert!(matches!(
            svc.delete_document(&second.id).await,
            Err(ServiceError::DocumentNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_lookups_for_missing_document() {
        let dir = tempfile::tempdir().unwrap();
        let svc = test_support::service(dir.path());

        assert!(matches!(
            svc.get_document("missing"),
            Err(ServiceError::DocumentNotFound { .. })
        ));
        assert!(matches!(
            svc.list_chunks("missing"),
            Err(ServiceError::DocumentNotFound { .. })
        ));
        assert!(matches!(
            svc.get_status("missing"),
            Err(ServiceError::DocumentNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_new_document_starts_pending() {
        let dir = tempfile::tempdir().unwrap();
        let svc = test_support::service(dir.path());

        let doc = svc
            .upload_document("a.txt", Bytes::from_static(b"hello"), None)
            .await
            .unwrap()
            .document;
        let status = svc.get_status(&doc.id).unwrap();
        assert_eq!(status.preprocess_status, crate::db::PreprocessStatus::Pending);
        assert_eq!(status.vectorize_status, "not_started");
        assert!(svc.list_chunks(&doc.id).unwrap().is_empty());
        assert_eq!(svc.list_documents(10, 0).unwrap().len(), 1);
    }
}
