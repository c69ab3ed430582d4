//! Resumable uploads and content deduplication.
//!
//! A document's bytes are stored once per fingerprint (content hash, byte
//! size). Uploading content that is already stored only adds a reference row.
//! Large files go through an upload session: the client declares size and
//! hash, sends fixed-size chunks in any order, then asks for completion.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{Document, SessionChunk, UploadSession};
use crate::error::{ServiceError, ServiceResult, UploadError};
use crate::events::PipelineEvent;
use crate::ingestion::{compute_content_hash, guess_mime_type, normalize_content_hash};
use crate::service::DocpipeService;
use crate::storage::{BackendKind, UploadHandle, document_key, hash_object};

/// Result of starting an upload
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InitUploadOutcome {
    /// The content is already stored; a reference was created and no bytes need sending
    Duplicate { document: Document },
    /// Send the chunks for this session
    Session { session: UploadSession },
}

/// A document row produced by an upload
#[derive(Debug, Clone, Serialize)]
pub struct StoredDocument {
    pub document: Document,
    /// True when the bytes were already stored under another document
    pub duplicate: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkReceipt {
    pub session_id: String,
    pub chunk_index: u32,
    pub uploaded_size: u64,
    pub uploaded_chunks: u32,
    pub total_chunks: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadProgress {
    pub session_id: String,
    pub file_name: String,
    pub total_size: u64,
    pub uploaded_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub received_chunks: Vec<u32>,
    pub missing_chunks: Vec<u32>,
    pub expires_at: DateTime<Utc>,
}

impl DocpipeService {
    /// Look up the stored document for a fingerprint without side effects.
    pub fn check_duplicate(&self, content_hash: &str, size: u64) -> ServiceResult<Option<Document>> {
        let hash = parse_hash(content_hash)?;
        self.db.find_by_fingerprint(&hash, size)
    }

    /// Start an upload, or short-circuit to a duplicate reference.
    pub async fn init_upload(
        &self,
        file_name: &str,
        declared_size: u64,
        content_hash: &str,
        mime_type: Option<&str>,
    ) -> ServiceResult<InitUploadOutcome> {
        let file_name = validate_file_name(file_name)?;
        self.validate_size(declared_size)?;
        let hash = parse_hash(content_hash)?;
        let mime_type = resolve_mime_type(mime_type, file_name);

        {
            let _guard = self.lock_fingerprint(&hash, declared_size).await;
            if let Some(primary) = self.db.find_by_fingerprint(&hash, declared_size)? {
                let document =
                    self.db
                        .insert_duplicate_reference(&primary, file_name, &mime_type, None)?;
                info!(
                    doc_id = %document.id,
                    primary_id = %primary.id,
                    hash = %hash,
                    "Upload deduplicated at init"
                );
                self.emit_upload_completed(&document, true);
                return Ok(InitUploadOutcome::Duplicate { document });
            }
        }

        let chunk_size = self.config.upload.chunk_size_bytes;
        let total_chunks = u32::try_from(declared_size.div_ceil(chunk_size)).map_err(|_| {
            ServiceError::InvalidRequest {
                message: format!("{declared_size} bytes needs too many {chunk_size}-byte chunks"),
            }
        })?;
        let ttl = chrono::Duration::from_std(self.config.upload.session_ttl()).map_err(|e| {
            ServiceError::Config {
                message: format!("upload.session_ttl_secs out of range: {e}"),
            }
        })?;

        let session_id = Uuid::new_v4().to_string();
        let storage_key = document_key(&session_id, file_name);
        let handle = self.store.create_multipart(&storage_key, &mime_type).await?;

        let now = Utc::now();
        let session = UploadSession {
            id: session_id,
            file_name: file_name.to_string(),
            mime_type,
            total_size: declared_size,
            content_hash: hash,
            chunk_size,
            total_chunks,
            storage_key,
            upload_id: handle.upload_id.clone(),
            uploaded_size: 0,
            expires_at: now + ttl,
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self.db.insert_session(&session) {
            if let Err(abort_err) = self.store.abort_multipart(&handle).await {
                warn!(upload_id = %handle.upload_id, error = %abort_err, "Failed to abort orphaned multipart upload");
            }
            return Err(e);
        }

        info!(
            session_id = %session.id,
            file_name = %session.file_name,
            size = session.total_size,
            total_chunks = session.total_chunks,
            "Upload session created"
        );
        Ok(InitUploadOutcome::Session { session })
    }

    /// Store one chunk of a session. Re-sending an index replaces it.
    pub async fn upload_chunk(
        &self,
        session_id: &str,
        chunk_index: u32,
        data: Bytes,
    ) -> ServiceResult<ChunkReceipt> {
        let session = self.live_session(session_id).await?;

        if chunk_index >= session.total_chunks {
            return Err(UploadError::ChunkOutOfRange {
                index: chunk_index,
                total: session.total_chunks,
            }
            .into());
        }
        let expected = session.expected_chunk_size(chunk_index);
        if data.len() as u64 != expected {
            return Err(UploadError::ChunkSizeMismatch {
                index: chunk_index,
                expected,
                actual: data.len() as u64,
            }
            .into());
        }

        let part = self
            .store
            .upload_part(&session_handle(&session), chunk_index + 1, data)
            .await?;
        let (uploaded_size, uploaded_chunks) = self.db.record_session_chunk(
            session_id,
            &SessionChunk {
                chunk_index,
                size: part.size,
                part_tag: part.etag,
            },
        )?;

        debug!(
            session_id,
            chunk_index,
            uploaded_chunks,
            total_chunks = session.total_chunks,
            "Chunk stored"
        );
        Ok(ChunkReceipt {
            session_id: session_id.to_string(),
            chunk_index,
            uploaded_size,
            uploaded_chunks,
            total_chunks: session.total_chunks,
        })
    }

    pub async fn get_upload_progress(&self, session_id: &str) -> ServiceResult<UploadProgress> {
        let session = self.live_session(session_id).await?;
        let received: Vec<u32> = self
            .db
            .list_session_chunks(session_id)?
            .into_iter()
            .map(|chunk| chunk.chunk_index)
            .collect();
        let missing = (0..session.total_chunks)
            .filter(|index| received.binary_search(index).is_err())
            .collect();

        Ok(UploadProgress {
            session_id: session.id,
            file_name: session.file_name,
            total_size: session.total_size,
            uploaded_size: session.uploaded_size,
            chunk_size: session.chunk_size,
            total_chunks: session.total_chunks,
            received_chunks: received,
            missing_chunks: missing,
            expires_at: session.expires_at,
        })
    }

    /// Assemble the chunks into the final object and register the document.
    ///
    /// Completion holds the session lock, so a repeated call for the same
    /// session waits and then finds the session consumed.
    pub async fn complete_upload(&self, session_id: &str) -> ServiceResult<StoredDocument> {
        let _session_guard = self.lock_session(session_id).await;
        let session = self.live_session(session_id).await?;
        let handle = session_handle(&session);

        let mut parts = self.store.list_parts(&handle).await?;
        parts.retain(|part| part.part_number >= 1 && part.part_number <= session.total_chunks);
        parts.sort_by_key(|part| part.part_number);
        let missing: Vec<u32> = (1..=session.total_chunks)
            .filter(|n| parts.binary_search_by_key(n, |part| part.part_number).is_err())
            .map(|n| n - 1)
            .collect();
        if !missing.is_empty() {
            return Err(UploadError::Incomplete { missing }.into());
        }

        let key = self.store.complete_multipart(&handle, &parts).await?;

        let verify = self.store.kind() == BackendKind::Local
            || self.config.upload.verify_object_storage_hash;
        if verify {
            let (actual, size) = hash_object(self.store.as_ref(), &key).await?;
            if actual != session.content_hash || size != session.total_size {
                warn!(
                    session_id,
                    expected = %session.content_hash,
                    actual = %actual,
                    size,
                    "Assembled object does not match the declared fingerprint"
                );
                self.remove_object_best_effort(&key).await;
                self.db.delete_session(session_id)?;
                return Err(UploadError::HashMismatch {
                    expected: session.content_hash,
                    actual,
                }
                .into());
            }
        }

        let _guard = self
            .lock_fingerprint(&session.content_hash, session.total_size)
            .await;

        if let Some(primary) = self
            .db
            .find_by_fingerprint(&session.content_hash, session.total_size)?
        {
            let document = self.db.insert_duplicate_reference(
                &primary,
                &session.file_name,
                &session.mime_type,
                Some(session_id),
            )?;
            // Same content finished uploading under another session; keep the older object
            if key != primary.storage_key {
                self.remove_object_best_effort(&key).await;
            }
            info!(doc_id = %document.id, primary_id = %primary.id, "Upload deduplicated at completion");
            self.emit_upload_completed(&document, true);
            return Ok(StoredDocument {
                document,
                duplicate: true,
            });
        }

        let document = Document::new_completed(
            &session.file_name,
            &key,
            &session.mime_type,
            session.total_size,
            &session.content_hash,
        );
        if let Err(e) = self.db.insert_document(&document, Some(session_id)) {
            self.remove_object_best_effort(&key).await;
            return Err(e);
        }

        info!(
            doc_id = %document.id,
            session_id,
            key = %key,
            size = document.file_size,
            "Upload completed"
        );
        self.emit_upload_completed(&document, false);
        Ok(StoredDocument {
            document,
            duplicate: false,
        })
    }

    /// Tear down a session. Unknown sessions are ignored.
    pub async fn abort_upload(&self, session_id: &str) -> ServiceResult<()> {
        let _session_guard = self.lock_session(session_id).await;
        if let Some(session) = self.db.get_session(session_id)? {
            self.teardown_session(&session).await?;
            info!(session_id, "Upload session aborted");
        }
        Ok(())
    }

    /// Tear down every expired session. Returns how many were removed.
    pub async fn cleanup_expired_sessions(&self) -> ServiceResult<usize> {
        let expired = self.db.list_expired_sessions(Utc::now())?;
        let mut removed = 0;
        for session in &expired {
            let _session_guard = self.lock_session(&session.id).await;
            // Completed or aborted while waiting for the lock
            if matches!(self.db.get_session(&session.id), Ok(None)) {
                continue;
            }
            match self.teardown_session(session).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(session_id = %session.id, error = %e, "Failed to clean up expired session"),
            }
        }
        if removed > 0 {
            info!(removed, "Expired upload sessions cleaned up");
        }
        Ok(removed)
    }

    /// Store a whole file in one request.
    pub async fn upload_document(
        &self,
        file_name: &str,
        content: Bytes,
        mime_type: Option<&str>,
    ) -> ServiceResult<StoredDocument> {
        let file_name = validate_file_name(file_name)?;
        let size = content.len() as u64;
        self.validate_size(size)?;
        let mime_type = resolve_mime_type(mime_type, file_name);
        let hash = compute_content_hash(&content);

        let _guard = self.lock_fingerprint(&hash, size).await;

        if let Some(primary) = self.db.find_by_fingerprint(&hash, size)? {
            let document =
                self.db
                    .insert_duplicate_reference(&primary, file_name, &mime_type, None)?;
            info!(doc_id = %document.id, primary_id = %primary.id, "Upload deduplicated");
            self.emit_upload_completed(&document, true);
            return Ok(StoredDocument {
                document,
                duplicate: true,
            });
        }

        let key = document_key(&Uuid::new_v4().to_string(), file_name);
        let key = self.store.put(&key, content, &mime_type).await?;

        let document = Document::new_completed(file_name, &key, &mime_type, size, &hash);
        if let Err(e) = self.db.insert_document(&document, None) {
            self.remove_object_best_effort(&key).await;
            return Err(e);
        }

        info!(doc_id = %document.id, file_name, size, hash = %hash, "Document stored");
        self.emit_upload_completed(&document, false);
        Ok(StoredDocument {
            document,
            duplicate: false,
        })
    }

    /// Load a session that is still usable; an expired one is torn down.
    async fn live_session(&self, session_id: &str) -> ServiceResult<UploadSession> {
        let session =
            self.db
                .get_session(session_id)?
                .ok_or_else(|| ServiceError::SessionNotFound {
                    session_id: session_id.to_string(),
                })?;

        if session.is_expired(Utc::now()) {
            if let Err(e) = self.teardown_session(&session).await {
                warn!(session_id, error = %e, "Failed to tear down expired session");
            }
            return Err(ServiceError::SessionExpired {
                session_id: session_id.to_string(),
            });
        }
        Ok(session)
    }

    async fn teardown_session(&self, session: &UploadSession) -> ServiceResult<()> {
        if let Err(e) = self.store.abort_multipart(&session_handle(session)).await {
            warn!(session_id = %session.id, error = %e, "Failed to abort multipart upload");
        }
        self.db.delete_session(&session.id)?;
        Ok(())
    }

    pub(crate) async fn remove_object_best_effort(&self, key: &str) {
        if let Err(e) = self.store.remove(key).await {
            warn!(key, error = %e, "Failed to remove stored object");
        }
    }

    fn validate_size(&self, size: u64) -> ServiceResult<()> {
        if size == 0 {
            return Err(ServiceError::InvalidRequest {
                message: "File is empty".to_string(),
            });
        }
        let max = self.config.limits.max_document_size_bytes;
        if size > max {
            return Err(UploadError::FileTooLarge { size, max }.into());
        }
        Ok(())
    }

    fn emit_upload_completed(&self, document: &Document, duplicate: bool) {
        self.emit(PipelineEvent::UploadCompleted {
            document_id: document.id.clone(),
            content_hash: document.content_hash.clone(),
            file_size: document.file_size,
            duplicate,
        });
    }
}

fn session_handle(session: &UploadSession) -> UploadHandle {
    UploadHandle {
        key: session.storage_key.clone(),
        upload_id: session.upload_id.clone(),
    }
}

fn validate_file_name(file_name: &str) -> ServiceResult<&str> {
    let trimmed = file_name.trim();
    if trimmed.is_empty() {
        return Err(ServiceError::InvalidRequest {
            message: "File name is required".to_string(),
        });
    }
    Ok(trimmed)
}

fn parse_hash(content_hash: &str) -> ServiceResult<String> {
    normalize_content_hash(content_hash).ok_or_else(|| ServiceError::InvalidRequest {
        message: "Content hash must be 64 hexadecimal characters (SHA-256)".to_string(),
    })
}

fn resolve_mime_type(declared: Option<&str>, file_name: &str) -> String {
    declared
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| guess_mime_type(file_name))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::config::AppConfig;
    use crate::error::StorageResult;
    use crate::service::test_support;
    use crate::storage::{ByteStream, LocalStore, ObjectMeta, ObjectStore, PartTag, read_object};

    async fn stored_objects(svc: &DocpipeService) -> usize {
        svc.store.list("documents/").await.unwrap().len()
    }

    fn session_of(outcome: InitUploadOutcome) -> UploadSession {
        match outcome {
            InitUploadOutcome::Session { session } => session,
            InitUploadOutcome::Duplicate { .. } => panic!("expected a session"),
        }
    }

    #[tokio::test]
    async fn test_duplicate_upload_shares_one_object() {
        let dir = tempfile::tempdir().unwrap();
        let svc = test_support::service(dir.path());

        let first = svc
            .upload_document("a.txt", Bytes::from_static(b"hello"), None)
            .await
            .unwrap();
        let second = svc
            .upload_document("b.txt", Bytes::from_static(b"hello"), None)
            .await
            .unwrap();

        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_ne!(first.document.id, second.document.id);
        assert_eq!(second.document.storage_key, first.document.storage_key);
        assert_eq!(second.document.ref_count, 1);

        let primary = svc.db.get_document(&first.document.id).unwrap().unwrap();
        assert_eq!(primary.ref_count, 2);
        assert_eq!(stored_objects(&svc).await, 1);
    }

    #[tokio::test]
    async fn test_init_upload_deduplicates_known_content() {
        let dir = tempfile::tempdir().unwrap();
        let svc = test_support::service(dir.path());
        let stored = svc
            .upload_document("a.txt", Bytes::from_static(b"hello"), None)
            .await
            .unwrap();

        let outcome = svc
            .init_upload("copy.txt", 5, &stored.document.content_hash.to_uppercase(), None)
            .await
            .unwrap();
        let InitUploadOutcome::Duplicate { document } = outcome else {
            panic!("expected a duplicate outcome");
        };
        assert_eq!(document.file_name, "copy.txt");
        assert_eq!(document.storage_key, stored.document.storage_key);

        // Same hash with a different size is different content
        let hash = stored.document.content_hash.clone();
        assert!(matches!(
            svc.init_upload("other.txt", 6, &hash, None).await.unwrap(),
            InitUploadOutcome::Session { .. }
        ));
    }

    #[tokio::test]
    async fn test_chunked_upload_out_of_order() {
        let dir = tempfile::tempdir().unwrap();
        let svc = test_support::service(dir.path());
        let mib = 1024 * 1024;

        let chunks = [vec![b'a'; mib], vec![b'b'; mib], vec![b'c'; 1]];
        let whole: Vec<u8> = chunks.concat();
        let hash = compute_content_hash(&whole);

        let session = session_of(
            svc.init_upload("big.bin", whole.len() as u64, &hash, Some("text/plain"))
                .await
                .unwrap(),
        );
        assert_eq!(session.total_chunks, 3);

        for index in [2u32, 0, 1] {
            let receipt = svc
                .upload_chunk(&session.id, index, Bytes::from(chunks[index as usize].clone()))
                .await
                .unwrap();
            assert_eq!(receipt.total_chunks, 3);
        }

        let progress = svc.get_upload_progress(&session.id).await.unwrap();
        assert_eq!(progress.uploaded_size, whole.len() as u64);
        assert!(progress.missing_chunks.is_empty());

        let stored = svc.complete_upload(&session.id).await.unwrap();
        assert!(!stored.duplicate);
        let bytes = crate::storage::read_object(svc.store.as_ref(), &stored.document.storage_key)
            .await
            .unwrap();
        assert_eq!(bytes.as_ref(), whole.as_slice());

        // The session is consumed
        assert!(matches!(
            svc.get_upload_progress(&session.id).await,
            Err(ServiceError::SessionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_chunk_validation() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.upload.chunk_size_bytes = 4;
        let svc = test_support::service_with_config(dir.path(), config);

        let hash = compute_content_hash(b"0123456789");
        let session = session_of(svc.init_upload("ten.txt", 10, &hash, None).await.unwrap());
        assert_eq!(session.total_chunks, 3);

        assert!(matches!(
            svc.upload_chunk(&session.id, 3, Bytes::from_static(b"89")).await,
            Err(ServiceError::Upload(UploadError::ChunkOutOfRange { index: 3, total: 3 }))
        ));
        assert!(matches!(
            svc.upload_chunk(&session.id, 0, Bytes::from_static(b"012")).await,
            Err(ServiceError::Upload(UploadError::ChunkSizeMismatch { expected: 4, .. }))
        ));
        assert!(matches!(
            svc.upload_chunk(&session.id, 2, Bytes::from_static(b"8")).await,
            Err(ServiceError::Upload(UploadError::ChunkSizeMismatch { expected: 2, .. }))
        ));

        svc.upload_chunk(&session.id, 0, Bytes::from_static(b"0123"))
            .await
            .unwrap();
        match svc.complete_upload(&session.id).await {
            Err(ServiceError::Upload(UploadError::Incomplete { missing })) => {
                assert_eq!(missing, vec![1, 2]);
            }
            other => panic!("expected incomplete upload, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_hash_mismatch_discards_object() {
        let dir = tempfile::tempdir().unwrap();
        let svc = test_support::service(dir.path());

        let declared = compute_content_hash(b"hello");
        let session = session_of(svc.init_upload("h.txt", 5, &declared, None).await.unwrap());
        svc.upload_chunk(&session.id, 0, Bytes::from_static(b"jello"))
            .await
            .unwrap();

        assert!(matches!(
            svc.complete_upload(&session.id).await,
            Err(ServiceError::Upload(UploadError::HashMismatch { .. }))
        ));
        assert_eq!(stored_objects(&svc).await, 0);
        assert!(svc.db.get_session(&session.id).unwrap().is_none());
        assert!(svc.db.find_by_fingerprint(&declared, 5).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_completion_becomes_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let svc = test_support::service(dir.path());
        let hash = compute_content_hash(b"hello");

        let s1 = session_of(svc.init_upload("one.txt", 5, &hash, None).await.unwrap());
        let s2 = session_of(svc.init_upload("two.txt", 5, &hash, None).await.unwrap());
        for session in [&s1, &s2] {
            svc.upload_chunk(&session.id, 0, Bytes::from_static(b"hello"))
                .await
                .unwrap();
        }

        let first = svc.complete_upload(&s1.id).await.unwrap();
        let second = svc.complete_upload(&s2.id).await.unwrap();
        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(second.document.storage_key, first.document.storage_key);
        assert_eq!(stored_objects(&svc).await, 1);
        assert_eq!(
            svc.db.get_document(&first.document.id).unwrap().unwrap().ref_count,
            2
        );
    }

    /// Local store that answers a repeated multipart completion the way S3
    /// does: the second call succeeds and returns the already assembled key.
    struct RepeatableCompleteStore {
        inner: LocalStore,
    }

    #[async_trait]
    impl ObjectStore for RepeatableCompleteStore {
        fn kind(&self) -> BackendKind {
            BackendKind::S3
        }

        async fn put(&self, key: &str, data: Bytes, content_type: &str) -> StorageResult<String> {
            self.inner.put(key, data, content_type).await
        }

        async fn get(&self, key: &str) -> StorageResult<ByteStream> {
            self.inner.get(key).await
        }

        async fn stat(&self, key: &str) -> StorageResult<Option<ObjectMeta>> {
            self.inner.stat(key).await
        }

        async fn remove(&self, key: &str) -> StorageResult<()> {
            self.inner.remove(key).await
        }

        async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectMeta>> {
            self.inner.list(prefix).await
        }

        async fn create_multipart(
            &self,
            key: &str,
            content_type: &str,
        ) -> StorageResult<UploadHandle> {
            self.inner.create_multipart(key, content_type).await
        }

        async fn upload_part(
            &self,
            handle: &UploadHandle,
            part_number: u32,
            data: Bytes,
        ) -> StorageResult<PartTag> {
            self.inner.upload_part(handle, part_number, data).await
        }

        async fn list_parts(&self, handle: &UploadHandle) -> StorageResult<Vec<PartTag>> {
            self.inner.list_parts(handle).await
        }

        async fn complete_multipart(
            &self,
            handle: &UploadHandle,
            parts: &[PartTag],
        ) -> StorageResult<String> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.inner.stat(&handle.key).await?.is_some() {
                return Ok(handle.key.clone());
            }
            self.inner.complete_multipart(handle, parts).await
        }

        async fn abort_multipart(&self, handle: &UploadHandle) -> StorageResult<()> {
            self.inner.abort_multipart(handle).await
        }
    }

    #[tokio::test]
    async fn test_repeated_completion_of_one_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RepeatableCompleteStore {
            inner: LocalStore::new(dir.path().join("store")),
        });
        let svc = test_support::service_with_store(dir.path(), AppConfig::default(), store);
        let hash = compute_content_hash(b"hello");

        let session = session_of(svc.init_upload("a.txt", 5, &hash, None).await.unwrap());
        svc.upload_chunk(&session.id, 0, Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let (first, second) = tokio::join!(
            svc.complete_upload(&session.id),
            svc.complete_upload(&session.id)
        );
        let (stored, rejected) = match (first, second) {
            (Ok(stored), Err(e)) | (Err(e), Ok(stored)) => (stored, e),
            (first, second) => panic!("expected exactly one completion: {first:?} {second:?}"),
        };
        assert!(matches!(rejected, ServiceError::SessionNotFound { .. }));
        assert!(!stored.duplicate);

        let documents = svc.list_documents(10, 0).unwrap();
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].ref_count, 1);
        assert!(svc.store.stat(&stored.document.storage_key).await.unwrap().is_some());
        assert!(svc.session_locks.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_chunk_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let svc = test_support::service(dir.path());
        let mib = 1024 * 1024;

        let chunks = [vec![b'x'; mib], vec![b'y'; mib], vec![b'z'; mib], vec![b'w'; 17]];
        let whole: Vec<u8> = chunks.concat();
        let hash = compute_content_hash(&whole);
        let session = session_of(
            svc.init_upload("parts.bin", whole.len() as u64, &hash, None)
                .await
                .unwrap(),
        );
        assert_eq!(session.total_chunks, 4);

        let receipts = futures::future::join_all(chunks.iter().enumerate().map(|(index, chunk)| {
            svc.upload_chunk(&session.id, index as u32, Bytes::from(chunk.clone()))
        }))
        .await;
        for receipt in receipts {
            assert_eq!(receipt.unwrap().total_chunks, 4);
        }

        let progress = svc.get_upload_progress(&session.id).await.unwrap();
        assert_eq!(progress.uploaded_size, whole.len() as u64);
        assert_eq!(progress.received_chunks, vec![0, 1, 2, 3]);
        assert!(progress.missing_chunks.is_empty());

        let stored = svc.complete_upload(&session.id).await.unwrap();
        let bytes = read_object(svc.store.as_ref(), &stored.document.storage_key)
            .await
            .unwrap();
        assert_eq!(bytes.as_ref(), whole.as_slice());
    }

    #[tokio::test]
    async fn test_expired_sessions_are_swept_idempotently() {
        let dir = tempfile::tempdir().unwrap();
        let svc = test_support::service(dir.path());
        let hash = compute_content_hash(b"hello");

        let mut session = session_of(svc.init_upload("e.txt", 5, &hash, None).await.unwrap());
        svc.upload_chunk(&session.id, 0, Bytes::from_static(b"hello"))
            .await
            .unwrap();

        // Re-insert the session row with an expiry in the past
        svc.db.delete_session(&session.id).unwrap();
        session.expires_at = Utc::now() - chrono::Duration::minutes(1);
        svc.db.insert_session(&session).unwrap();

        assert_eq!(svc.cleanup_expired_sessions().await.unwrap(), 1);
        assert_eq!(svc.cleanup_expired_sessions().await.unwrap(), 0);
        assert!(svc.db.get_session(&session.id).unwrap().is_none());
        assert!(!dir.path().join("store/staging").join(&session.upload_id).exists());
        svc.abort_upload(&session.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_session_rejects_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let svc = test_support::service(dir.path());
        let hash = compute_content_hash(b"hello");

        let mut session = session_of(svc.init_upload("e.txt", 5, &hash, None).await.unwrap());
        svc.db.delete_session(&session.id).unwrap();
        session.expires_at = Utc::now() - chrono::Duration::seconds(1);
        svc.db.insert_session(&session).unwrap();

        assert!(matches!(
            svc.upload_chunk(&session.id, 0, Bytes::from_static(b"hello")).await,
            Err(ServiceError::SessionExpired { .. })
        ));
        assert!(matches!(
            svc.upload_chunk(&session.id, 0, Bytes::from_static(b"hello")).await,
            Err(ServiceError::SessionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_init_validation() {
        let dir = tempfile::tempdir().unwrap();
        let svc = test_support::service(dir.path());
        let hash = compute_content_hash(b"x");

        assert!(matches!(
            svc.init_upload("  ", 1, &hash, None).await,
            Err(ServiceError::InvalidRequest { .. })
        ));
        assert!(matches!(
            svc.init_upload("a.txt", 0, &hash, None).await,
            Err(ServiceError::InvalidRequest { .. })
        ));
        assert!(matches!(
            svc.init_upload("a.txt", 1, "not-a-hash", None).await,
            Err(ServiceError::InvalidRequest { .. })
        ));
        let too_big = svc.config.limits.max_document_size_bytes + 1;
        assert!(matches!(
            svc.init_upload("a.txt", too_big, &hash, None).await,
            Err(ServiceError::Upload(UploadError::FileTooLarge { .. }))
        ));
    }
}
