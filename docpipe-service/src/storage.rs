//! Object storage for document bytes.
//!
//! `ObjectStore` abstracts over the local filesystem and S3-compatible object
//! storage. Both support multipart uploads so resumable upload sessions work
//! the same way on either backend. Production stores are wrapped in a
//! `RetryingStore` that applies the configured backoff policy to every call.

mod local;
mod retry;
mod s3;
mod sigv4;

pub use local::LocalStore;
use retry::{RetryPolicy, RetryingStore};
use s3::S3Store;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::config::{AppConfig, StorageBackendKind};
use crate::error::{ServiceError, ServiceResult, StorageResult};

/// Streaming object body
pub type ByteStream = BoxStream<'static, StorageResult<Bytes>>;

/// Which kind of backend a store talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    S3,
}

/// Object listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
}

/// Handle to an in-progress multipart upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadHandle {
    pub key: String,
    pub upload_id: String,
}

/// A part accepted by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartTag {
    /// 1-based part number
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
}

/// Byte-level object storage operations
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Store an object, replacing any existing one. Returns the object key.
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> StorageResult<String>;

    async fn get(&self, key: &str) -> StorageResult<ByteStream>;

    /// Size of an object, or `None` if it does not exist
    async fn stat(&self, key: &str) -> StorageResult<Option<ObjectMeta>>;

    /// Delete an object. Deleting a missing object succeeds.
    async fn remove(&self, key: &str) -> StorageResult<()>;

    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectMeta>>;

    async fn create_multipart(&self, key: &str, content_type: &str) -> StorageResult<UploadHandle>;

    /// Upload one part. Re-uploading a part number replaces it.
    async fn upload_part(
        &self,
        handle: &UploadHandle,
        part_number: u32,
        data: Bytes,
    ) -> StorageResult<PartTag>;

    /// Parts received so far, ordered by part number
    async fn list_parts(&self, handle: &UploadHandle) -> StorageResult<Vec<PartTag>>;

    /// Assemble the parts, in the given order, into the final object.
    async fn complete_multipart(
        &self,
        handle: &UploadHandle,
        parts: &[PartTag],
    ) -> StorageResult<String>;

    /// Discard a multipart upload. Aborting an unknown upload succeeds.
    async fn abort_multipart(&self, handle: &UploadHandle) -> StorageResult<()>;
}

/// Read a whole object into memory.
pub async fn read_object(store: &dyn ObjectStore, key: &str) -> StorageResult<Bytes> {
    let mut stream = store.get(key).await?;
    let mut buffer = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok(buffer.freeze())
}

/// Stream an object through SHA-256. Returns the lowercase hex digest and size.
pub async fn hash_object(store: &dyn ObjectStore, key: &str) -> StorageResult<(String, u64)> {
    let mut stream = store.get(key).await?;
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        size += chunk.len() as u64;
        hasher.update(&chunk);
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

/// Object key for a newly stored document.
///
/// Keys are scoped by a fresh id rather than the content hash, so a rolled
/// back upload can never delete an object another document points at.
pub fn document_key(scope_id: &str, file_name: &str) -> String {
    let sanitized: String = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let sanitized = sanitized.trim_start_matches('.');
    let name = if sanitized.is_empty() {
        "document"
    } else {
        sanitized
    };
    format!("documents/{scope_id}/{name}")
}

/// Build the configured backend wrapped in the storage retry policy.
pub fn build_store(config: &AppConfig) -> ServiceResult<Arc<dyn ObjectStore>> {
    let inner: Arc<dyn ObjectStore> = match config.storage.backend {
        StorageBackendKind::Local => Arc::new(LocalStore::new(config.storage.objects_root())),
        StorageBackendKind::S3 => {
            let s3 = config
                .storage
                .s3
                .as_ref()
                .ok_or_else(|| ServiceError::Config {
                    message: "storage.s3 section is required for the s3 backend".to_string(),
                })?;
            Arc::new(S3Store::new(s3)?)
        }
    };

    let policy = RetryPolicy::from_config(&config.storage_retry);
    Ok(Arc::new(RetryingStore::new(inner, policy)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_key_sanitizes_names() {
        assert_eq!(document_key("abc", "report.pdf"), "documents/abc/report.pdf");
        assert_eq!(
            document_key("abc", "../../etc/passwd"),
            "documents/abc/passwd"
        );
        assert_eq!(
            document_key("abc", "my file (1).txt"),
            "documents/abc/my_file__1_.txt"
        );
        assert_eq!(document_key("abc", ".."), "documents/abc/document");
        assert_eq!(document_key("abc", ""), "documents/abc/document");
    }

    #[tokio::test]
    async fn test_hash_object_streams_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().to_path_buf());
        store
            .put("documents/x/hello.txt", Bytes::from_static(b"hello world"), "text/plain")
            .await
            .unwrap();

        let (hash, size) = hash_object(&store, "documents/x/hello.txt").await.unwrap();
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(size, 11);

        let bytes = read_object(&store, "documents/x/hello.txt").await.unwrap();
        assert_eq!(&bytes[..], b"hello world");
    }
}
