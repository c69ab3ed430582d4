//! Exponential backoff for storage operations.

use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::{BackendKind, ByteStream, ObjectMeta, ObjectStore, PartTag, UploadHandle};
use crate::config::RetryConfig;
use crate::error::{StorageError, StorageResult};

/// Backoff policy: `delay(attempt) = min(initial * factor^attempt, max)`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            factor: config.backoff_factor,
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(attempt as i32);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(scaled)
        }
    }

    /// Run `op`, retrying retryable failures until the budget is spent.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> StorageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= self.max_retries => {
                    metrics::counter!("docpipe_storage_retries_exhausted_total", "operation" => operation.to_string())
                        .increment(1);
                    return Err(StorageError::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: attempt + 1,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Storage operation failed, retrying"
                    );
                    metrics::counter!("docpipe_storage_retries_total", "operation" => operation.to_string())
                        .increment(1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Applies a `RetryPolicy` to every call of an inner store.
pub struct RetryingStore {
    inner: Arc<dyn ObjectStore>,
    policy: RetryPolicy,
}

impl RetryingStore {
    pub fn new(inner: Arc<dyn ObjectStore>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl ObjectStore for RetryingStore {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> StorageResult<String> {
        let inner = &self.inner;
        self.policy
            .run("put", move || inner.put(key, data.clone(), content_type))
            .await
    }

    async fn get(&self, key: &str) -> StorageResult<ByteStream> {
        let inner = &self.inner;
        self.policy.run("get", move || inner.get(key)).await
    }

    async fn stat(&self, key: &str) -> StorageResult<Option<ObjectMeta>> {
        let inner = &self.inner;
        self.policy.run("stat", move || inner.stat(key)).await
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        let inner = &self.inner;
        self.policy.run("remove", move || inner.remove(key)).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectMeta>> {
        let inner = &self.inner;
        self.policy.run("list", move || inner.list(prefix)).await
    }

    async fn create_multipart(&self, key: &str, content_type: &str) -> StorageResult<UploadHandle> {
        let inner = &self.inner;
        self.policy
            .run("create_multipart", move || {
                inner.create_multipart(key, content_type)
            })
            .await
    }

    async fn upload_part(
        &self,
        handle: &UploadHandle,
        part_number: u32,
        data: Bytes,
    ) -> StorageResult<PartTag> {
        let inner = &self.inner;
        self.policy
            .run("upload_part", move || {
                inner.upload_part(handle, part_number, data.clone())
            })
            .await
    }

    async fn list_parts(&self, handle: &UploadHandle) -> StorageResult<Vec<PartTag>> {
        let inner = &self.inner;
        self.policy
            .run("list_parts", move || inner.list_parts(handle))
            .await
    }

    async fn complete_multipart(
        &self,
        handle: &UploadHandle,
        parts: &[PartTag],
    ) -> StorageResult<String> {
        let inner = &self.inner;
        self.policy
            .run("complete_multipart", move || {
                inner.complete_multipart(handle, parts)
            })
            .await
    }

    async fn abort_multipart(&self, handle: &UploadHandle) -> StorageResult<()> {
        let inner = &self.inner;
        self.policy
            .run("abort_multipart", move || inner.abort_multipart(handle))
            .await
    }
}
