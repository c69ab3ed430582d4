//! Service configuration.
//!
//! Values come from an optional `config.{toml,yaml,json}` file and `DOCPIPE__`
//! environment variables, with serde defaults for everything else.

mod loader;

pub use loader::load_config;

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ServiceError, ServiceResult};

/// Complete service configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub upload: UploadConfig,

    #[serde(default)]
    pub storage_retry: RetryConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub preprocess: PreprocessConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Per-request deadline, in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Which object storage implementation holds document bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    #[default]
    Local,
    S3,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root for the SQLite database and the local object store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub backend: StorageBackendKind,

    #[serde(default)]
    pub s3: Option<S3Config>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            backend: StorageBackendKind::default(),
            s3: None,
        }
    }
}

impl StorageConfig {
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("docpipe.db")
    }

    pub fn objects_root(&self) -> PathBuf {
        self.data_dir.join("store")
    }
}

/// S3-compatible object storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    pub bucket: String,

    #[serde(default = "default_region")]
    pub region: String,

    /// Custom endpoint for S3-compatible services (MinIO, R2, ...)
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Falls back to `AWS_ACCESS_KEY_ID`
    #[serde(default)]
    pub access_key_id: Option<String>,

    /// Falls back to `AWS_SECRET_ACCESS_KEY`
    #[serde(default)]
    pub secret_access_key: Option<String>,

    /// Falls back to `AWS_SESSION_TOKEN`
    #[serde(default)]
    pub session_token: Option<String>,

    #[serde(default = "default_s3_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Resumable upload configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_upload_chunk_size")]
    pub chunk_size_bytes: u64,

    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,

    #[serde(default = "default_session_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Read back completed S3 objects and compare against the declared hash
    #[serde(default)]
    pub verify_object_storage_hash: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: default_upload_chunk_size(),
            session_ttl_secs: default_session_ttl_secs(),
            cleanup_interval_secs: default_session_cleanup_interval_secs(),
            verify_object_storage_hash: false,
        }
    }
}

impl UploadConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Backoff policy for storage operations
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Processing queue configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    #[serde(default = "default_queue_workers")]
    pub workers: usize,

    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            workers: default_queue_workers(),
            task_timeout_secs: default_task_timeout_secs(),
            retry_delay_secs: default_retry_delay_secs(),
        }
    }
}

impl QueueConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// Text preprocessing configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PreprocessConfig {
    /// Window size in characters
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Characters shared between consecutive windows
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    /// Enqueue a process task as soon as an upload completes
    #[serde(default = "default_true")]
    pub auto_enqueue: bool,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            auto_enqueue: true,
        }
    }
}

/// Request size limits
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_document_size")]
    pub max_document_size_bytes: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_document_size_bytes: default_max_document_size(),
        }
    }
}

/// Reserved vectorization stage; no embeddings are generated while disabled.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub enabled: bool,
}

impl AppConfig {
    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> ServiceResult<()> {
        let invalid = |message: String| Err(ServiceError::Config { message });

        if self.upload.chunk_size_bytes == 0 {
            return invalid("upload.chunk_size_bytes must be greater than zero".into());
        }
        if self.preprocess.chunk_size == 0 {
            return invalid("preprocess.chunk_size must be greater than zero".into());
        }
        if self.preprocess.chunk_overlap >= self.preprocess.chunk_size {
            return invalid(format!(
                "preprocess.chunk_overlap ({}) must be smaller than preprocess.chunk_size ({})",
                self.preprocess.chunk_overlap, self.preprocess.chunk_size
            ));
        }
        if self.server.request_timeout_secs == 0 {
            return invalid("server.request_timeout_secs must be greater than zero".into());
        }
        if self.queue.capacity == 0 || self.queue.workers == 0 {
            return invalid("queue.capacity and queue.workers must be greater than zero".into());
        }
        if self.storage_retry.backoff_factor < 1.0 {
            return invalid("storage_retry.backoff_factor must be at least 1.0".into());
        }
        if self.storage.backend == StorageBackendKind::S3 {
            match &self.storage.s3 {
                Some(s3) if !s3.bucket.is_empty() => {}
                _ => return invalid("storage.s3.bucket is required for the s3 backend".into()),
            }
        }
        if self.embedding.enabled {
            return invalid("embedding generation is not available in this build".into());
        }
        Ok(())
    }
}

// Default value functions

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_s3_request_timeout_secs() -> u64 {
    60
}

fn default_upload_chunk_size() -> u64 {
    1024 * 1024
}

fn default_session_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_session_cleanup_interval_secs() -> u64 {
    60 * 60
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_queue_capacity() -> usize {
    100
}

fn default_queue_workers() -> usize {
    4
}

fn default_task_timeout_secs() -> u64 {
    600
}

fn default_retry_delay_secs() -> u64 {
    30
}

fn default_chunk_size() -> usize {
    1000
}

fn default_chunk_overlap() -> usize {
    200
}

fn default_true() -> bool {
    true
}

fn default_max_document_size() -> u64 {
    100 * 1024 * 1024
}
