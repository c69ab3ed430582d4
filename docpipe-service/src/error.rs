use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Main service error type
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Document not found: {document_id}")]
    DocumentNotFound { document_id: String },

    #[error("Upload session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Upload session expired: {session_id}")]
    SessionExpired { session_id: String },

    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    #[error("Database error")]
    Database(#[from] DatabaseError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Upload(#[from] UploadError),

    #[error("Document processing failed: {0}")]
    Processing(#[from] ProcessingError),

    #[error("{0}")]
    Queue(#[from] QueueError),

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Database errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed")]
    Connection(#[source] rusqlite::Error),

    #[error("Query failed")]
    Query(#[source] rusqlite::Error),

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Serialization failed")]
    Serialization(#[source] serde_json::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,
}

/// Object storage errors, classified into retryable and terminal failures.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Connection to storage failed: {message}")]
    Connection { message: String },

    #[error("Storage request timed out: {message}")]
    Timeout { message: String },

    #[error("Storage service error (status {status}): {message}")]
    Service { status: u16, message: String },

    #[error("Storage authentication failed: {message}")]
    Auth { message: String },

    #[error("Object not found: {key}")]
    NotFound { key: String },

    #[error("Invalid storage request: {message}")]
    InvalidRequest { message: String },

    #[error("Storage I/O error")]
    Io(#[source] std::io::Error),

    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<StorageError>,
    },
}

impl StorageError {
    /// Whether the storage retry policy should try the operation again.
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::Connection { .. } | StorageError::Timeout { .. } => true,
            StorageError::Service { status, .. } => *status >= 500 || *status == 429,
            StorageError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
            ),
            StorageError::Auth { .. }
            | StorageError::NotFound { .. }
            | StorageError::InvalidRequest { .. }
            | StorageError::RetriesExhausted { .. } => false,
        }
    }

    /// Classify a reqwest transport error.
    pub fn from_transport(operation: &str, e: reqwest::Error) -> Self {
        if e.is_timeout() {
            StorageError::Timeout {
                message: format!("{operation}: {e}"),
            }
        } else if e.is_connect() || e.is_request() || e.is_body() {
            StorageError::Connection {
                message: format!("{operation}: {e}"),
            }
        } else {
            StorageError::InvalidRequest {
                message: format!("{operation}: {e}"),
            }
        }
    }

    /// Classify a non-success HTTP status returned by the storage service.
    pub fn from_status(key: &str, status: u16, body: &str) -> Self {
        let message: String = body.chars().take(500).collect();
        match status {
            401 | 403 => StorageError::Auth { message },
            404 => StorageError::NotFound {
                key: key.to_string(),
            },
            408 => StorageError::Timeout { message },
            429 | 500..=599 => StorageError::Service { status, message },
            _ => StorageError::InvalidRequest {
                message: format!("status {status}: {message}"),
            },
        }
    }
}

/// Upload protocol errors
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Content hash mismatch: declared {expected}, assembled {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Chunk index {index} out of range (total chunks {total})")]
    ChunkOutOfRange { index: u32, total: u32 },

    #[error("Chunk {index} has {actual} bytes, expected {expected}")]
    ChunkSizeMismatch {
        index: u32,
        expected: u64,
        actual: u64,
    },

    #[error("Upload incomplete, missing chunks: {missing:?}")]
    Incomplete { missing: Vec<u32> },

    #[error("File too large: {size} bytes (max {max} bytes)")]
    FileTooLarge { size: u64, max: u64 },
}

/// Document processing errors
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("Unsupported file format: {format}")]
    UnsupportedFormat { format: String },

    #[error("Failed to extract text: {message}")]
    TextExtraction { message: String },

    #[error("Document contains no indexable text")]
    EmptyContent,

    #[error("Invalid chunking parameters: size {size}, overlap {overlap}")]
    InvalidChunking { size: usize, overlap: usize },

    #[error("Invalid chunk metadata: {message}")]
    InvalidMetadata { message: String },

    #[error("Processing timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Processing cancelled for document {document_id}")]
    Cancelled { document_id: String },

    #[error("IO error")]
    Io(#[source] std::io::Error),
}

/// Processing queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Processing queue is full (capacity {capacity}), try again later")]
    QueueFull { capacity: usize },

    #[error("Processing queue is shutting down")]
    ShuttingDown,
}

/// API error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl ServiceError {
    /// Whether a task that failed with this error may be re-executed.
    ///
    /// Storage errors that exhausted their own retry budget were transient at
    /// the source, so the task-level retry gets another go at them.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::Storage(StorageError::RetriesExhausted { source, .. }) => {
                source.is_retryable()
            }
            ServiceError::Storage(e) => e.is_retryable(),
            ServiceError::Database(DatabaseError::Query(_) | DatabaseError::Connection(_)) => true,
            ServiceError::Processing(ProcessingError::Timeout { .. })
            | ServiceError::Processing(ProcessingError::Io(_)) => true,
            _ => false,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::DocumentNotFound { .. }
            | ServiceError::SessionNotFound { .. }
            | ServiceError::TaskNotFound { .. } => StatusCode::NOT_FOUND,
            ServiceError::SessionExpired { .. } => StatusCode::GONE,
            ServiceError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ServiceError::Upload(UploadError::HashMismatch { .. }) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ServiceError::Upload(UploadError::FileTooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            ServiceError::Upload(UploadError::Incomplete { .. }) => StatusCode::CONFLICT,
            ServiceError::Upload(_) => StatusCode::BAD_REQUEST,
            ServiceError::Processing(ProcessingError::UnsupportedFormat { .. }) => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            ServiceError::Processing(ProcessingError::EmptyContent) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ServiceError::Processing(ProcessingError::Cancelled { .. }) => StatusCode::CONFLICT,
            ServiceError::Queue(QueueError::QueueFull { .. })
            | ServiceError::Queue(QueueError::ShuttingDown) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Storage(StorageError::NotFound { .. }) => StatusCode::NOT_FOUND,
            ServiceError::Storage(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ServiceError::DocumentNotFound { .. } => "document_not_found",
            ServiceError::SessionNotFound { .. } => "session_not_found",
            ServiceError::SessionExpired { .. } => "session_expired",
            ServiceError::TaskNotFound { .. } => "task_not_found",
            ServiceError::Database(_) => "database_error",
            ServiceError::Storage(StorageError::NotFound { .. }) => "object_not_found",
            ServiceError::Storage(StorageError::RetriesExhausted { .. }) => {
                "storage_retries_exhausted"
            }
            ServiceError::Storage(_) => "storage_error",
            ServiceError::Upload(UploadError::HashMismatch { .. }) => "hash_mismatch",
            ServiceError::Upload(UploadError::ChunkOutOfRange { .. }) => "chunk_out_of_range",
            ServiceError::Upload(UploadError::ChunkSizeMismatch { .. }) => "chunk_size_mismatch",
            ServiceError::Upload(UploadError::Incomplete { .. }) => "upload_incomplete",
            ServiceError::Upload(UploadError::FileTooLarge { .. }) => "file_too_large",
            ServiceError::Processing(ProcessingError::UnsupportedFormat { .. }) => {
                "unsupported_format"
            }
            ServiceError::Processing(ProcessingError::TextExtraction { .. }) => {
                "text_extraction_error"
            }
            ServiceError::Processing(ProcessingError::EmptyContent) => "empty_content",
            ServiceError::Processing(ProcessingError::InvalidChunking { .. }) => {
                "invalid_chunking"
            }
            ServiceError::Processing(ProcessingError::InvalidMetadata { .. }) => {
                "invalid_chunk_metadata"
            }
            ServiceError::Processing(ProcessingError::Timeout { .. }) => "processing_timeout",
            ServiceError::Processing(ProcessingError::Cancelled { .. }) => "processing_cancelled",
            ServiceError::Processing(ProcessingError::Io(_)) => "io_error",
            ServiceError::Queue(QueueError::QueueFull { .. }) => "queue_full",
            ServiceError::Queue(QueueError::ShuttingDown) => "queue_shutting_down",
            ServiceError::InvalidRequest { .. } => "invalid_request",
            ServiceError::Config { .. } => "config_error",
            ServiceError::Internal { .. } => "internal_error",
        }
    }

    fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ServiceError::Queue(QueueError::QueueFull { .. }) => Some(5),
            _ => None,
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            ServiceError::Upload(UploadError::Incomplete { missing }) => {
                Some(serde_json::json!({ "missing_chunks": missing }))
            }
            _ => None,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %format_error_chain_ref(&self), "Request failed");
        }

        let response = ErrorResponse {
            message: self.to_string(),
            code: Some(self.error_code().to_string()),
            details: self.details(),
            retry_after_secs: self.retry_after_secs(),
        };

        (status, Json(response)).into_response()
    }
}

/// Result type alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Result type alias for storage backend operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Render an error with its full `source()` chain, outermost first.
pub fn format_error_chain_ref(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut current = error.source();
    while let Some(source) = current {
        message.push_str(": ");
        message.push_str(&source.to_string());
        current = source.source();
    }
    message
}
