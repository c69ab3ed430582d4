//! Database model structs.
//!
//! This module contains the data structures for database records.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use crate::error::ProcessingError;

/// Format a timestamp for storage.
///
/// Fixed-width UTC with millisecond precision so stored values order correctly
/// as strings.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Storage lifecycle of a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    /// Bytes are stored and the document can be processed
    Completed,
    /// Stored bytes are unusable (for example the object vanished from storage)
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "failed" => DocumentStatus::Failed,
            _ => DocumentStatus::Completed,
        }
    }
}

/// Document record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub file_name: String,
    /// Backend-specific object key; shared by every row with the same fingerprint
    pub storage_key: String,
    pub mime_type: String,
    pub file_size: u64,
    /// Lowercase hex SHA-256 of the content
    pub content_hash: String,
    pub status: DocumentStatus,
    /// On the primary row: number of completed rows sharing the fingerprint.
    /// Duplicate references carry 1.
    pub ref_count: i64,
    pub chunk_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) const DOCUMENT_COLUMNS: &str = "id, file_name, storage_key, mime_type, file_size, \
     content_hash, status, ref_count, chunk_count, created_at, updated_at";

impl Document {
    /// A freshly stored document with a single reference.
    pub fn new_completed(
        file_name: &str,
        storage_key: &str,
        mime_type: &str,
        file_size: u64,
        content_hash: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            file_name: file_name.to_string(),
            storage_key: storage_key.to_string(),
            mime_type: mime_type.to_string(),
            file_size,
            content_hash: content_hash.to_string(),
            status: DocumentStatus::Completed,
            ref_count: 1,
            chunk_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let file_size: i64 = row.get(4)?;
        let status_str: String = row.get(6)?;
        let chunk_count: i64 = row.get(8)?;
        let created_at_str: String = row.get(9)?;
        let updated_at_str: String = row.get(10)?;

        Ok(Self {
            id: row.get(0)?,
            file_name: row.get(1)?,
            storage_key: row.get(2)?,
            mime_type: row.get(3)?,
            file_size: file_size as u64,
            content_hash: row.get(5)?,
            status: DocumentStatus::from_str(&status_str),
            ref_count: row.get(7)?,
            chunk_count: chunk_count as usize,
            created_at: parse_timestamp(&created_at_str),
            updated_at: parse_timestamp(&updated_at_str),
        })
    }
}

/// Stage outputs persisted on a document so a rerun can resume
#[derive(Debug, Clone, Default)]
pub struct DocumentTexts {
    pub raw_text: Option<String>,
    pub cleaned_text: Option<String>,
}

/// Result of removing a document row
#[derive(Debug, Clone)]
pub struct DocumentRemoval {
    pub storage_key: String,
    /// Completed rows still referencing the same fingerprint
    pub remaining_refs: i64,
}

/// Resumable upload session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: String,
    pub file_name: String,
    pub mime_type: String,
    pub total_size: u64,
    pub content_hash: String,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub storage_key: String,
    /// Backend multipart upload id (staging directory name for the local backend)
    pub upload_id: String,
    pub uploaded_size: u64,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) const SESSION_COLUMNS: &str = "id, file_name, mime_type, total_size, content_hash, \
     chunk_size, total_chunks, storage_key, upload_id, uploaded_size, expires_at, created_at, updated_at";

impl UploadSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Expected byte length of the chunk at `index`.
    pub fn expected_chunk_size(&self, index: u32) -> u64 {
        if index + 1 < self.total_chunks {
            self.chunk_size
        } else {
            self.total_size - self.chunk_size * u64::from(self.total_chunks - 1)
        }
    }

    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let total_size: i64 = row.get(3)?;
        let chunk_size: i64 = row.get(5)?;
        let total_chunks: i64 = row.get(6)?;
        let uploaded_size: i64 = row.get(9)?;
        let expires_at_str: String = row.get(10)?;
        let created_at_str: String = row.get(11)?;
        let updated_at_str: String = row.get(12)?;

        Ok(Self {
            id: row.get(0)?,
            file_name: row.get(1)?,
            mime_type: row.get(2)?,
            total_size: total_size as u64,
            content_hash: row.get(4)?,
            chunk_size: chunk_size as u64,
            total_chunks: total_chunks as u32,
            storage_key: row.get(7)?,
            upload_id: row.get(8)?,
            uploaded_size: uploaded_size as u64,
            expires_at: parse_timestamp(&expires_at_str),
            created_at: parse_timestamp(&created_at_str),
            updated_at: parse_timestamp(&updated_at_str),
        })
    }
}

/// A chunk received for an upload session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionChunk {
    pub chunk_index: u32,
    pub size: u64,
    /// Backend part tag (ETag for object storage)
    pub part_tag: String,
}

/// Schema-validated chunk metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub char_count: usize,
    pub start_char: usize,
    pub end_char: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
    /// Opaque producer-specific values
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl ChunkMetadata {
    const MAX_EXTENSION_KEY_LEN: usize = 64;

    pub fn validate(&self) -> Result<(), ProcessingError> {
        if self.end_char < self.start_char {
            return Err(ProcessingError::InvalidMetadata {
                message: format!(
                    "end_char {} precedes start_char {}",
                    self.end_char, self.start_char
                ),
            });
        }
        for key in self.extensions.keys() {
            let well_formed = !key.is_empty()
                && key.len() <= Self::MAX_EXTENSION_KEY_LEN
                && key.chars().all(|c| {
                    c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-')
                });
            if !well_formed {
                return Err(ProcessingError::InvalidMetadata {
                    message: format!("invalid extension key {key:?}"),
                });
            }
        }
        Ok(())
    }
}

/// A text chunk belonging to one document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: String,
    pub document_id: String,
    /// Dense, 0-based position within the document
    pub chunk_index: usize,
    pub content: String,
    /// Byte offset into the cleaned text
    pub start_offset: usize,
    /// Exclusive byte offset into the cleaned text
    pub end_offset: usize,
    pub metadata: ChunkMetadata,
    pub created_at: DateTime<Utc>,
}

impl DocumentChunk {
    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let chunk_index: i64 = row.get(2)?;
        let start_offset: i64 = row.get(4)?;
        let end_offset: i64 = row.get(5)?;
        let metadata_str: Option<String> = row.get(6)?;
        let created_at_str: String = row.get(7)?;

        Ok(Self {
            id: row.get(0)?,
            document_id: row.get(1)?,
            chunk_index: chunk_index as usize,
            content: row.get(3)?,
            start_offset: start_offset as usize,
            end_offset: end_offset as usize,
            metadata: metadata_str
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default(),
            created_at: parse_timestamp(&created_at_str),
        })
    }
}

/// Preprocessing lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreprocessStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl PreprocessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PreprocessStatus::Pending => "pending",
            PreprocessStatus::Processing => "processing",
            PreprocessStatus::Completed => "completed",
            PreprocessStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "processing" => PreprocessStatus::Processing,
            "completed" => PreprocessStatus::Completed,
            "failed" => PreprocessStatus::Failed,
            _ => PreprocessStatus::Pending,
        }
    }
}

/// Preprocessing stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Parse,
    Clean,
    Chunk,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Parse => "parse",
            Stage::Clean => "clean",
            Stage::Chunk => "chunk",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "parse" => Some(Stage::Parse),
            "clean" => Some(Stage::Clean),
            "chunk" => Some(Stage::Chunk),
            _ => None,
        }
    }

    /// Progress percentage when the stage starts and when it finishes
    pub fn progress_range(&self) -> (u8, u8) {
        match self {
            Stage::Parse => (10, 33),
            Stage::Clean => (33, 66),
            Stage::Chunk => (66, 100),
        }
    }
}

/// Per-document preprocessing status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingStatus {
    pub document_id: String,
    pub preprocess_status: PreprocessStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Reserved; stays `not_started` while embedding is disabled
    pub vectorize_status: String,
    pub vectorize_progress: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

pub(crate) const STATUS_COLUMNS: &str = "document_id, preprocess_status, stage, progress, error, \
     vectorize_status, vectorize_progress, created_at, updated_at, completed_at";

impl ProcessingStatus {
    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let status_str: String = row.get(1)?;
        let stage_str: Option<String> = row.get(2)?;
        let progress: i64 = row.get(3)?;
        let vectorize_progress: i64 = row.get(6)?;
        let created_at_str: String = row.get(7)?;
        let updated_at_str: String = row.get(8)?;
        let completed_at_str: Option<String> = row.get(9)?;

        Ok(Self {
            document_id: row.get(0)?,
            preprocess_status: PreprocessStatus::from_str(&status_str),
            stage: stage_str.as_deref().and_then(Stage::from_str),
            progress: progress.clamp(0, 100) as u8,
            error: row.get(4)?,
            vectorize_status: row.get(5)?,
            vectorize_progress: vectorize_progress.clamp(0, 100) as u8,
            created_at: parse_timestamp(&created_at_str),
            updated_at: parse_timestamp(&updated_at_str),
            completed_at: completed_at_str.as_deref().map(parse_timestamp),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_chunk_size_for_remainder() {
        let now = Utc::now();
        let session = UploadSession {
            id: "s".into(),
            file_name: "f".into(),
            mime_type: "text/plain".into(),
            total_size: 2 * 1024 * 1024 + 1,
            content_hash: "0".repeat(64),
            chunk_size: 1024 * 1024,
            total_chunks: 3,
            storage_key: "k".into(),
            upload_id: "u".into(),
            uploaded_size: 0,
            expires_at: now,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(session.expected_chunk_size(0), 1024 * 1024);
        assert_eq!(session.expected_chunk_size(1), 1024 * 1024);
        assert_eq!(session.expected_chunk_size(2), 1);
        assert!(session.is_expired(now));
    }

    #[test]
    fn test_metadata_extension_keys() {
        let mut metadata = ChunkMetadata {
            char_count: 5,
            start_char: 0,
            end_char: 5,
            ..Default::default()
        };
        metadata
            .extensions
            .insert("source.lang-v2_x".into(), serde_json::json!("en"));
        assert!(metadata.validate().is_ok());

        metadata
            .extensions
            .insert("Bad Key".into(), serde_json::json!(1));
        assert!(metadata.validate().is_err());

        let mut too_long = ChunkMetadata::default();
        too_long
            .extensions
            .insert("a".repeat(65), serde_json::Value::Null);
        assert!(too_long.validate().is_err());
    }

    #[test]
    fn test_timestamps_sort_as_strings() {
        let earlier = DateTime::parse_from_rfc3339("2024-01-01T00:00:09Z")
            .unwrap()
            .with_timezone(&Utc);
        let later = DateTime::parse_from_rfc3339("2024-01-01T00:00:10.5Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(format_timestamp(&earlier) < format_timestamp(&later));
        assert_eq!(parse_timestamp(&format_timestamp(&later)), later);
    }

    #[test]
    fn test_stage_progress_is_monotonic() {
        let stages = [Stage::Parse, Stage::Clean, Stage::Chunk];
        let mut last = 0;
        for stage in stages {
            let (start, end) = stage.progress_range();
            assert!(start >= last && end > start);
            last = end;
            assert_eq!(Stage::from_str(stage.as_str()), Some(stage));
        }
        assert_eq!(last, 100);
    }
}
