//! Text pipeline for document preprocessing: parse, clean and chunk.

mod chunker;
mod clean;
mod extract;
mod hash;

pub use extract::guess_mime_type;
pub use hash::{compute_content_hash, normalize_content_hash};

use chunker::chunk_text;
use clean::clean_text;
use extract::DocumentFormat;

use chrono::Utc;
use uuid::Uuid;

use crate::config::PreprocessConfig;
use crate::db::{ChunkMetadata, DocumentChunk};
use crate::error::ProcessingError;

/// Document section
#[derive(Debug, Clone)]
pub struct Section {
    pub title: Option<String>,
    pub content: String,
}

/// Stateless stage implementations configured with the chunking parameters
#[derive(Debug, Clone)]
pub struct IngestionService {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl IngestionService {
    pub fn new(config: &PreprocessConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
        }
    }

    /// Parse stage: raw text for the document's declared type.
    pub fn parse(
        &self,
        file_name: &str,
        mime_type: &str,
        bytes: &[u8],
    ) -> Result<String, ProcessingError> {
        let format = DocumentFormat::detect(mime_type, file_name).ok_or_else(|| {
            ProcessingError::UnsupportedFormat {
                format: mime_type.to_string(),
            }
        })?;
        extract::extract_text(format, mime_type, bytes)
    }

    /// Clean stage. A document with nothing left after cleaning cannot be indexed.
    pub fn clean(&self, raw_text: &str) -> Result<String, ProcessingError> {
        let cleaned = clean_text(raw_text);
        if cleaned.trim().is_empty() {
            return Err(ProcessingError::EmptyContent);
        }
        Ok(cleaned)
    }

    /// Chunk stage: dense, 0-based chunks with validated metadata.
    pub fn chunk(
        &self,
        document_id: &str,
        cleaned_text: &str,
    ) -> Result<Vec<DocumentChunk>, ProcessingError> {
        let headings = chunker::heading_offsets(cleaned_text);
        let now = Utc::now();

        chunk_text(cleaned_text, self.chunk_size, self.chunk_overlap)?
            .into_iter()
            .map(|chunk| {
                let metadata = ChunkMetadata {
                    char_count: chunk.end_char - chunk.start_char,
                    start_char: chunk.start_char,
                    end_char: chunk.end_char,
                    section_title: chunker::section_at(&headings, chunk.start_offset)
                        .map(str::to_string),
                    page_number: None,
                    extensions: Default::default(),
                };
                metadata.validate()?;

                Ok(DocumentChunk {
                    id: Uuid::new_v4().to_string(),
                    document_id: document_id.to_string(),
                    chunk_index: chunk.index,
                    content: chunk.content,
                    start_offset: chunk.start_offset,
                    end_offset: chunk.end_offset,
                    metadata,
                    created_at: now,
                })
            })
            .collect()
    }
}
