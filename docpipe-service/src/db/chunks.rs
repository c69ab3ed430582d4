//! Document chunk persistence.

use chrono::Utc;
use rusqlite::params;

use super::Database;
use super::models::{DocumentChunk, format_timestamp};
use crate::error::{DatabaseError, ServiceResult};

impl Database {
    /// Replace all chunks of a document and store the new chunk count.
    ///
    /// Embeddings of the previous chunks are removed with them.
    pub fn replace_chunks(&self, document_id: &str, chunks: &[DocumentChunk]) -> ServiceResult<()> {
        let mut conn = self.lock()?;
        let tx = Self::begin(&mut conn)?;

        tx.execute(
            "DELETE FROM chunk_embeddings WHERE chunk_id IN \
             (SELECT id FROM document_chunks WHERE document_id = ?1)",
            params![document_id],
        )
        .map_err(DatabaseError::Query)?;
        tx.execute(
            "DELETE FROM document_chunks WHERE document_id = ?1",
            params![document_id],
        )
        .map_err(DatabaseError::Query)?;

        {
            let mut stmt = tx
                .prepare(
                    r#"
                    INSERT INTO document_chunks (id, document_id, chunk_index, content, start_offset, end_offset, metadata, created_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                    "#,
                )
                .map_err(DatabaseError::Query)?;

            for chunk in chunks {
                let metadata_json =
                    serde_json::to_string(&chunk.metadata).map_err(DatabaseError::Serialization)?;
                stmt.execute(params![
                    chunk.id,
                    document_id,
                    chunk.chunk_index as i64,
                    chunk.content,
                    chunk.start_offset as i64,
                    chunk.end_offset as i64,
                    metadata_json,
                    format_timestamp(&chunk.created_at),
                ])
                .map_err(DatabaseError::Query)?;
            }
        }

        tx.execute(
            "UPDATE documents SET chunk_count = ?1, updated_at = ?2 WHERE id = ?3",
            params![
                chunks.len() as i64,
                format_timestamp(&Utc::now()),
                document_id
            ],
        )
        .map_err(DatabaseError::Query)?;

        tx.commit().map_err(DatabaseError::Query)?;
        Ok(())
    }

    /// All chunks of a document ordered by index
    pub fn list_chunks(&self, document_id: &str) -> ServiceResult<Vec<DocumentChunk>> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare(
                "SELECT id, document_id, chunk_index, content, start_offset, end_offset, metadata, created_at \
                 FROM document_chunks WHERE document_id = ?1 ORDER BY chunk_index",
            )
            .map_err(DatabaseError::Query)?;

        let chunks = stmt
            .query_map(params![document_id], DocumentChunk::from_row)
            .map_err(DatabaseError::Query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(DatabaseError::Query)?;

        Ok(chunks)
    }
}
