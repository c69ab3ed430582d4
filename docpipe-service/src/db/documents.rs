//! Document and fingerprint operations.
//!
//! A fingerprint is the pair (content hash, byte size). All completed rows that
//! share a fingerprint point at the same stored object; the oldest of them is
//! the primary row and carries the reference count.

use chrono::Utc;
use rusqlite::{OptionalExtension, Transaction, params};

use super::Database;
use super::models::{
    DOCUMENT_COLUMNS, Document, DocumentRemoval, DocumentStatus, DocumentTexts, format_timestamp,
};
use crate::error::{DatabaseError, ServiceError, ServiceResult};

impl Database {
    /// Find the primary completed document for a fingerprint.
    pub fn find_by_fingerprint(
        &self,
        content_hash: &str,
        file_size: u64,
    ) -> ServiceResult<Option<Document>> {
        let conn = self.lock()?;

        let doc = conn
            .query_row(
                &format!(
                    "SELECT {DOCUMENT_COLUMNS} FROM documents \
                     WHERE content_hash = ?1 AND file_size = ?2 AND status = 'completed' \
                     ORDER BY created_at ASC, rowid ASC LIMIT 1"
                ),
                params![content_hash, file_size as i64],
                Document::from_row,
            )
            .optional()
            .map_err(DatabaseError::Query)?;

        Ok(doc)
    }

    /// Insert a newly stored document with a `pending` processing status.
    ///
    /// When `consumed_session` is set, that upload session is deleted in the
    /// same transaction; if it no longer exists nothing is inserted.
    pub fn insert_document(
        &self,
        doc: &Document,
        consumed_session: Option<&str>,
    ) -> ServiceResult<()> {
        let mut conn = self.lock()?;
        let tx = Self::begin(&mut conn)?;

        Self::insert_document_in(&tx, doc)?;
        Self::insert_pending_status_in(&tx, &doc.id)?;
        Self::refresh_ref_count_in(&tx, &doc.content_hash, doc.file_size)?;
        Self::consume_session_in(&tx, consumed_session)?;

        tx.commit().map_err(DatabaseError::Query)?;
        Ok(())
    }

    /// Create a duplicate reference to an already stored fingerprint.
    ///
    /// The new row reuses the primary's storage key and gets ref count 1; the
    /// primary's count is recomputed in the same transaction.
    pub fn insert_duplicate_reference(
        &self,
        primary: &Document,
        file_name: &str,
        mime_type: &str,
        consumed_session: Option<&str>,
    ) -> ServiceResult<Document> {
        let doc = Document::new_completed(
            file_name,
            &primary.storage_key,
            mime_type,
            primary.file_size,
            &primary.content_hash,
        );

        let mut conn = self.lock()?;
        let tx = Self::begin(&mut conn)?;

        Self::insert_document_in(&tx, &doc)?;
        Self::insert_pending_status_in(&tx, &doc.id)?;
        Self::refresh_ref_count_in(&tx, &doc.content_hash, doc.file_size)?;
        Self::consume_session_in(&tx, consumed_session)?;

        tx.commit().map_err(DatabaseError::Query)?;
        Ok(doc)
    }

    /// Delete the session a document was assembled from. A session that is
    /// already gone was consumed by another completion, so the caller's
    /// transaction must not commit.
    fn consume_session_in(tx: &Transaction<'_>, session_id: Option<&str>) -> ServiceResult<()> {
        match session_id {
            Some(id) if !Self::delete_session_in(tx, id)? => Err(ServiceError::SessionNotFound {
                session_id: id.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Get a document by ID
    pub fn get_document(&self, id: &str) -> ServiceResult<Option<Document>> {
        let conn = self.lock()?;

        conn.query_row(
            &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1"),
            params![id],
            Document::from_row,
        )
        .optional()
        .map_err(|e| DatabaseError::Query(e).into())
    }

    /// List documents, newest first
    pub fn list_documents(&self, limit: usize, offset: usize) -> ServiceResult<Vec<Document>> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {DOCUMENT_COLUMNS} FROM documents \
                 ORDER BY created_at DESC, rowid DESC LIMIT ?1 OFFSET ?2"
            ))
            .map_err(DatabaseError::Query)?;

        let docs = stmt
            .query_map(params![limit as i64, offset as i64], Document::from_row)
            .map_err(DatabaseError::Query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(DatabaseError::Query)?;

        Ok(docs)
    }

    /// Remove a document row together with its processing data.
    ///
    /// Returns `None` when the document does not exist. The caller removes the
    /// stored object after this returns, and only if no references remain.
    pub fn remove_document(&self, id: &str) -> ServiceResult<Option<DocumentRemoval>> {
        let mut conn = self.lock()?;
        let tx = Self::begin(&mut conn)?;

        let doc = tx
            .query_row(
                &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1"),
                params![id],
                Document::from_row,
            )
            .optional()
            .map_err(DatabaseError::Query)?;

        let Some(doc) = doc else {
            return Ok(None);
        };

        Self::delete_processing_data_in(&tx, id)?;
        tx.execute("DELETE FROM documents WHERE id = ?1", params![id])
            .map_err(DatabaseError::Query)?;
        let remaining_refs = Self::refresh_ref_count_in(&tx, &doc.content_hash, doc.file_size)?;

        tx.commit().map_err(DatabaseError::Query)?;

        Ok(Some(DocumentRemoval {
            storage_key: doc.storage_key,
            remaining_refs,
        }))
    }

    /// Update the storage lifecycle status of a document
    pub fn set_document_status(&self, id: &str, status: DocumentStatus) -> ServiceResult<()> {
        let conn = self.lock()?;

        conn.execute(
            "UPDATE documents SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), format_timestamp(&Utc::now()), id],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Persisted stage outputs for a document
    pub fn get_document_texts(&self, id: &str) -> ServiceResult<DocumentTexts> {
        let conn = self.lock()?;

        let texts = conn
            .query_row(
                "SELECT raw_text, cleaned_text FROM documents WHERE id = ?1",
                params![id],
                |row| {
                    Ok(DocumentTexts {
                        raw_text: row.get(0)?,
                        cleaned_text: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(DatabaseError::Query)?;

        Ok(texts.unwrap_or_default())
    }

    /// Persist the parse stage output
    pub fn save_raw_text(&self, id: &str, raw_text: &str) -> ServiceResult<()> {
        let conn = self.lock()?;

        conn.execute(
            "UPDATE documents SET raw_text = ?1, updated_at = ?2 WHERE id = ?3",
            params![raw_text, format_timestamp(&Utc::now()), id],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Persist the clean stage output
    pub fn save_cleaned_text(&self, id: &str, cleaned_text: &str) -> ServiceResult<()> {
        let conn = self.lock()?;

        conn.execute(
            "UPDATE documents SET cleaned_text = ?1, updated_at = ?2 WHERE id = ?3",
            params![cleaned_text, format_timestamp(&Utc::now()), id],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    fn insert_document_in(tx: &Transaction<'_>, doc: &Document) -> ServiceResult<()> {
        tx.execute(
            r#"
            INSERT INTO documents (id, file_name, storage_key, mime_type, file_size, content_hash, status, ref_count, chunk_count, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                doc.id,
                doc.file_name,
                doc.storage_key,
                doc.mime_type,
                doc.file_size as i64,
                doc.content_hash,
                doc.status.as_str(),
                doc.ref_count,
                doc.chunk_count as i64,
                format_timestamp(&doc.created_at),
                format_timestamp(&doc.updated_at),
            ],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Recount completed rows for a fingerprint and store the count on the primary.
    fn refresh_ref_count_in(
        tx: &Transaction<'_>,
        content_hash: &str,
        file_size: u64,
    ) -> ServiceResult<i64> {
        let count: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM documents \
                 WHERE content_hash = ?1 AND file_size = ?2 AND status = 'completed'",
                params![content_hash, file_size as i64],
                |row| row.get(0),
            )
            .map_err(DatabaseError::Query)?;

        if count > 0 {
            tx.execute(
                "UPDATE documents SET ref_count = ?1, updated_at = ?2 WHERE id = \
                 (SELECT id FROM documents \
                  WHERE content_hash = ?3 AND file_size = ?4 AND status = 'completed' \
                  ORDER BY created_at ASC, rowid ASC LIMIT 1)",
                params![
                    count,
                    format_timestamp(&Utc::now()),
                    content_hash,
                    file_size as i64
                ],
            )
            .map_err(DatabaseError::Query)?;
        }

        Ok(count)
    }
}
