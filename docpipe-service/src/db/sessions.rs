//! Upload session persistence.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Transaction, params};

use super::Database;
use super::models::{SESSION_COLUMNS, SessionChunk, UploadSession, format_timestamp};
use crate::error::{DatabaseError, ServiceResult};

impl Database {
    /// Insert a new upload session
    pub fn insert_session(&self, session: &UploadSession) -> ServiceResult<()> {
        let conn = self.lock()?;

        conn.execute(
            r#"
            INSERT INTO upload_sessions (id, file_name, mime_type, total_size, content_hash, chunk_size, total_chunks, storage_key, upload_id, uploaded_size, expires_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                session.id,
                session.file_name,
                session.mime_type,
                session.total_size as i64,
                session.content_hash,
                session.chunk_size as i64,
                session.total_chunks,
                session.storage_key,
                session.upload_id,
                session.uploaded_size as i64,
                format_timestamp(&session.expires_at),
                format_timestamp(&session.created_at),
                format_timestamp(&session.updated_at),
            ],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Get an upload session by ID
    pub fn get_session(&self, id: &str) -> ServiceResult<Option<UploadSession>> {
        let conn = self.lock()?;

        conn.query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM upload_sessions WHERE id = ?1"),
            params![id],
            UploadSession::from_row,
        )
        .optional()
        .map_err(|e| DatabaseError::Query(e).into())
    }

    /// Record a received chunk, replacing any earlier receipt for the same index.
    ///
    /// Returns the new uploaded-size snapshot and the number of received chunks.
    pub fn record_session_chunk(
        &self,
        session_id: &str,
        chunk: &SessionChunk,
    ) -> ServiceResult<(u64, u32)> {
        let mut conn = self.lock()?;
        let tx = Self::begin(&mut conn)?;

        tx.execute(
            "INSERT OR REPLACE INTO upload_session_chunks (session_id, chunk_index, size, part_tag) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                session_id,
                chunk.chunk_index,
                chunk.size as i64,
                chunk.part_tag
            ],
        )
        .map_err(DatabaseError::Query)?;

        let (uploaded, received): (i64, i64) = tx
            .query_row(
                "SELECT COALESCE(SUM(size), 0), COUNT(*) FROM upload_session_chunks WHERE session_id = ?1",
                params![session_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(DatabaseError::Query)?;

        tx.execute(
            "UPDATE upload_sessions SET uploaded_size = ?1, updated_at = ?2 WHERE id = ?3",
            params![uploaded, format_timestamp(&Utc::now()), session_id],
        )
        .map_err(DatabaseError::Query)?;

        tx.commit().map_err(DatabaseError::Query)?;
        Ok((uploaded as u64, received as u32))
    }

    /// Received chunks for a session, in index order
    pub fn list_session_chunks(&self, session_id: &str) -> ServiceResult<Vec<SessionChunk>> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare(
                "SELECT chunk_index, size, part_tag FROM upload_session_chunks \
                 WHERE session_id = ?1 ORDER BY chunk_index",
            )
            .map_err(DatabaseError::Query)?;

        let chunks = stmt
            .query_map(params![session_id], |row| {
                let size: i64 = row.get(1)?;
                Ok(SessionChunk {
                    chunk_index: row.get(0)?,
                    size: size as u64,
                    part_tag: row.get(2)?,
                })
            })
            .map_err(DatabaseError::Query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(DatabaseError::Query)?;

        Ok(chunks)
    }

    /// Delete a session and its chunk receipts
    pub fn delete_session(&self, id: &str) -> ServiceResult<bool> {
        let mut conn = self.lock()?;
        let tx = Self::begin(&mut conn)?;
        let deleted = Self::delete_session_in(&tx, id)?;
        tx.commit().map_err(DatabaseError::Query)?;
        Ok(deleted)
    }

    /// Sessions whose expiry is at or before `now`
    pub fn list_expired_sessions(&self, now: DateTime<Utc>) -> ServiceResult<Vec<UploadSession>> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM upload_sessions WHERE expires_at <= ?1 ORDER BY expires_at"
            ))
            .map_err(DatabaseError::Query)?;

        let sessions = stmt
            .query_map(params![format_timestamp(&now)], UploadSession::from_row)
            .map_err(DatabaseError::Query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(DatabaseError::Query)?;

        Ok(sessions)
    }

    pub(super) fn delete_session_in(tx: &Transaction<'_>, id: &str) -> ServiceResult<bool> {
        tx.execute(
            "DELETE FROM upload_session_chunks WHERE session_id = ?1",
            params![id],
        )
        .map_err(DatabaseError::Query)?;
        let rows = tx
            .execute("DELETE FROM upload_sessions WHERE id = ?1", params![id])
            .map_err(DatabaseError::Query)?;
        Ok(rows > 0)
    }
}
