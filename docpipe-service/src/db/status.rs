//! Preprocessing status persistence.

use chrono::Utc;
use rusqlite::{OptionalExtension, Transaction, params};

use super::Database;
use super::models::{
    PreprocessStatus, ProcessingStatus, STATUS_COLUMNS, Stage, format_timestamp,
};
use crate::error::{DatabaseError, ServiceResult};

impl Database {
    /// Get the preprocessing status of a document
    pub fn get_processing_status(&self, document_id: &str) -> ServiceResult<Option<ProcessingStatus>> {
        let conn = self.lock()?;

        conn.query_row(
            &format!("SELECT {STATUS_COLUMNS} FROM processing_status WHERE document_id = ?1"),
            params![document_id],
            ProcessingStatus::from_row,
        )
        .optional()
        .map_err(|e| DatabaseError::Query(e).into())
    }

    /// Enter a stage: status `processing` at the stage's starting progress.
    pub fn mark_stage_started(&self, document_id: &str, stage: Stage) -> ServiceResult<()> {
        let (start, _) = stage.progress_range();
        self.write_status(document_id, PreprocessStatus::Processing, Some(stage), start, None)
    }

    /// Finish a stage: progress moves to the stage's end value.
    pub fn mark_stage_finished(&self, document_id: &str, stage: Stage) -> ServiceResult<()> {
        let (_, end) = stage.progress_range();
        self.write_status(document_id, PreprocessStatus::Processing, Some(stage), end, None)
    }

    /// Mark preprocessing as completed
    pub fn mark_preprocess_completed(&self, document_id: &str) -> ServiceResult<()> {
        let conn = self.lock()?;
        let now = format_timestamp(&Utc::now());

        conn.execute(
            "UPDATE processing_status SET preprocess_status = 'completed', stage = ?1, progress = 100, \
             error = NULL, updated_at = ?2, completed_at = ?2 WHERE document_id = ?3",
            params![Stage::Chunk.as_str(), now, document_id],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Mark preprocessing as failed, keeping the stage and progress reached
    pub fn mark_preprocess_failed(&self, document_id: &str, error: &str) -> ServiceResult<()> {
        let conn = self.lock()?;
        let now = format_timestamp(&Utc::now());

        conn.execute(
            "UPDATE processing_status SET preprocess_status = 'failed', error = ?1, \
             updated_at = ?2, completed_at = ?2 WHERE document_id = ?3",
            params![error, now, document_id],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Set the status back to `pending` without touching stage outputs.
    pub fn mark_preprocess_pending(&self, document_id: &str) -> ServiceResult<()> {
        self.write_status(document_id, PreprocessStatus::Pending, None, 0, None)
    }

    /// Clear every preprocessing output so the pipeline restarts from parsing.
    pub fn reset_preprocessing(&self, document_id: &str) -> ServiceResult<()> {
        let mut conn = self.lock()?;
        let tx = Self::begin(&mut conn)?;
        let now = format_timestamp(&Utc::now());

        Self::delete_processing_data_in(&tx, document_id)?;
        tx.execute(
            "UPDATE documents SET raw_text = NULL, cleaned_text = NULL, chunk_count = 0, \
             updated_at = ?1 WHERE id = ?2",
            params![now, document_id],
        )
        .map_err(DatabaseError::Query)?;
        Self::insert_pending_status_in(&tx, document_id)?;

        tx.commit().map_err(DatabaseError::Query)?;
        Ok(())
    }

    /// Reset rows a previous process left `processing` back to `pending`.
    ///
    /// Returns the affected document IDs so they can be re-enqueued.
    pub fn reset_interrupted_processing(&self) -> ServiceResult<Vec<String>> {
        let mut conn = self.lock()?;
        let tx = Self::begin(&mut conn)?;

        let ids = {
            let mut stmt = tx
                .prepare(
                    "SELECT document_id FROM processing_status \
                     WHERE preprocess_status = 'processing' ORDER BY updated_at",
                )
                .map_err(DatabaseError::Query)?;
            stmt.query_map([], |row| row.get::<_, String>(0))
                .map_err(DatabaseError::Query)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(DatabaseError::Query)?
        };

        tx.execute(
            "UPDATE processing_status SET preprocess_status = 'pending', updated_at = ?1 \
             WHERE preprocess_status = 'processing'",
            params![format_timestamp(&Utc::now())],
        )
        .map_err(DatabaseError::Query)?;

        tx.commit().map_err(DatabaseError::Query)?;
        Ok(ids)
    }

    pub(super) fn insert_pending_status_in(
        tx: &Transaction<'_>,
        document_id: &str,
    ) -> ServiceResult<()> {
        let now = format_timestamp(&Utc::now());
        tx.execute(
            r#"
            INSERT INTO processing_status (document_id, preprocess_status, stage, progress, error, vectorize_status, vectorize_progress, created_at, updated_at, completed_at)
            VALUES (?1, 'pending', NULL, 0, NULL, 'not_started', 0, ?2, ?2, NULL)
            ON CONFLICT(document_id) DO UPDATE SET
                preprocess_status = 'pending', stage = NULL, progress = 0, error = NULL,
                updated_at = excluded.updated_at, completed_at = NULL
            "#,
            params![document_id, now],
        )
        .map_err(DatabaseError::Query)?;
        Ok(())
    }

    fn write_status(
        &self,
        document_id: &str,
        status: PreprocessStatus,
        stage: Option<Stage>,
        progress: u8,
        error: Option<&str>,
    ) -> ServiceResult<()> {
        let conn = self.lock()?;
        let now = format_timestamp(&Utc::now());

        conn.execute(
            r#"
            INSERT INTO processing_status (document_id, preprocess_status, stage, progress, error, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            ON CONFLICT(document_id) DO UPDATE SET
                preprocess_status = excluded.preprocess_status, stage = excluded.stage,
                progress = excluded.progress, error = excluded.error,
                updated_at = excluded.updated_at, completed_at = NULL
            "#,
            params![
                document_id,
                status.as_str(),
                stage.map(|s| s.as_str()),
                i64::from(progress),
                error,
                now
            ],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ChunkMetadata, Document, DocumentChunk};

    fn document(db: &Database) -> Document {
        let doc = Document::new_completed("a.md", "documents/a/a.md", "text/markdown", 3, &"c".repeat(64));
        db.insert_document(&doc, None).unwrap();
        doc
    }

    #[test]
    fn test_stage_transitions() {
        let db = Database::open_in_memory().unwrap();
        let doc = document(&db);

        db.mark_stage_started(&doc.id, Stage::Clean).unwrap();
        let status = db.get_processing_status(&doc.id).unwrap().unwrap();
        assert_eq!(status.preprocess_status, PreprocessStatus::Processing);
        assert_eq!(status.stage, Some(Stage::Clean));
        assert_eq!(status.progress, 33);

        db.mark_preprocess_failed(&doc.id, "boom").unwrap();
        let status = db.get_processing_status(&doc.id).unwrap().unwrap();
        assert_eq!(status.preprocess_status, PreprocessStatus::Failed);
        assert_eq!(status.error.as_deref(), Some("boom"));
        assert_eq!(status.stage, Some(Stage::Clean));
        assert!(status.completed_at.is_some());

        db.mark_preprocess_completed(&doc.id).unwrap();
        let status = db.get_processing_status(&doc.id).unwrap().unwrap();
        assert_eq!(status.preprocess_status, PreprocessStatus::Completed);
        assert_eq!(status.progress, 100);
        assert!(status.error.is_none());
    }

    #[test]
    fn test_interrupted_rows_are_reset() {
        let db = Database::open_in_memory().unwrap();
        let stuck = document(&db);
        let idle = document(&db);
        db.mark_stage_started(&stuck.id, Stage::Parse).unwrap();

        let ids = db.reset_interrupted_processing().unwrap();
        assert_eq!(ids, vec![stuck.id.clone()]);
        let status = db.get_processing_status(&stuck.id).unwrap().unwrap();
        assert_eq!(status.preprocess_status, PreprocessStatus::Pending);
        assert!(db.reset_interrupted_processing().unwrap().is_empty());
        assert_eq!(
            db.get_processing_status(&idle.id).unwrap().unwrap().preprocess_status,
            PreprocessStatus::Pending
        );
    }

    #[test]
    fn test_reset_clears_stage_outputs() {
        let db = Database::open_in_memory().unwrap();
        let doc = document(&db);
        db.save_raw_text(&doc.id, "raw").unwrap();
        db.save_cleaned_text(&doc.id, "raw").unwrap();
        db.replace_chunks(
            &doc.id,
            &[DocumentChunk {
                id: "chunk-1".into(),
                document_id: doc.id.clone(),
                chunk_index: 0,
                content: "raw".into(),
                start_offset: 0,
                end_offset: 3,
                metadata: ChunkMetadata::default(),
                created_at: Utc::now(),
            }],
        )
        .unwrap();
        {
            let conn = db.lock().unwrap();
            conn.execute(
                "INSERT INTO chunk_embeddings (chunk_id, embedding, created_at) VALUES ('chunk-1', x'00', '2024-01-01T00:00:00.000Z')",
                [],
            )
            .unwrap();
        }
        db.mark_preprocess_completed(&doc.id).unwrap();

        db.reset_preprocessing(&doc.id).unwrap();
        let texts = db.get_document_texts(&doc.id).unwrap();
        assert!(texts.raw_text.is_none() && texts.cleaned_text.is_none());
        assert!(db.list_chunks(&doc.id).unwrap().is_empty());
        let status = db.get_processing_status(&doc.id).unwrap().unwrap();
        assert_eq!(status.preprocess_status, PreprocessStatus::Pending);
        assert_eq!(status.progress, 0);
        let embeddings: i64 = db
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM chunk_embeddings", [], |row| row.get(0))
            .unwrap();
        assert_eq!(embeddings, 0);
        assert!(db.get_document(&doc.id).unwrap().is_some());
    }
}
