//! Database schema migrations.
//!
//! This module contains all database migrations and schema setup.

use rusqlite::Connection;

use crate::error::{DatabaseError, ServiceResult};

/// Run all database migrations.
///
/// Every statement is idempotent so this runs on each open.
pub(super) fn run_migrations(conn: &Connection) -> ServiceResult<()> {
    conn.execute_batch(
        r#"
        -- Documents; several rows may share one stored object (same fingerprint)
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            file_name TEXT NOT NULL,
            storage_key TEXT NOT NULL,
            mime_type TEXT NOT NULL,
            file_size INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'completed',
            ref_count INTEGER NOT NULL DEFAULT 1,
            raw_text TEXT,
            cleaned_text TEXT,
            chunk_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_documents_fingerprint
            ON documents(content_hash, file_size, status);

        -- Resumable upload sessions
        CREATE TABLE IF NOT EXISTS upload_sessions (
            id TEXT PRIMARY KEY,
            file_name TEXT NOT NULL,
            mime_type TEXT NOT NULL,
            total_size INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            chunk_size INTEGER NOT NULL,
            total_chunks INTEGER NOT NULL,
            storage_key TEXT NOT NULL,
            upload_id TEXT NOT NULL,
            uploaded_size INTEGER NOT NULL DEFAULT 0,
            expires_at TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_upload_sessions_expiry ON upload_sessions(expires_at);

        CREATE TABLE IF NOT EXISTS upload_session_chunks (
            session_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            size INTEGER NOT NULL,
            part_tag TEXT NOT NULL,
            PRIMARY KEY (session_id, chunk_index),
            FOREIGN KEY (session_id) REFERENCES upload_sessions(id) ON DELETE CASCADE
        );

        -- Text chunks produced by preprocessing
        CREATE TABLE IF NOT EXISTS document_chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            content TEXT NOT NULL,
            start_offset INTEGER NOT NULL,
            end_offset INTEGER NOT NULL,
            metadata TEXT,
            created_at TEXT NOT NULL,
            UNIQUE (document_id, chunk_index),
            CHECK (end_offset > start_offset),
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_document_chunks_document ON document_chunks(document_id);

        -- Preprocessing status, one row per document
        CREATE TABLE IF NOT EXISTS processing_status (
            document_id TEXT PRIMARY KEY,
            preprocess_status TEXT NOT NULL DEFAULT 'pending',
            stage TEXT,
            progress INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            vectorize_status TEXT NOT NULL DEFAULT 'not_started',
            vectorize_progress INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            completed_at TEXT,
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_processing_status_state
            ON processing_status(preprocess_status);

        -- Reserved for the vectorization stage
        CREATE TABLE IF NOT EXISTS chunk_embeddings (
            chunk_id TEXT PRIMARY KEY,
            embedding BLOB NOT NULL,
            model TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY (chunk_id) REFERENCES document_chunks(id) ON DELETE CASCADE
        );
        "#,
    )
    .map_err(|e| DatabaseError::Migration {
        message: format!("Failed to create schema: {}", e),
    })?;

    Ok(())
}
