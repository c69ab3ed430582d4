//! Database module for SQLite operations.
//!
//! This module provides the `Database` struct and all database operations
//! organized into submodules by domain.

mod chunks;
mod documents;
mod migrations;
pub mod models;
mod sessions;
mod status;

pub use models::{
    ChunkMetadata, Document, DocumentChunk, DocumentRemoval, DocumentStatus, DocumentTexts,
    PreprocessStatus, ProcessingStatus, SessionChunk, Stage, UploadSession,
};

use rusqlite::{Connection, Transaction, TransactionBehavior, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::{DatabaseError, ServiceError, ServiceResult};

/// Database manager for SQLite operations
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database at the given path
    pub fn open(path: &Path) -> ServiceResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ServiceError::Database(DatabaseError::Connection(
                    rusqlite::Error::ToSqlConversionFailure(Box::new(e)),
                ))
            })?;
        }

        let conn = Connection::open(path).map_err(DatabaseError::Connection)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(DatabaseError::Query)?;

        Self::from_connection(conn)
    }

    /// Private in-memory database, used by tests and throwaway tooling
    pub fn open_in_memory() -> ServiceResult<Self> {
        let conn = Connection::open_in_memory().map_err(DatabaseError::Connection)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(DatabaseError::Query)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> ServiceResult<Self> {
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, DatabaseError> {
        self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)
    }

    /// Start a write transaction that takes the database write lock up front.
    fn begin(conn: &mut Connection) -> Result<Transaction<'_>, DatabaseError> {
        conn.transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(DatabaseError::Query)
    }

    /// Delete embeddings, chunks and the status row of a document.
    ///
    /// Runs inside the caller's transaction.
    fn delete_processing_data_in(tx: &Transaction<'_>, document_id: &str) -> ServiceResult<()> {
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
        tx.execute(
            "DELETE FROM processing_status WHERE document_id = ?1",
            params![document_id],
        )
        .map_err(DatabaseError::Query)?;
        Ok(())
    }
}
