//! Service layer tying storage, persistence and the text pipeline together.
//!
//! Operations are grouped by concern into submodules, each adding an `impl`
//! block to `DocpipeService`:
//! - `upload`: resumable sessions, single-shot uploads and deduplication
//! - `documents`: lookups and reference-counted deletion
//! - `preprocess`: the parse, clean and chunk pipeline and its task executor
//! - `cancellation`: cancellation tokens of in-progress preprocessing runs

mod cancellation;
mod documents;
mod preprocess;
mod upload;

pub use upload::{ChunkReceipt, InitUploadOutcome, StoredDocument, UploadProgress};

use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;

use cancellation::ProcessingTokens;

use crate::config::AppConfig;
use crate::db::Database;
use crate::events::{EventSender, PipelineEvent};
use crate::ingestion::IngestionService;
use crate::storage::ObjectStore;

/// Main service coordinator
pub struct DocpipeService {
    pub config: AppConfig,
    pub db: Arc<Database>,
    pub store: Arc<dyn ObjectStore>,
    pub ingestion: IngestionService,
    events: EventSender,
    /// Serializes completion, duplicate creation and deletion per fingerprint
    fingerprint_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Serializes completion and teardown per upload session
    session_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Cancellation tokens of in-progress preprocessing runs, per document
    processing_tokens: ProcessingTokens,
    next_run_id: AtomicU64,
}

impl DocpipeService {
    pub fn new(
        config: AppConfig,
        db: Arc<Database>,
        store: Arc<dyn ObjectStore>,
        events: EventSender,
    ) -> Self {
        info!(backend = ?store.kind(), "Initializing docpipe service");
        let ingestion = IngestionService::new(&config.preprocess);
        Self {
            config,
            db,
            store,
            ingestion,
            events,
            fingerprint_locks: DashMap::new(),
            session_locks: DashMap::new(),
            processing_tokens: DashMap::new(),
            next_run_id: AtomicU64::new(0),
        }
    }

    pub(crate) fn emit(&self, event: PipelineEvent) {
        self.events.emit(event);
    }

    /// Take the lock for one (hash, size) fingerprint.
    pub(crate) async fn lock_fingerprint(
        &self,
        content_hash: &str,
        file_size: u64,
    ) -> KeyedLockGuard<'_> {
        lock_key(&self.fingerprint_locks, format!("{content_hash}:{file_size}")).await
    }

    /// Take the lock that makes completing, aborting and sweeping a session exclusive.
    pub(crate) async fn lock_session(&self, session_id: &str) -> KeyedLockGuard<'_> {
        lock_key(&self.session_locks, session_id.to_string()).await
    }
}

async fn lock_key(locks: &DashMap<String, Arc<Mutex<()>>>, key: String) -> KeyedLockGuard<'_> {
    let mutex = locks.entry(key.clone()).or_default().clone();
    let guard = mutex.lock_owned().await;
    KeyedLockGuard {
        locks,
        key,
        guard: Some(guard),
    }
}

/// Held entry of a lock map. The map entry is dropped with the last holder.
pub(crate) struct KeyedLockGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyedLockGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fingerprint_lock_entry_is_released() {
        let dir = tempfile::tempdir().unwrap();
        let svc = test_support::service(dir.path());

        {
            let _guard = svc.lock_fingerprint("abc", 5).await;
            assert_eq!(svc.fingerprint_locks.len(), 1);
        }
        assert!(svc.fingerprint_locks.is_empty());
    }

    #[tokio::test]
    async fn test_fingerprint_lock_serializes_holders() {
        let dir = tempfile::tempdir().unwrap();
        let svc = Arc::new(test_support::service(dir.path()));

        let guard = svc.lock_fingerprint("abc", 5).await;
        let contender = {
            let svc = svc.clone();
            tokio::spawn(async move {
                let _guard = svc.lock_fingerprint("abc", 5).await;
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
        assert!(svc.fingerprint_locks.is_empty());
    }
}
