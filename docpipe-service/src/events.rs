//! Outbound pipeline events.
//!
//! Upload and preprocessing code publishes events on a bounded channel; a
//! single consumer task turns them into log lines and metrics. Publishing
//! never blocks: when the consumer falls behind, events are dropped with a
//! warning.

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::Stage;

/// Something observable happened to a document
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// A document row now exists for uploaded content
    UploadCompleted {
        document_id: String,
        content_hash: String,
        file_size: u64,
        /// True when the content was already stored and only a reference was added
        duplicate: bool,
    },
    StageCompleted {
        document_id: String,
        stage: Stage,
    },
    PreprocessCompleted {
        document_id: String,
        chunk_count: usize,
    },
    PreprocessFailed {
        document_id: String,
        error: String,
        retryable: bool,
    },
    DocumentDeleted {
        document_id: String,
        /// True when this was the last reference and the stored object was removed
        object_removed: bool,
    },
}

impl PipelineEvent {
    fn kind(&self) -> &'static str {
        match self {
            PipelineEvent::UploadCompleted { .. } => "upload_completed",
            PipelineEvent::StageCompleted { .. } => "stage_completed",
            PipelineEvent::PreprocessCompleted { .. } => "preprocess_completed",
            PipelineEvent::PreprocessFailed { .. } => "preprocess_failed",
            PipelineEvent::DocumentDeleted { .. } => "document_deleted",
        }
    }
}

/// Publishing half of the event channel
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<PipelineEvent>,
}

impl EventSender {
    /// Publish an event without waiting for channel space.
    pub fn emit(&self, event: PipelineEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                metrics::counter!("docpipe_events_dropped_total", "kind" => event.kind())
                    .increment(1);
                warn!(kind = event.kind(), "Event channel full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                debug!(kind = event.kind(), "Event consumer stopped, dropping event");
            }
        }
    }
}

/// Create a bounded event channel.
pub fn channel(capacity: usize) -> (EventSender, mpsc::Receiver<PipelineEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSender { tx }, rx)
}

/// Drain events until every sender is gone or `cancel` fires.
pub async fn run_consumer(mut rx: mpsc::Receiver<PipelineEvent>, cancel: CancellationToken) {
    info!("Pipeline event consumer started");
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        record(&event);
    }

    // Flush whatever was published before shutdown
    while let Ok(event) = rx.try_recv() {
        record(&event);
    }
    info!("Pipeline event consumer stopped");
}

fn record(event: &PipelineEvent) {
    metrics::counter!("docpipe_events_total", "kind" => event.kind()).increment(1);

    match event {
        PipelineEvent::UploadCompleted {
            document_id,
            content_hash,
            file_size,
            duplicate,
        } => {
            if *duplicate {
                metrics::counter!("docpipe_dedup_hits_total").increment(1);
            } else {
                metrics::counter!("docpipe_stored_bytes_total").increment(*file_size);
            }
            info!(doc_id = %document_id, hash = %content_hash, size = file_size, duplicate, "Upload completed");
        }
        PipelineEvent::StageCompleted { document_id, stage } => {
            debug!(doc_id = %document_id, stage = stage.as_str(), "Stage completed");
        }
        PipelineEvent::PreprocessCompleted {
            document_id,
            chunk_count,
        } => {
            metrics::histogram!("docpipe_document_chunks").record(*chunk_count as f64);
            info!(doc_id = %document_id, chunk_count, "Preprocessing completed");
        }
        PipelineEvent::PreprocessFailed {
            document_id,
            error,
            retryable,
        } => {
            warn!(doc_id = %document_id, error = %error, retryable, "Preprocessing failed");
        }
        PipelineEvent::DocumentDeleted {
            document_id,
            object_removed,
        } => {
            info!(doc_id = %document_id, object_removed, "Document deleted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_drops_when_full() {
        let (sender, mut rx) = channel(1);
        sender.emit(PipelineEvent::StageCompleted {
            document_id: "a".to_string(),
            stage: Stage::Parse,
        });
        sender.emit(PipelineEvent::StageCompleted {
            document_id: "b".to_string(),
            stage: Stage::Clean,
        });

        match rx.try_recv().unwrap() {
            PipelineEvent::StageCompleted { document_id, .. } => assert_eq!(document_id, "a"),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(PipelineEvent::DocumentDeleted {
            document_id: "d1".to_string(),
            object_removed: true,
        })
        .unwrap();
        assert_eq!(json["type"], "document_deleted");
        assert_eq!(json["object_removed"], true);
    }

    #[tokio::test]
    async fn test_consumer_stops_on_cancel() {
        let (sender, rx) = channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_consumer(rx, cancel.clone()));

        sender.emit(PipelineEvent::PreprocessCompleted {
            document_id: "d1".to_string(),
            chunk_count: 3,
        });
        cancel.cancel();
        handle.await.unwrap();
    }
}
