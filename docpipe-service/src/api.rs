//! HTTP API for the docpipe service.
//!
//! This module provides the REST API endpoints for:
//! - Health and metrics monitoring
//! - Document upload, lookup and deletion
//! - Resumable upload sessions
//! - Preprocessing tasks and queue statistics

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post, put},
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::queue::{ProcessingQueue, Task, TaskType};
use crate::service::DocpipeService;
use crate::storage::BackendKind;

pub mod documents;
pub mod tasks;
pub mod uploads;

use documents::{
    batch_preprocess_handler, check_duplicate_handler, delete_document_handler,
    get_document_handler, get_status_handler, list_chunks_handler, list_documents_handler,
    preprocess_document_handler, upload_document_handler,
};
use tasks::{cancel_task_handler, get_task_handler, queue_stats_handler};
use uploads::{
    abort_upload_handler, complete_upload_handler, init_upload_handler, upload_chunk_handler,
    upload_progress_handler,
};

/// Application state
pub struct AppState {
    pub service: Arc<DocpipeService>,
    pub queue: ProcessingQueue,
    pub prometheus: Option<PrometheusHandle>,
    pub start_time: Instant,
}

impl AppState {
    /// Queue preprocessing for a freshly stored document when auto-enqueue is on.
    ///
    /// The upload already succeeded, so a full queue is logged rather than
    /// reported as a request failure.
    pub fn enqueue_after_upload(&self, document_id: &str) -> Option<Task> {
        if !self.service.config.preprocess.auto_enqueue {
            return None;
        }
        match self.queue.add_task(Task::new(TaskType::Process, document_id)) {
            Ok(task) => Some(task),
            Err(e) => {
                warn!(doc_id = %document_id, error = %e, "Could not enqueue preprocessing");
                None
            }
        }
    }
}

/// Build the API router
pub fn router(state: Arc<AppState>) -> Router {
    let config = &state.service.config;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let max_document_size = config.limits.max_document_size_bytes as usize;
    // Leave room for multipart framing around the file
    let max_upload_body = max_document_size.saturating_add(64 * 1024);
    let max_chunk_body = config.upload.chunk_size_bytes as usize;

    let api_routes = Router::new()
        // Document endpoints
        .route("/documents", get(list_documents_handler))
        .route("/documents/check", post(check_duplicate_handler))
        .route(
            "/documents/upload",
            post(upload_document_handler).layer(DefaultBodyLimit::max(max_upload_body)),
        )
        .route("/documents/preprocess/batch", post(batch_preprocess_handler))
        .route(
            "/documents/{id}",
            get(get_document_handler).delete(delete_document_handler),
        )
        .route("/documents/{id}/chunks", get(list_chunks_handler))
        .route("/documents/{id}/preprocess", post(preprocess_document_handler))
        .route("/documents/{id}/status", get(get_status_handler))
        // Upload session endpoints
        .route("/uploads/init", post(init_upload_handler))
        .route(
            "/uploads/{session}/chunks/{index}",
            put(upload_chunk_handler).layer(DefaultBodyLimit::max(max_chunk_body)),
        )
        .route("/uploads/{session}/complete", post(complete_upload_handler))
        .route("/uploads/{session}/progress", get(upload_progress_handler))
        .route("/uploads/{session}", axum::routing::delete(abort_upload_handler))
        // Task endpoints
        .route("/tasks/{id}/status", get(get_task_handler))
        .route("/tasks/{id}/cancel", post(cancel_task_handler))
        .route("/queue/stats", get(queue_stats_handler));

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .nest("/api", api_routes)
        .layer(cors)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.server.request_timeout(),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// === Health & Metrics ===

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let database_available = state.service.db.list_documents(1, 0).is_ok();
    let stats = state.queue.stats();

    Json(HealthResponse {
        status: if database_available { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        database_available,
        storage_backend: state.service.store.kind(),
        queue_depth: stats.depth,
        active_workers: stats.active_workers,
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: String,
    uptime_seconds: u64,
    database_available: bool,
    storage_backend: BackendKind,
    queue_depth: usize,
    active_workers: usize,
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    // Refresh queue gauges before rendering
    state.queue.stats();

    let body = state
        .prometheus
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default();

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}
