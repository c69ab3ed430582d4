//! Resumable upload session endpoints.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ServiceResult;
use crate::queue::Task;
use crate::service::{ChunkReceipt, InitUploadOutcome, UploadProgress};

use super::AppState;
use super::documents::UploadResponse;

#[derive(Deserialize)]
pub struct InitUploadRequest {
    pub file_name: String,
    pub file_size: u64,
    pub content_hash: String,
    pub mime_type: Option<String>,
}

#[derive(Serialize)]
pub struct InitUploadResponse {
    #[serde(flatten)]
    pub outcome: InitUploadOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,
}

#[derive(Serialize)]
pub struct AbortResponse {
    pub success: bool,
}

/// Start a chunked upload, or resolve it immediately as a duplicate
pub async fn init_upload_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<InitUploadRequest>,
) -> ServiceResult<Json<InitUploadResponse>> {
    let outcome = state
        .service
        .init_upload(
            &request.file_name,
            request.file_size,
            &request.content_hash,
            request.mime_type.as_deref(),
        )
        .await?;

    let task = match &outcome {
        InitUploadOutcome::Duplicate { document } => state.enqueue_after_upload(&document.id),
        InitUploadOutcome::Session { .. } => None,
    };
    Ok(Json(InitUploadResponse { outcome, task }))
}

pub async fn upload_chunk_handler(
    State(state): State<Arc<AppState>>,
    Path((session_id, index)): Path<(String, u32)>,
    body: Bytes,
) -> ServiceResult<Json<ChunkReceipt>> {
    let receipt = state.service.upload_chunk(&session_id, index, body).await?;
    Ok(Json(receipt))
}

pub async fn upload_progress_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ServiceResult<Json<UploadProgress>> {
    Ok(Json(state.service.get_upload_progress(&session_id).await?))
}

/// Assemble the received chunks into a stored document
pub async fn complete_upload_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ServiceResult<Json<UploadResponse>> {
    let stored = state.service.complete_upload(&session_id).await?;
    let task = state.enqueue_after_upload(&stored.document.id);
    Ok(Json(UploadResponse {
        document: stored.document,
        duplicate: stored.duplicate,
        task,
    }))
}

pub async fn abort_upload_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ServiceResult<Json<AbortResponse>> {
    state.service.abort_upload(&session_id).await?;
    Ok(Json(AbortResponse { success: true }))
}
