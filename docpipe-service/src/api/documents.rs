//! Document API endpoints.
//!
//! Handlers for direct uploads, duplicate checks, listing, deletion and
//! preprocessing requests.

use axum::{
    Json,
    extract::{Multipart, Path, Query, State},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::{Document, DocumentChunk, ProcessingStatus};
use crate::error::{ServiceError, ServiceResult};
use crate::queue::{Task, TaskType};

use super::AppState;

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 500;

/// List documents query parameters
#[derive(Deserialize)]
pub struct ListDocumentsParams {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Deserialize)]
pub struct CheckDuplicateParams {
    pub hash: String,
    pub size: u64,
}

#[derive(Serialize)]
pub struct CheckDuplicateResponse {
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<Document>,
}

/// Response for a stored upload, with the preprocessing task if one was queued
#[derive(Serialize)]
pub struct UploadResponse {
    pub document: Document,
    pub duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,
}

/// Response for delete operations
#[derive(Serialize)]
pub struct DeleteResponse {
    pub success: bool,
    pub object_removed: bool,
}

#[derive(Deserialize)]
pub struct PreprocessParams {
    #[serde(default)]
    pub reprocess: bool,
    pub priority: Option<i32>,
}

#[derive(Deserialize)]
pub struct BatchPreprocessRequest {
    pub document_ids: Vec<String>,
}

/// List documents, newest first
pub async fn list_documents_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListDocumentsParams>,
) -> ServiceResult<Json<Vec<Document>>> {
    let limit = params.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE);
    let offset = params.offset.unwrap_or(0);
    let documents = state.service.list_documents(limit, offset)?;
    Ok(Json(documents))
}

/// Check whether content with this fingerprint is already stored
pub async fn check_duplicate_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CheckDuplicateParams>,
) -> ServiceResult<Json<CheckDuplicateResponse>> {
    let document = state.service.check_duplicate(&params.hash, params.size)?;
    Ok(Json(CheckDuplicateResponse {
        exists: document.is_some(),
        document,
    }))
}

/// Upload a whole document in a single multipart request
pub async fn upload_document_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> ServiceResult<Json<UploadResponse>> {
    let mut file: Option<(bytes::Bytes, String, Option<String>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServiceError::InvalidRequest {
            message: e.to_string(),
        })?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("document").to_string();
        let mime_type = field.content_type().and_then(normalize_mime);
        let data = field.bytes().await.map_err(|e| ServiceError::InvalidRequest {
            message: e.to_string(),
        })?;
        file = Some((data, file_name, mime_type));
    }

    let (data, file_name, mime_type) = file.ok_or_else(|| ServiceError::InvalidRequest {
        message: "No file provided".to_string(),
    })?;

    let stored = state
        .service
        .upload_document(&file_name, data, mime_type.as_deref())
        .await?;
    let task = state.enqueue_after_upload(&stored.document.id);

    Ok(Json(UploadResponse {
        document: stored.document,
        duplicate: stored.duplicate,
        task,
    }))
}

pub async fn get_document_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ServiceResult<Json<Document>> {
    Ok(Json(state.service.get_document(&id)?))
}

pub async fn delete_document_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ServiceResult<Json<DeleteResponse>> {
    let object_removed = state.service.delete_document(&id).await?;
    Ok(Json(DeleteResponse {
        success: true,
        object_removed,
    }))
}

pub async fn list_chunks_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ServiceResult<Json<Vec<DocumentChunk>>> {
    Ok(Json(state.service.list_chunks(&id)?))
}

pub async fn get_status_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ServiceResult<Json<ProcessingStatus>> {
    Ok(Json(state.service.get_status(&id)?))
}

/// Queue preprocessing for one document
pub async fn preprocess_document_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<PreprocessParams>,
) -> ServiceResult<Json<Task>> {
    state.service.get_document(&id)?;

    let task_type = if params.reprocess {
        TaskType::Reprocess
    } else {
        TaskType::Process
    };
    let task = Task::new(task_type, id).with_priority(params.priority.unwrap_or_default());
    let task = state.queue.add_task(task)?;
    Ok(Json(task))
}

/// Queue one task covering several documents
pub async fn batch_preprocess_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BatchPreprocessRequest>,
) -> ServiceResult<Json<Task>> {
    for id in &request.document_ids {
        state.service.get_document(id)?;
    }

    let task = Task::batch(request.document_ids).ok_or_else(|| ServiceError::InvalidRequest {
        message: "document_ids must not be empty".to_string(),
    })?;
    Ok(Json(state.queue.add_task(task)?))
}

/// Reduce a declared content type to its bare essence, dropping parameters.
fn normalize_mime(content_type: &str) -> Option<String> {
    content_type
        .parse::<mime::Mime>()
        .ok()
        .map(|m| m.essence_str().to_string())
}
