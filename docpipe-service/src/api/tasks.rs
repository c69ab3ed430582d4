//! Task status, cancellation and queue statistics endpoints.

use axum::{
    Json,
    extract::{Path, State},
};
use std::sync::Arc;

use crate::error::ServiceResult;
use crate::queue::{QueueStats, Task};

use super::AppState;

pub async fn get_task_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ServiceResult<Json<Task>> {
    Ok(Json(state.queue.get_task(&id)?))
}

/// Cancel a pending or running task
pub async fn cancel_task_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ServiceResult<Json<Task>> {
    Ok(Json(state.queue.cancel_task(&id)?))
}

pub async fn queue_stats_handler(State(state): State<Arc<AppState>>) -> Json<QueueStats> {
    Json(state.queue.stats())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support;
    use crate::error::ServiceError;
    use crate::queue::{TaskStatus, TaskType};

    #[tokio::test]
    async fn test_cancel_pending_task() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_support::state(dir.path());
        let task = state
            .queue
            .add_task(Task::new(TaskType::Process, "doc-1"))
            .unwrap();

        let Json(stats) = queue_stats_handler(State(state.clone())).await;
        assert_eq!(stats.depth, 1);
        assert_eq!(stats.total_enqueued, 1);

        let Json(cancelled) = cancel_task_handler(State(state.clone()), Path(task.id.clone()))
            .await
            .unwrap();
        assert_eq!(cancelled.status, TaskStatus::Failed);

        let Json(fetched) = get_task_handler(State(state.clone()), Path(task.id.clone()))
            .await
            .unwrap();
        assert_eq!(fetched.error.as_deref(), Some("cancelled"));

        // Finished tasks cannot be cancelled again
        assert!(matches!(
            cancel_task_handler(State(state.clone()), Path(task.id)).await,
            Err(ServiceError::InvalidRequest { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_support::state(dir.path());

        assert!(matches!(
            get_task_handler(State(state), Path("nope".to_string())).await,
            Err(ServiceError::TaskNotFound { .. })
        ));
    }
}
