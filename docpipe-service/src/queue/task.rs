//! Task value type and its state machine.
//!
//! ```text
//! pending -> processing -> completed
//!                       \-> failed -> pending   (retry, while retries < max_retries)
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Kind of work a task performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Run the preprocessing pipeline, resuming from persisted stages
    Process,
    /// Discard previous outputs and preprocess from the first stage
    Reprocess,
    /// Process several documents in sequence
    Batch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// One unit of asynchronous work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: TaskType,
    pub document_id: String,
    /// Further documents handled by a batch task
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_document_ids: Vec<String>,
    pub status: TaskStatus,
    /// Recorded for callers; dequeue order is FIFO
    pub priority: i32,
    pub retries: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Task {
    pub const MAX_RETRIES: u32 = 3;

    pub fn new(task_type: TaskType, document_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_type,
            document_id: document_id.into(),
            extra_document_ids: Vec::new(),
            status: TaskStatus::Pending,
            priority: 0,
            retries: 0,
            max_retries: Self::MAX_RETRIES,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Batch task over `document_ids`; `None` when the list is empty.
    pub fn batch(document_ids: Vec<String>) -> Option<Self> {
        let mut ids = document_ids.into_iter();
        let first = ids.next()?;
        let mut task = Self::new(TaskType::Batch, first);
        task.extra_document_ids = ids.collect();
        Some(task)
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Every document this task covers, primary first
    pub fn document_ids(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.document_id.as_str())
            .chain(self.extra_document_ids.iter().map(String::as_str))
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// pending -> processing
    pub fn start(&mut self) {
        self.status = TaskStatus::Processing;
        self.started_at = Some(Utc::now());
        self.completed_at = None;
        self.error = None;
    }

    /// processing -> completed
    pub fn complete(&mut self) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.error = None;
    }

    /// Any state -> failed
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(error.into());
    }

    fn can_retry(&self) -> bool {
        self.status == TaskStatus::Failed && self.retries < self.max_retries
    }

    /// failed -> pending, consuming one retry. Returns false when the budget is spent.
    pub fn prepare_retry(&mut self) -> bool {
        if !self.can_retry() {
            return false;
        }
        self.retries += 1;
        self.status = TaskStatus::Pending;
        self.started_at = None;
        self.completed_at = None;
        self.error = None;
        true
    }

    /// Wall-clock time of the last run, once it has finished
    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let finished = self.completed_at?;
        (finished - started).to_std().ok()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_lifecycle() {
        let mut task = Task::new(TaskType::Process, "doc-1");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.max_retries, 3);
        assert!(!task.is_finished());

        task.start();
        assert_eq!(task.status, TaskStatus::Processing);
        assert!(task.started_at.is_some());

        task.complete();
        assert!(task.is_finished());
        assert!(task.duration().is_some());
        assert!(!task.can_retry());
    }

    #[test]
    fn test_retry_budget() {
        let mut task = Task::new(TaskType::Process, "doc-1");
        for attempt in 1..=3 {
            task.start();
            task.fail("boom");
            assert!(task.prepare_retry(), "retry {attempt} should be allowed");
            assert_eq!(task.retries, attempt);
            assert_eq!(task.status, TaskStatus::Pending);
            assert!(task.error.is_none());
            assert!(task.started_at.is_none());
        }

        task.start();
        task.fail("boom");
        assert!(!task.prepare_retry());
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_batch_documents() {
        assert!(Task::batch(Vec::new()).is_none());

        let task = Task::batch(vec!["a".into(), "b".into(), "c".into()]).unwrap();
        assert_eq!(task.task_type, TaskType::Batch);
        assert_eq!(task.document_ids().collect::<Vec<_>>(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_enum_strings() {
        assert_eq!(TaskType::Reprocess.to_string(), "reprocess");
        assert_eq!(TaskStatus::from_str("processing").unwrap(), TaskStatus::Processing);
        assert_eq!(
            serde_json::to_value(TaskStatus::Completed).unwrap(),
            serde_json::json!("completed")
        );
    }
}
