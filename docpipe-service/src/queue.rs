//! In-memory processing queue.
//!
//! A bounded channel of task ids feeds a fixed pool of workers. The registry
//! keeps the authoritative `Task` for every id so status can be queried and
//! tasks cancelled while they wait or run. Failed tasks with a retryable
//! error are re-enqueued after a fixed delay; nothing here survives a
//! restart.

mod stats;
mod task;

pub use stats::QueueStats;
use stats::QueueMetrics;
pub use task::{Task, TaskStatus, TaskType};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::{ProcessingError, QueueError, ServiceError, ServiceResult};

/// Finished tasks kept in the registry for status queries
const FINISHED_TASK_RETENTION: usize = 1000;

/// Runs the work behind a task
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Execute one attempt. `cancel` fires when the task is cancelled.
    async fn execute(&self, task: &Task, cancel: &CancellationToken) -> ServiceResult<()>;

    /// Called when an attempt was abandoned at its deadline, after the
    /// execution future has been dropped.
    async fn on_timeout(&self, _task: &Task, _error: &ServiceError) {}
}

/// Queue sizing and timing
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub capacity: usize,
    pub workers: usize,
    pub task_timeout: Duration,
    pub retry_delay: Duration,
}

impl QueueOptions {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            capacity: config.capacity,
            workers: config.workers,
            task_timeout: config.task_timeout(),
            retry_delay: config.retry_delay(),
        }
    }
}

struct TaskEntry {
    task: Task,
    cancel: CancellationToken,
}

struct QueueInner {
    options: QueueOptions,
    tx: mpsc::Sender<String>,
    rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
    registry: Mutex<HashMap<String, TaskEntry>>,
    metrics: QueueMetrics,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// Bounded task queue with a worker pool
#[derive(Clone)]
pub struct ProcessingQueue {
    inner: Arc<QueueInner>,
}

impl ProcessingQueue {
    pub fn new(options: QueueOptions) -> Self {
        let (tx, rx) = mpsc::channel(options.capacity.max(1));
        let metrics = QueueMetrics::new(options.workers);
        Self {
            inner: Arc::new(QueueInner {
                options,
                tx,
                rx: tokio::sync::Mutex::new(rx),
                registry: Mutex::new(HashMap::new()),
                metrics,
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Spawn the worker pool.
    pub fn start(&self, executor: Arc<dyn TaskExecutor>) {
        for worker_id in 0..self.inner.options.workers {
            let inner = self.inner.clone();
            let executor = executor.clone();
            self.inner
                .tracker
                .spawn(async move { inner.worker_loop(worker_id, executor).await });
        }
        info!(
            workers = self.inner.options.workers,
            capacity = self.inner.options.capacity,
            "Processing queue started"
        );
    }

    /// Enqueue a task without waiting for channel space.
    pub fn add_task(&self, task: Task) -> ServiceResult<Task> {
        if self.inner.shutdown.is_cancelled() {
            return Err(QueueError::ShuttingDown.into());
        }

        let id = task.id.clone();
        {
            let mut registry = self.inner.registry();
            prune_finished(&mut registry);
            registry.insert(
                id.clone(),
                TaskEntry {
                    task: task.clone(),
                    cancel: CancellationToken::new(),
                },
            );
        }

        match self.inner.tx.try_send(id.clone()) {
            Ok(()) => {
                self.inner.metrics.record_enqueued();
                debug!(task_id = %id, task_type = %task.task_type, doc_id = %task.document_id, "Task enqueued");
                Ok(task)
            }
            Err(e) => {
                self.inner.registry().remove(&id);
                Err(match e {
                    mpsc::error::TrySendError::Full(_) => QueueError::QueueFull {
                        capacity: self.inner.options.capacity,
                    },
                    mpsc::error::TrySendError::Closed(_) => QueueError::ShuttingDown,
                }
                .into())
            }
        }
    }

    pub fn get_task(&self, id: &str) -> ServiceResult<Task> {
        self.inner
            .registry()
            .get(id)
            .map(|entry| entry.task.clone())
            .ok_or_else(|| ServiceError::TaskNotFound {
                task_id: id.to_string(),
            })
    }

    /// Cancel a pending or running task.
    ///
    /// A pending task is failed immediately and skipped when dequeued. A
    /// running task stops at its next cancellation check.
    pub fn cancel_task(&self, id: &str) -> ServiceResult<Task> {
        let mut registry = self.inner.registry();
        let entry = registry.get_mut(id).ok_or_else(|| ServiceError::TaskNotFound {
            task_id: id.to_string(),
        })?;

        match entry.task.status {
            TaskStatus::Pending => {
                entry.task.fail("cancelled");
                entry.cancel.cancel();
                info!(task_id = %id, "Pending task cancelled");
            }
            TaskStatus::Processing => {
                entry.cancel.cancel();
                info!(task_id = %id, "Cancellation requested for running task");
            }
            TaskStatus::Completed | TaskStatus::Failed => {
                return Err(ServiceError::InvalidRequest {
                    message: format!("Task {id} has already finished"),
                });
            }
        }

        Ok(entry.task.clone())
    }

    pub fn stats(&self) -> QueueStats {
        let capacity = self.inner.options.capacity;
        let depth = self.inner.tx.max_capacity() - self.inner.tx.capacity();
        let tracked = self.inner.registry().len();
        self.inner.metrics.snapshot(capacity, depth, tracked)
    }

    /// Stop pulling work and wait for in-flight tasks and pending retry timers.
    pub async fn stop(&self) {
        info!("Stopping processing queue");
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("Processing queue stopped");
    }
}

impl QueueInner {
    fn registry(&self) -> MutexGuard<'_, HashMap<String, TaskEntry>> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, executor: Arc<dyn TaskExecutor>) {
        debug!(worker_id, "Queue worker started");
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => None,
                id = async { self.rx.lock().await.recv().await } => id,
            };
            let Some(task_id) = next else {
                break;
            };
            self.run_task(&task_id, executor.as_ref()).await;
        }
        debug!(worker_id, "Queue worker stopped");
    }

    async fn run_task(self: &Arc<Self>, task_id: &str, executor: &dyn TaskExecutor) {
        let claimed = {
            let mut registry = self.registry();
            match registry.get_mut(task_id) {
                Some(entry) if entry.task.status == TaskStatus::Pending => {
                    entry.task.start();
                    Some((entry.task.clone(), entry.cancel.clone()))
                }
                Some(entry) => {
                    debug!(task_id, status = %entry.task.status, "Skipping task that is no longer pending");
                    None
                }
                None => None,
            }
        };
        let Some((task, cancel)) = claimed else {
            return;
        };

        info!(task_id, task_type = %task.task_type, doc_id = %task.document_id, attempt = task.retries + 1, "Task started");
        self.metrics.worker_started();

        let timeout = self.options.task_timeout;
        let result = match tokio::time::timeout(timeout, executor.execute(&task, &cancel)).await {
            Ok(result) => result,
            Err(_) => {
                let err = ServiceError::Processing(ProcessingError::Timeout {
                    seconds: timeout.as_secs(),
                });
                executor.on_timeout(&task, &err).await;
                Err(err)
            }
        };

        self.metrics.worker_finished();

        let mut registry = self.registry();
        let Some(entry) = registry.get_mut(task_id) else {
            return;
        };

        match result {
            Ok(()) => {
                entry.task.complete();
                let duration = entry.task.duration().unwrap_or_default();
                self.metrics.record_completed(duration);
                info!(task_id, elapsed_ms = duration.as_millis() as u64, "Task completed");
            }
            Err(e) => {
                let message = e.to_string();
                entry.task.fail(message.clone());
                let duration = entry.task.duration().unwrap_or_default();

                let retryable = e.is_retryable() && !cancel.is_cancelled();
                if retryable && entry.task.prepare_retry() {
                    // Only the final attempt counts as a failure
                    self.metrics.record_retry(duration);
                    warn!(
                        task_id,
                        error = %message,
                        retry = entry.task.retries,
                        max_retries = entry.task.max_retries,
                        delay_secs = self.options.retry_delay.as_secs_f64(),
                        "Task failed, scheduling retry"
                    );
                    drop(registry);
                    self.schedule_retry(task_id.to_string(), message);
                } else {
                    self.metrics.record_failed(duration);
                    error!(task_id, error = %message, retryable, retries = entry.task.retries, "Task failed");
                }
            }
        }
    }

    /// Re-enqueue a task after the retry delay on a separately tracked path.
    fn schedule_retry(self: &Arc<Self>, task_id: String, last_error: String) {
        let inner = self.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = inner.shutdown.cancelled() => {
                    inner.abandon(&task_id, &last_error);
                    return;
                }
                _ = tokio::time::sleep(inner.options.retry_delay) => {}
            }

            let still_pending = inner
                .registry()
                .get(&task_id)
                .is_some_and(|entry| entry.task.status == TaskStatus::Pending);
            if !still_pending {
                return;
            }

            match inner.tx.try_send(task_id.clone()) {
                Ok(()) => {
                    inner.metrics.record_enqueued();
                    debug!(task_id = %task_id, "Task re-enqueued for retry");
                }
                Err(_) => {
                    inner.metrics.record_dropped();
                    warn!(task_id = %task_id, "Queue full at retry time, dropping task");
                    inner.abandon(&task_id, &last_error);
                }
            }
        });
    }

    /// Leave a task failed with its last error; no further retries.
    /// Give up on a task waiting for its retry.
    fn abandon(&self, task_id: &str, last_error: &str) {
        if let Some(entry) = self.registry().get_mut(task_id) {
            if !entry.task.is_finished() {
                self.metrics.record_abandoned();
            }
            entry.task.fail(last_error);
        }
    }
}

/// Drop the oldest finished tasks once the registry holds too many.
fn prune_finished(registry: &mut HashMap<String, TaskEntry>) {
    let mut finished: Vec<(chrono::DateTime<chrono::Utc>, String)> = registry
        .iter()
        .filter(|(_, entry)| entry.task.is_finished())
        .map(|(id, entry)| (entry.task.completed_at.unwrap_or(entry.task.created_at), id.clone()))
        .collect();
    if finished.len() <= FINISHED_TASK_RETENTION {
        return;
    }
    finished.sort();
    let excess = finished.len() - FINISHED_TASK_RETENTION;
    for (_, id) in finished.into_iter().take(excess) {
        registry.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        Transient,
        FailOnce,
        Terminal,
        WaitForCancel,
        Hang,
    }

    struct FakeExecutor {
        behavior: Behavior,
        attempts: AtomicU32,
        timeouts: AtomicU32,
    }

    impl FakeExecutor {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                attempts: AtomicU32::new(0),
                timeouts: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl TaskExecutor for FakeExecutor {
        async fn execute(&self, task: &Task, cancel: &CancellationToken) -> ServiceResult<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Succeed => Ok(()),
                Behavior::FailOnce if attempt > 0 => Ok(()),
                Behavior::Transient | Behavior::FailOnce => Err(StorageError::Connection {
                    message: "connection refused".to_string(),
                }
                .into()),
                Behavior::Terminal => Err(ProcessingError::UnsupportedFormat {
                    format: "application/zip".to_string(),
                }
                .into()),
                Behavior::WaitForCancel => {
                    cancel.cancelled().await;
                    Err(ProcessingError::Cancelled {
                        document_id: task.document_id.clone(),
                    }
                    .into())
                }
                Behavior::Hang => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
            }
        }

        async fn on_timeout(&self, _task: &Task, _error: &ServiceError) {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn options(capacity: usize, workers: usize) -> QueueOptions {
        QueueOptions {
            capacity,
            workers,
            task_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_millis(10),
        }
    }

    async fn wait_until_finished(queue: &ProcessingQueue, id: &str) -> Task {
        for _ in 0..500 {
            let task = queue.get_task(id).unwrap();
            if task.is_finished() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} did not finish");
    }

    #[tokio::test]
    async fn test_queue_full_does_not_block() {
        let queue = ProcessingQueue::new(options(1, 1));
        queue.add_task(Task::new(TaskType::Process, "a")).unwrap();

        let err = queue.add_task(Task::new(TaskType::Process, "b")).unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Queue(QueueError::QueueFull { capacity: 1 })
        ));
        assert_eq!(queue.stats().depth, 1);
        assert_eq!(queue.stats().tracked_tasks, 1);
    }

    #[tokio::test]
    async fn test_successful_task() {
        let queue = ProcessingQueue::new(options(10, 2));
        let executor = FakeExecutor::new(Behavior::Succeed);
        queue.start(executor.clone());

        let task = queue.add_task(Task::new(TaskType::Process, "doc")).unwrap();
        let done = wait_until_finished(&queue, &task.id).await;

        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(executor.attempts.load(Ordering::SeqCst), 1);
        let stats = queue.stats();
        assert_eq!(stats.total_completed, 1);
        assert_eq!(stats.success_rate, 1.0);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_retryable_failure_runs_max_retries_plus_one() {
        let queue = ProcessingQueue::new(options(10, 1));
        let executor = FakeExecutor::new(Behavior::Transient);
        queue.start(executor.clone());

        let task = queue.add_task(Task::new(TaskType::Process, "doc")).unwrap();
        let done = wait_until_finished(&queue, &task.id).await;

        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.retries, Task::MAX_RETRIES);
        assert_eq!(executor.attempts.load(Ordering::SeqCst), Task::MAX_RETRIES + 1);
        let stats = queue.stats();
        assert_eq!(stats.total_retried, u64::from(Task::MAX_RETRIES));
        assert_eq!(stats.total_failed, 1);
        assert_eq!(stats.success_rate, 0.0);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_recovered_task_counts_as_success() {
        let queue = ProcessingQueue::new(options(10, 1));
        let executor = FakeExecutor::new(Behavior::FailOnce);
        queue.start(executor.clone());

        let task = queue.add_task(Task::new(TaskType::Process, "doc")).unwrap();
        let done = wait_until_finished(&queue, &task.id).await;

        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.retries, 1);
        assert_eq!(executor.attempts.load(Ordering::SeqCst), 2);
        let stats = queue.stats();
        assert_eq!(stats.total_completed, 1);
        assert_eq!(stats.total_retried, 1);
        assert_eq!(stats.total_failed, 0);
        assert_eq!(stats.success_rate, 1.0);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_terminal_failure_is_not_retried() {
        let queue = ProcessingQueue::new(options(10, 1));
        let executor = FakeExecutor::new(Behavior::Terminal);
        queue.start(executor.clone());

        let task = queue.add_task(Task::new(TaskType::Process, "doc")).unwrap();
        let done = wait_until_finished(&queue, &task.id).await;

        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.retries, 0);
        assert!(done.error.unwrap().contains("Unsupported file format"));
        assert_eq!(executor.attempts.load(Ordering::SeqCst), 1);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_pending_task_is_skipped() {
        let queue = ProcessingQueue::new(options(10, 1));
        let task = queue.add_task(Task::new(TaskType::Process, "doc")).unwrap();

        let cancelled = queue.cancel_task(&task.id).unwrap();
        assert_eq!(cancelled.status, TaskStatus::Failed);
        assert_eq!(cancelled.error.as_deref(), Some("cancelled"));

        let executor = FakeExecutor::new(Behavior::Succeed);
        queue.start(executor.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(executor.attempts.load(Ordering::SeqCst), 0);
        assert_eq!(queue.get_task(&task.id).unwrap().status, TaskStatus::Failed);
        assert!(queue.cancel_task(&task.id).is_err());
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_running_task() {
        let queue = ProcessingQueue::new(options(10, 1));
        let executor = FakeExecutor::new(Behavior::WaitForCancel);
        queue.start(executor.clone());

        let task = queue.add_task(Task::new(TaskType::Process, "doc")).unwrap();
        for _ in 0..500 {
            if queue.get_task(&task.id).unwrap().status == TaskStatus::Processing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        queue.cancel_task(&task.id).unwrap();

        let done = wait_until_finished(&queue, &task.id).await;
        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.retries, 0);
        assert_eq!(executor.attempts.load(Ordering::SeqCst), 1);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let mut opts = options(10, 1);
        opts.task_timeout = Duration::from_millis(20);
        let queue = ProcessingQueue::new(opts);
        let executor = FakeExecutor::new(Behavior::Hang);
        queue.start(executor.clone());

        let task = queue.add_task(Task::new(TaskType::Process, "doc")).unwrap();
        let done = wait_until_finished(&queue, &task.id).await;

        assert_eq!(done.status, TaskStatus::Failed);
        assert!(done.error.unwrap().contains("timed out"));
        assert_eq!(executor.attempts.load(Ordering::SeqCst), Task::MAX_RETRIES + 1);
        assert_eq!(executor.timeouts.load(Ordering::SeqCst), Task::MAX_RETRIES + 1);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_add_after_stop_fails() {
        let queue = ProcessingQueue::new(options(10, 1));
        queue.start(FakeExecutor::new(Behavior::Succeed));
        queue.stop().await;

        let err = queue.add_task(Task::new(TaskType::Process, "doc")).unwrap_err();
        assert!(matches!(err, ServiceError::Queue(QueueError::ShuttingDown)));
    }

    #[test]
    fn test_unknown_task() {
        let queue = ProcessingQueue::new(options(1, 1));
        assert!(matches!(
            queue.get_task("nope"),
            Err(ServiceError::TaskNotFound { .. })
        ));
    }
}
