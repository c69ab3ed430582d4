//! Queue counters and the stats snapshot.
//!
//! Counters are atomics so workers never contend on them; only the rolling
//! duration window sits behind a mutex. Every update is mirrored to the
//! `metrics` facade for the Prometheus exporter.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Runs kept for the rolling average duration
const DURATION_WINDOW: usize = 100;

pub struct QueueMetrics {
    started: Instant,
    total_workers: usize,
    active_workers: AtomicUsize,
    enqueued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
    durations: Mutex<VecDeque<Duration>>,
}

/// Point-in-time view of the queue
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub capacity: usize,
    pub depth: usize,
    pub total_workers: usize,
    pub active_workers: usize,
    pub tracked_tasks: usize,
    pub total_enqueued: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_retried: u64,
    pub total_dropped: u64,
    pub avg_duration_ms: f64,
    /// completed / (completed + failed) over tasks, not attempts; 0 before anything finished
    pub success_rate: f64,
    pub failure_rate: f64,
    /// Completed tasks per second since the queue started
    pub throughput_per_sec: f64,
    pub uptime_secs: u64,
}

impl QueueMetrics {
    pub fn new(total_workers: usize) -> Self {
        metrics::gauge!("docpipe_queue_workers_total").set(total_workers as f64);
        Self {
            started: Instant::now(),
            total_workers,
            active_workers: AtomicUsize::new(0),
            enqueued: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            durations: Mutex::new(VecDeque::with_capacity(DURATION_WINDOW)),
        }
    }

    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("docpipe_queue_enqueued_total").increment(1);
    }

    /// A failed attempt that will run again. Its time counts, its failure does not.
    pub fn record_retry(&self, duration: Duration) {
        self.retried.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("docpipe_queue_retried_total").increment(1);
        self.record_duration(duration);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("docpipe_queue_dropped_total").increment(1);
    }

    pub fn worker_started(&self) {
        let active = self.active_workers.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!("docpipe_queue_active_workers").set(active as f64);
    }

    pub fn worker_finished(&self) {
        let active = self
            .active_workers
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        metrics::gauge!("docpipe_queue_active_workers").set(active as f64);
    }

    pub fn record_completed(&self, duration: Duration) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("docpipe_queue_completed_total").increment(1);
        self.record_duration(duration);
    }

    /// A task that ended failed after its last attempt
    pub fn record_failed(&self, duration: Duration) {
        self.record_abandoned();
        self.record_duration(duration);
    }

    /// A task that ended failed without running again, e.g. a retry dropped at shutdown
    pub fn record_abandoned(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("docpipe_queue_failed_total").increment(1);
    }

    fn record_duration(&self, duration: Duration) {
        metrics::histogram!("docpipe_task_duration_seconds").record(duration.as_secs_f64());
        if let Ok(mut window) = self.durations.lock() {
            if window.len() == DURATION_WINDOW {
                window.pop_front();
            }
            window.push_back(duration);
        }
    }

    pub fn snapshot(&self, capacity: usize, depth: usize, tracked_tasks: usize) -> QueueStats {
        metrics::gauge!("docpipe_queue_depth").set(depth as f64);

        let completed = self.completed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let finished = completed + failed;

        let avg_duration_ms = self
            .durations
            .lock()
            .ok()
            .filter(|window| !window.is_empty())
            .map(|window| {
                let total: Duration = window.iter().sum();
                total.as_secs_f64() * 1000.0 / window.len() as f64
            })
            .unwrap_or(0.0);

        let (success_rate, failure_rate) = if finished == 0 {
            (0.0, 0.0)
        } else {
            (
                completed as f64 / finished as f64,
                failed as f64 / finished as f64,
            )
        };

        let elapsed = self.started.elapsed();
        let throughput_per_sec = if elapsed.as_secs_f64() > 0.0 {
            completed as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        QueueStats {
            capacity,
            depth,
            total_workers: self.total_workers,
            active_workers: self.active_workers.load(Ordering::Relaxed),
            tracked_tasks,
            total_enqueued: self.enqueued.load(Ordering::Relaxed),
            total_completed: completed,
            total_failed: failed,
            total_retried: self.retried.load(Ordering::Relaxed),
            total_dropped: self.dropped.load(Ordering::Relaxed),
            avg_duration_ms,
            success_rate,
            failure_rate,
            throughput_per_sec,
            uptime_secs: elapsed.as_secs(),
        }
    }
}
