//! Process-wide runtime state.
//!
//! Created once at startup and shared by reference with the dispatch queue,
//! the workers and the sweep loop. All fields are atomics, so status updates
//! never take a lock.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// What a worker is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum WorkerStatus {
    /// Blocked on the dispatch queue.
    Waiting = 0,
    /// Serving an inbound HTTP connection.
    HandlingConnection = 1,
    /// Running a queued federation job.
    ProcessingQueueJob = 2,
    /// Exited its loop.
    Stopped = 3,
}

impl WorkerStatus {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Waiting,
            1 => Self::HandlingConnection,
            2 => Self::ProcessingQueueJob,
            _ => Self::Stopped,
        }
    }
}

/// Shared server state.
#[derive(Debug)]
pub struct ServerState {
    running: AtomicBool,
    started_at: DateTime<Utc>,
    workers: Vec<AtomicU8>,
    queue_depth: AtomicUsize,
    peak_queue_depth: AtomicUsize,
    delivered: AtomicU64,
    rescheduled: AtomicU64,
    abandoned: AtomicU64,
    failed: AtomicU64,
}

impl ServerState {
    /// Create the state for `worker_count` workers, all `Waiting`.
    #[must_use]
    pub fn new(worker_count: usize) -> Self {
        Self {
            running: AtomicBool::new(true),
            started_at: Utc::now(),
            workers: (0..worker_count)
                .map(|_| AtomicU8::new(WorkerStatus::Waiting as u8))
                .collect(),
            queue_depth: AtomicUsize::new(0),
            peak_queue_depth: AtomicUsize::new(0),
            delivered: AtomicU64::new(0),
            rescheduled: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Whether the server is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Mark the server as stopping.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Number of configured workers.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Announce a worker's state transition. Unknown indices are ignored.
    pub fn set_worker_status(&self, worker: usize, status: WorkerStatus) {
        if let Some(slot) = self.workers.get(worker) {
            slot.store(status as u8, Ordering::Relaxed);
        }
    }

    /// Current status of a worker.
    #[must_use]
    pub fn worker_status(&self, worker: usize) -> Option<WorkerStatus> {
        self.workers
            .get(worker)
            .map(|slot| WorkerStatus::from_u8(slot.load(Ordering::Relaxed)))
    }

    /// Record the dispatch queue depth and update the peak.
    pub fn record_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth, Ordering::Relaxed);
        self.peak_queue_depth.fetch_max(depth, Ordering::Relaxed);
    }

    /// Current dispatch queue depth.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    /// Highest dispatch queue depth seen.
    #[must_use]
    pub fn peak_queue_depth(&self) -> usize {
        self.peak_queue_depth.load(Ordering::Relaxed)
    }

    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rescheduled(&self) {
        self.rescheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy for status reporting.
    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        let now = Utc::now();
        StateSnapshot {
            running: self.is_running(),
            started_at: self.started_at,
            uptime_secs: (now - self.started_at).num_seconds().max(0) as u64,
            worker_count: self.worker_count(),
            workers: (0..self.worker_count())
                .filter_map(|i| self.worker_status(i))
                .collect(),
            queue_depth: self.queue_depth(),
            peak_queue_depth: self.peak_queue_depth(),
            jobs: JobCounters {
                delivered: self.delivered.load(Ordering::Relaxed),
                rescheduled: self.rescheduled.load(Ordering::Relaxed),
                abandoned: self.abandoned.load(Ordering::Relaxed),
                failed: self.failed.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable view of [`ServerState`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    /// False once shutdown has begun.
    pub running: bool,
    /// Process start time.
    pub started_at: DateTime<Utc>,
    /// Seconds since `started_at`.
    pub uptime_secs: u64,
    /// Size of the worker pool.
    pub worker_count: usize,
    /// Current status of each worker, by index.
    pub workers: Vec<WorkerStatus>,
    /// Items waiting in the dispatch queue.
    pub queue_depth: usize,
    /// Highest dispatch queue depth seen.
    pub peak_queue_depth: usize,
    /// Outcome counters.
    pub jobs: JobCounters,
}

/// Job outcome counters since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCounters {
    /// Jobs that completed successfully.
    pub delivered: u64,
    /// Retries scheduled.
    pub rescheduled: u64,
    /// Jobs dropped after reaching the retry ceiling.
    pub abandoned: u64,
    /// Jobs dropped after a permanent failure.
    pub failed: u64,
}
