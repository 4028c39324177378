//! Background sweep loop.
//!
//! The only producer of job items for the dispatch queue. Each pass walks
//! every per-user queue and then the shared queue, claims the jobs that are
//! due and posts them at normal priority.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tern_common::config::QueueConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatch::{WorkItem, WorkQueue};
use crate::job::{JobKind, JobRecord, QueueId, StoredJob};
use crate::state::ServerState;
use crate::store::{JobStore, StoreError};

/// Promotes due jobs from the durable store into the dispatch queue.
pub struct SweepLoop {
    store: Arc<dyn JobStore>,
    queue: Arc<WorkQueue>,
    state: Arc<ServerState>,
    interval: Duration,
    purge_interval: Duration,
    /// `None` until the first purge of this process, which is due at once.
    last_purge: Option<Instant>,
}

impl SweepLoop {
    /// Create a sweep loop.
    #[must_use]
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<WorkQueue>,
        state: Arc<ServerState>,
        config: &QueueConfig,
    ) -> Self {
        Self {
            store,
            queue,
            state,
            interval: config.sweep_interval(),
            purge_interval: config.purge_interval(),
            last_purge: None,
        }
    }

    /// One pass over all queues. Returns the number of jobs dispatched.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> usize {
        let queues = match self.store.queues().await {
            Ok(queues) => queues,
            Err(e) => {
                error!(error = %e, "Failed to list job queues");
                return 0;
            }
        };

        let mut dispatched = 0;
        for queue in queues {
            dispatched += self.sweep_queue(&queue, now).await;
        }
        dispatched
    }

    async fn sweep_queue(&self, queue: &QueueId, now: DateTime<Utc>) -> usize {
        let due = match self.store.peek_due(queue, now).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(queue = %queue, error = %e, "Failed to scan queue");
                return 0;
            }
        };

        let mut dispatched = 0;
        for id in due {
            match self.store.claim(queue, &id).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(queue = %queue, job_id = %id, error = %e, "Failed to claim job");
                    continue;
                }
            }

            match self.store.load(queue, &id).await {
                Ok(record) => {
                    let job = StoredJob {
                        queue: queue.clone(),
                        id,
                        record,
                    };
                    self.queue.post(WorkItem::Job(job), false).await;
                    dispatched += 1;
                }
                Err(e @ StoreError::Corrupt { .. }) => {
                    error!(queue = %queue, job_id = %id, error = %e, "Dropping corrupted job");
                    if let Err(e) = self.store.delete(queue, &id).await {
                        warn!(queue = %queue, job_id = %id, error = %e, "Failed to delete job");
                    }
                }
                Err(e) => {
                    warn!(queue = %queue, job_id = %id, error = %e, "Failed to load job");
                    if let Err(e) = self.store.release(queue, &id).await {
                        warn!(queue = %queue, job_id = %id, error = %e, "Failed to release job");
                    }
                }
            }
        }

        if dispatched > 0 {
            debug!(queue = %queue, dispatched, "Dispatched due jobs");
        }
        dispatched
    }

    /// Enqueue a purge job on the first call, then whenever the purge
    /// interval has elapsed since the last one.
    pub async fn maybe_enqueue_purge(&mut self) -> bool {
        if self
            .last_purge
            .is_some_and(|last| last.elapsed() < self.purge_interval)
        {
            return false;
        }
        match self
            .store
            .enqueue(&QueueId::Shared, &JobRecord::new(JobKind::Purge, None))
            .await
        {
            Ok(id) => {
                info!(job_id = %id, "Scheduled purge job");
                self.last_purge = Some(Instant::now());
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to schedule purge job");
                false
            }
        }
    }

    /// Run until `cancel` fires or the server stops.
    ///
    /// Sleeps only after a pass that dispatched nothing, so a backlog is
    /// drained without pauses.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(interval_ms = self.interval.as_millis() as u64, "Sweep loop started");

        while self.state.is_running() && !cancel.is_cancelled() {
            self.maybe_enqueue_purge().await;

            if self.sweep_once(Utc::now()).await > 0 {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("Sweep loop stopped");
    }
}
