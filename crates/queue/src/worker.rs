//! Worker pool.
//!
//! A fixed number of workers take items from the dispatch queue. Each item is
//! either an inbound connection to serve, a claimed job to run, or a stop
//! signal. A panic while handling one item is caught and logged; the worker
//! then goes back to the queue.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use tern_common::{AppError, AppResult};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::delivery::{DeliveryExecutor, Outcome};
use crate::dispatch::{WorkItem, WorkQueue};
use crate::handlers::LocalHandler;
use crate::job::{JobKind, StoredJob};
use crate::notify::Notifier;
use crate::retry::RetryScheduler;
use crate::state::{ServerState, WorkerStatus};
use crate::store::{JobStore, StoreError};

/// Age after which leftover temporary files are removed by the purge job.
const STALE_TEMP_AGE: Duration = Duration::from_secs(3600);

/// Serves one accepted inbound connection to completion.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    /// Run the request/response cycle(s) on `stream`, then close it.
    async fn serve(&self, stream: TcpStream, peer: SocketAddr) -> AppResult<()>;
}

fn local_outcome(result: AppResult<()>) -> Outcome {
    match result {
        Ok(()) => Outcome::Delivered,
        Err(e) if e.is_client_error() => Outcome::permanent(e.to_string()),
        Err(e) => Outcome::transient(e.to_string()),
    }
}

/// Runs claimed jobs and settles their outcome in the store.
pub struct JobRunner {
    store: Arc<dyn JobStore>,
    executor: DeliveryExecutor,
    notifier: Notifier,
    local: Arc<dyn LocalHandler>,
    retry: RetryScheduler,
    state: Arc<ServerState>,
}

impl JobRunner {
    /// Create a new runner.
    #[must_use]
    pub fn new(
        store: Arc<dyn JobStore>,
        executor: DeliveryExecutor,
        notifier: Notifier,
        local: Arc<dyn LocalHandler>,
        retry: RetryScheduler,
        state: Arc<ServerState>,
    ) -> Self {
        Self {
            store,
            executor,
            notifier,
            local,
            retry,
            state,
        }
    }

    /// Perform one attempt of a job. Never touches the store record.
    pub async fn execute(&self, kind: &JobKind) -> Outcome {
        match kind {
            JobKind::OutboundDelivery(delivery) => self.executor.deliver(delivery).await,
            JobKind::InboundProcessing(inbound) => local_outcome(
                self.local
                    .process_inbound(&inbound.activity, &inbound.request)
                    .await,
            ),
            JobKind::CloseQuestion { question_id } => {
                local_outcome(self.local.close_question(question_id).await)
            }
            JobKind::ObjectRefetch { url, key } => match self.executor.fetch(url, key).await {
                Ok(object) => local_outcome(self.local.store_object(url, &object).await),
                Err(outcome) => outcome,
            },
            JobKind::EmailNotify { to, subject, body } => {
                self.notifier.send_email(to, subject, body).await
            }
            JobKind::TelegramNotify {
                bot_token,
                chat_id,
                text,
            } => self.notifier.send_telegram(bot_token, chat_id, text).await,
            JobKind::NtfyNotify {
                server,
                topic,
                token,
                title,
                message,
            } => {
                self.notifier
                    .send_ntfy(server, topic, token.as_deref(), title.as_deref(), message)
                    .await
            }
            JobKind::Purge => self.purge().await,
        }
    }

    async fn purge(&self) -> Outcome {
        let temp_files = match self.store.purge_stale(STALE_TEMP_AGE).await {
            Ok(n) => n,
            Err(e) => return Outcome::from(AppError::from(e)),
        };
        match self.local.purge().await {
            Ok(items) => {
                info!(temp_files, items, "Purge completed");
                Outcome::Delivered
            }
            Err(e) => local_outcome(Err(e)),
        }
    }

    /// Run a claimed job and record the result.
    pub async fn run(&self, job: &StoredJob) {
        let started = Instant::now();
        debug!(
            queue = %job.queue,
            job_id = %job.id,
            kind = job.record.kind.name(),
            retries = job.record.retries,
            "Processing job"
        );

        let outcome = self.execute(&job.record.kind).await;
        self.settle(job, outcome, started).await;
    }

    /// Record a panic inside a job's handler as a transient failure.
    pub async fn on_panic(&self, job: &StoredJob) {
        self.settle(job, Outcome::transient("handler panicked"), Instant::now())
            .await;
    }

    async fn settle(&self, job: &StoredJob, outcome: Outcome, started: Instant) {
        if let Err(e) = self.apply(job, outcome, started).await {
            // The attempt is not counted; the next sweep picks the job up again.
            error!(
                queue = %job.queue,
                job_id = %job.id,
                error = %e,
                "Failed to record job outcome, releasing job"
            );
            if let Err(e) = self.store.release(&job.queue, &job.id).await {
                error!(queue = %job.queue, job_id = %job.id, error = %e, "Failed to release job");
            }
        }
    }

    async fn apply(
        &self,
        job: &StoredJob,
        outcome: Outcome,
        started: Instant,
    ) -> Result<(), StoreError> {
        let kind = job.record.kind.name();
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Outcome::Delivered => {
                self.store.delete(&job.queue, &job.id).await?;
                self.state.record_delivered();
                info!(queue = %job.queue, job_id = %job.id, kind, elapsed_ms, "Job completed");
            }
            Outcome::PermanentFailure(reason) => {
                self.store.delete(&job.queue, &job.id).await?;
                self.state.record_failed();
                error!(
                    queue = %job.queue,
                    job_id = %job.id,
                    kind,
                    retries = job.record.retries,
                    reason = %reason,
                    "Job failed permanently"
                );
            }
            Outcome::TransientFailure {
                reason,
                retry_after,
            } => {
                warn!(
                    queue = %job.queue,
                    job_id = %job.id,
                    kind,
                    elapsed_ms,
                    reason = %reason,
                    "Job attempt failed"
                );
                self.retry
                    .on_transient_failure(job, &reason, retry_after)
                    .await?;
            }
        }
        Ok(())
    }
}

/// The running workers.
pub struct WorkerPool {
    queue: Arc<WorkQueue>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn one worker per slot in `state`.
    #[must_use]
    pub fn spawn(
        queue: Arc<WorkQueue>,
        runner: Arc<JobRunner>,
        connections: Arc<dyn ConnectionHandler>,
        state: Arc<ServerState>,
    ) -> Self {
        let handles = (0..state.worker_count())
            .map(|index| {
                tokio::spawn(worker_loop(
                    index,
                    queue.clone(),
                    runner.clone(),
                    connections.clone(),
                    state.clone(),
                ))
            })
            .collect::<Vec<_>>();

        info!(workers = handles.len(), "Worker pool started");
        Self { queue, handles }
    }

    /// Number of workers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the pool has no workers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Post one stop item per worker and wait for all of them to exit.
    ///
    /// Items queued before the stop items are still handled.
    pub async fn shutdown(self) {
        for _ in 0..self.handles.len() {
            self.queue.post(WorkItem::Stop, false).await;
        }
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task failed");
            }
        }
        info!("Worker pool stopped");
    }
}

async fn worker_loop(
    index: usize,
    queue: Arc<WorkQueue>,
    runner: Arc<JobRunner>,
    connections: Arc<dyn ConnectionHandler>,
    state: Arc<ServerState>,
) {
    loop {
        state.set_worker_status(index, WorkerStatus::Waiting);
        let Some(item) = queue.take().await else {
            break;
        };

        match item {
            WorkItem::Stop => break,
            WorkItem::Connection(stream, peer) => {
                state.set_worker_status(index, WorkerStatus::HandlingConnection);
                match AssertUnwindSafe(connections.serve(stream, peer))
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(worker = index, peer = %peer, error = %e, "Connection error"),
                    Err(_) => error!(worker = index, peer = %peer, "Worker panicked serving connection"),
                }
            }
            WorkItem::Job(job) => {
                state.set_worker_status(index, WorkerStatus::ProcessingQueueJob);
                if AssertUnwindSafe(runner.run(&job)).catch_unwind().await.is_err() {
                    error!(
                        worker = index,
                        queue = %job.queue,
                        job_id = %job.id,
                        "Worker panicked processing job"
                    );
                    runner.on_panic(&job).await;
                }
            }
        }
    }

    state.set_worker_status(index, WorkerStatus::Stopped);
    debug!(worker = index, "Worker stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::job::{JobRecord, QueueId, RequestMeta};
    use crate::retry::RetryConfig;
    use crate::store::FsJobStore;
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use tern_common::config::{NotifyConfig, QueueConfig};

    #[derive(Default)]
    struct Recorder {
        inbound: Mutex<Vec<Value>>,
        closed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LocalHandler for Recorder {
        async fn process_inbound(&self, activity: &Value, _request: &RequestMeta) -> AppResult<()> {
            match activity["type"].as_str() {
                Some("Panic") => panic!("handler bug"),
                Some("Bogus") => Err(AppError::BadRequest("unsupported activity".into())),
                Some("Flaky") => Err(AppError::Storage("database busy".into())),
                _ => {
                    self.inbound.lock().unwrap().push(activity.clone());
                    Ok(())
                }
            }
        }

        async fn close_question(&self, question_id: &str) -> AppResult<()> {
            self.closed.lock().unwrap().push(question_id.to_string());
            Ok(())
        }

        async fn store_object(&self, _url: &str, _object: &Value) -> AppResult<()> {
            Ok(())
        }

        async fn purge(&self) -> AppResult<usize> {
            Ok(0)
        }
    }

    struct NoConnections;

    #[async_trait]
    impl ConnectionHandler for NoConnections {
        async fn serve(&self, _stream: TcpStream, _peer: SocketAddr) -> AppResult<()> {
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<FsJobStore>,
        local: Arc<Recorder>,
        state: Arc<ServerState>,
        runner: Arc<JobRunner>,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsJobStore::open(dir.path()).await.unwrap());
        let local = Arc::new(Recorder::default());
        let state = Arc::new(ServerState::new(4));
        let config = QueueConfig::default();
        let executor = DeliveryExecutor::new(&config, "tern-test").unwrap();
        let notifier = Notifier::new(&NotifyConfig::default(), executor.client().clone()).unwrap();
        let retry = RetryScheduler::new(store.clone(), RetryConfig::from(&config), state.clone());
        let runner = Arc::new(JobRunner::new(
            store.clone(),
            executor,
            notifier,
            local.clone(),
            retry,
            state.clone(),
        ));
        Fixture {
            _dir: dir,
            store,
            local,
            state,
            runner,
        }
    }

    async fn claimed(store: &FsJobStore, kind: JobKind) -> StoredJob {
        let queue = QueueId::Owner("alice".into());
        let record = JobRecord::new(kind, Some("alice".into()));
        let id = store.enqueue(&queue, &record).await.unwrap();
        assert!(store.claim(&queue, &id).await.unwrap());
        StoredJob { queue, id, record }
    }

    fn inbound(kind: &str) -> JobKind {
        JobKind::InboundProcessing(crate::job::InboundProcessing {
            activity: json!({"type": kind}),
            request: RequestMeta::default(),
        })
    }

    #[tokio::test]
    async fn test_completed_job_is_deleted() {
        let f = fixture().await;
        let job = claimed(
            &f.store,
            JobKind::CloseQuestion {
                question_id: "q1".into(),
            },
        )
        .await;

        f.runner.run(&job).await;

        assert_eq!(*f.local.closed.lock().unwrap(), vec!["q1".to_string()]);
        assert!(f.store.load(&job.queue, &job.id).await.is_err());
        assert_eq!(f.state.snapshot().jobs.delivered, 1);
    }

    #[tokio::test]
    async fn test_client_error_is_permanent() {
        let f = fixture().await;
        let job = claimed(&f.store, inbound("Bogus")).await;

        f.runner.run(&job).await;

        assert!(f.store.load(&job.queue, &job.id).await.is_err());
        assert_eq!(f.state.snapshot().jobs.failed, 1);
    }

    #[tokio::test]
    async fn test_server_error_is_rescheduled() {
        let f = fixture().await;
        let job = claimed(&f.store, inbound("Flaky")).await;

        f.runner.run(&job).await;

        let record = f.store.load(&job.queue, &job.id).await.unwrap();
        assert_eq!(record.retries, 1);
        assert!(record.eligible_at > chrono::Utc::now());
        assert_eq!(f.state.snapshot().jobs.rescheduled, 1);
    }

    #[tokio::test]
    async fn test_email_without_smtp_fails_permanently() {
        let f = fixture().await;
        let job = claimed(
            &f.store,
            JobKind::EmailNotify {
                to: "bob@example.com".into(),
                subject: "hi".into(),
                body: "hello".into(),
            },
        )
        .await;

        f.runner.run(&job).await;
        assert_eq!(f.state.snapshot().jobs.failed, 1);
    }

    #[tokio::test]
    async fn test_worker_survives_panicking_job() {
        let f = fixture().await;
        let queue = Arc::new(WorkQueue::new(f.state.clone()));
        let pool = WorkerPool::spawn(
            queue.clone(),
            f.runner.clone(),
            Arc::new(NoConnections),
            f.state.clone(),
        );
        assert_eq!(pool.len(), 4);

        let panicking = claimed(&f.store, inbound("Panic")).await;
        let fine = claimed(&f.store, inbound("Create")).await;
        queue.post(WorkItem::Job(panicking.clone()), false).await;
        queue.post(WorkItem::Job(fine.clone()), false).await;
        pool.shutdown().await;

        assert_eq!(f.local.inbound.lock().unwrap().len(), 1);
        let record = f.store.load(&panicking.queue, &panicking.id).await.unwrap();
        assert_eq!(record.retries, 1);
        assert!(f.store.load(&fine.queue, &fine.id).await.is_err());
        for i in 0..4 {
            assert_eq!(f.state.worker_status(i), Some(WorkerStatus::Stopped));
        }
    }
}
