//! Store failure tests.
//!
//! When the store cannot record a job's outcome, or cannot read a claimed
//! job, the job must go back to the pending set untouched so a later sweep
//! runs it again.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tern_common::config::{NotifyConfig, QueueConfig};
use tern_common::{AppError, AppResult};
use tern_queue::{
    DeliveryExecutor, FsJobStore, InboundProcessing, JobId, JobKind, JobRecord, JobRunner,
    JobStore, LocalHandler, Notifier, QueueId, RequestMeta, RetryConfig, RetryScheduler,
    ServerState, StoreError, StoredJob, SweepLoop, WorkItem, WorkQueue,
};

/// File store whose writes or loads can be made to fail.
struct FailingStore {
    inner: FsJobStore,
    fail_writes: AtomicBool,
    fail_loads: AtomicBool,
}

fn disk_error(context: &str) -> StoreError {
    StoreError::Io {
        context: context.to_string(),
        source: std::io::Error::other("disk unplugged"),
    }
}

#[async_trait]
impl JobStore for FailingStore {
    async fn enqueue(&self, queue: &QueueId, record: &JobRecord) -> Result<JobId, StoreError> {
        self.inner.enqueue(queue, record).await
    }

    async fn queues(&self) -> Result<Vec<QueueId>, StoreError> {
        self.inner.queues().await
    }

    async fn peek_due(
        &self,
        queue: &QueueId,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError> {
        self.inner.peek_due(queue, now).await
    }

    async fn claim(&self, queue: &QueueId, id: &str) -> Result<bool, StoreError> {
        self.inner.claim(queue, id).await
    }

    async fn release(&self, queue: &QueueId, id: &str) -> Result<(), StoreError> {
        self.inner.release(queue, id).await
    }

    async fn load(&self, queue: &QueueId, id: &str) -> Result<JobRecord, StoreError> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(disk_error("load"));
        }
        self.inner.load(queue, id).await
    }

    async fn update(
        &self,
        queue: &QueueId,
        id: &str,
        retries: u32,
        eligible_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(disk_error("update"));
        }
        self.inner.update(queue, id, retries, eligible_at).await
    }

    async fn delete(&self, queue: &QueueId, id: &str) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(disk_error("delete"));
        }
        self.inner.delete(queue, id).await
    }

    async fn recover(&self) -> Result<usize, StoreError> {
        self.inner.recover().await
    }

    async fn purge_stale(&self, max_age: Duration) -> Result<usize, StoreError> {
        self.inner.purge_stale(max_age).await
    }
}

/// Fails inbound processing with a server-side error; closes questions fine.
struct BusyHandler;

#[async_trait]
impl LocalHandler for BusyHandler {
    async fn process_inbound(&self, _activity: &Value, _request: &RequestMeta) -> AppResult<()> {
        Err(AppError::Storage("database busy".into()))
    }

    async fn close_question(&self, _question_id: &str) -> AppResult<()> {
        Ok(())
    }

    async fn store_object(&self, _url: &str, _object: &Value) -> AppResult<()> {
        Ok(())
    }

    async fn purge(&self) -> AppResult<usize> {
        Ok(0)
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<FailingStore>,
    state: Arc<ServerState>,
    queue: Arc<WorkQueue>,
    sweep: SweepLoop,
    runner: JobRunner,
}

impl Harness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FailingStore {
            inner: FsJobStore::open(dir.path()).await.unwrap(),
            fail_writes: AtomicBool::new(false),
            fail_loads: AtomicBool::new(false),
        });
        let state = Arc::new(ServerState::new(2));
        let queue = Arc::new(WorkQueue::new(state.clone()));

        let config = QueueConfig::default();
        let executor = DeliveryExecutor::new(&config, "tern-test/0.1").unwrap();
        let notifier = Notifier::new(&NotifyConfig::default(), executor.client().clone()).unwrap();
        let retry = RetryScheduler::new(store.clone(), RetryConfig::from(&config), state.clone());
        let runner = JobRunner::new(
            store.clone(),
            executor,
            notifier,
            Arc::new(BusyHandler),
            retry,
            state.clone(),
        );
        let sweep = SweepLoop::new(store.clone(), queue.clone(), state.clone(), &config);

        Self {
            _dir: dir,
            store,
            state,
            queue,
            sweep,
            runner,
        }
    }

    async fn enqueue(&self, kind: JobKind) -> JobId {
        self.store
            .enqueue(&QueueId::Shared, &JobRecord::new(kind, None))
            .await
            .unwrap()
    }

    /// Sweep once and take the single job it dispatched.
    async fn dispatch_one(&self) -> StoredJob {
        assert_eq!(self.sweep.sweep_once(Utc::now()).await, 1);
        match self.queue.take().await {
            Some(WorkItem::Job(job)) => job,
            _ => panic!("expected a job item"),
        }
    }
}

fn inbound() -> JobKind {
    JobKind::InboundProcessing(InboundProcessing {
        activity: json!({"type": "Follow"}),
        request: RequestMeta::default(),
    })
}

#[tokio::test]
async fn test_unrecorded_retry_releases_job() {
    let h = Harness::new().await;
    let id = h.enqueue(inbound()).await;
    let job = h.dispatch_one().await;

    h.store.fail_writes.store(true, Ordering::SeqCst);
    h.runner.run(&job).await;
    h.store.fail_writes.store(false, Ordering::SeqCst);

    let record = h.store.load(&QueueId::Shared, &id).await.unwrap();
    assert_eq!(record.retries, 0);
    assert_eq!(h.state.snapshot().jobs.rescheduled, 0);

    let again = h.dispatch_one().await;
    assert_eq!(again.id, id);
    assert_eq!(again.record.retries, 0);
}

#[tokio::test]
async fn test_unrecorded_completion_releases_job() {
    let h = Harness::new().await;
    let id = h
        .enqueue(JobKind::CloseQuestion {
            question_id: "https://tern.example/questions/1".into(),
        })
        .await;
    let job = h.dispatch_one().await;

    h.store.fail_writes.store(true, Ordering::SeqCst);
    h.runner.run(&job).await;
    h.store.fail_writes.store(false, Ordering::SeqCst);

    assert_eq!(h.state.snapshot().jobs.delivered, 0);
    let again = h.dispatch_one().await;
    assert_eq!(again.id, id);

    h.runner.run(&again).await;
    assert_eq!(h.state.snapshot().jobs.delivered, 1);
    assert!(h.store.load(&QueueId::Shared, &id).await.is_err());
}

#[tokio::test]
async fn test_unreadable_job_is_released_by_sweep() {
    let h = Harness::new().await;
    let id = h.enqueue(inbound()).await;

    h.store.fail_loads.store(true, Ordering::SeqCst);
    assert_eq!(h.sweep.sweep_once(Utc::now()).await, 0);
    assert!(h.queue.is_empty().await);
    h.store.fail_loads.store(false, Ordering::SeqCst);

    let job = h.dispatch_one().await;
    assert_eq!(job.id, id);
    assert_eq!(job.record.retries, 0);
}
