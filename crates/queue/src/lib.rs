//! Federation job queue for tern.
//!
//! - **Store**: durable per-user and shared job queues on disk
//! - **Dispatch**: in-memory two-priority queue feeding the workers
//! - **Workers**: fixed pool serving connections and running jobs
//! - **Delivery**: signed ActivityPub requests and outcome classification
//! - **Retry**: exponential backoff with a retry ceiling
//! - **Sweep**: promotes due jobs and schedules periodic purges
//! - **Fan-out**: turns local actions into jobs, deduplicating shared inboxes

pub mod delivery;
pub mod dispatch;
pub mod fanout;
pub mod handlers;
pub mod job;
pub mod notify;
pub mod retry;
pub mod state;
pub mod store;
pub mod sweep;
pub mod worker;

pub use delivery::{DeliveryExecutor, Outcome, classify_status};
pub use dispatch::{DispatchQueue, WorkItem, WorkQueue};
pub use fanout::{DeliveryTarget, Federator};
pub use handlers::{ActorDirectory, ActorInboxes, LocalHandler, ObjectFetcher};
pub use job::{
    InboundProcessing, JobId, JobKind, JobRecord, OutboundDelivery, QueueId, RequestMeta,
    SigningKey, StoredJob,
};
pub use notify::Notifier;
pub use retry::{RetryConfig, RetryDecision, RetryScheduler};
pub use state::{JobCounters, ServerState, StateSnapshot, WorkerStatus};
pub use store::{FsJobStore, JobStore, StoreError};
pub use sweep::SweepLoop;
pub use worker::{ConnectionHandler, JobRunner, WorkerPool};
