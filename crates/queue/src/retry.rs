//! Retry policy and scheduler.
//!
//! Transient failures are retried with exponential backoff until the retry
//! ceiling is reached, then the job is abandoned.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tern_common::config::QueueConfig;
use tracing::{error, info};

use crate::job::StoredJob;
use crate::state::ServerState;
use crate::store::{JobStore, StoreError};

/// Retry configuration with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries scheduled for one job.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_delay: Duration::from_secs(120),   // 2 minutes
            max_delay: Duration::from_secs(3600 * 24), // 24 hours
            multiplier: 2.0,
        }
    }
}

impl From<&QueueConfig> for RetryConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_secs(config.initial_retry_delay_secs),
            max_delay: Duration::from_secs(config.max_retry_delay_secs),
            multiplier: config.retry_multiplier,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retries` (1-based).
    ///
    /// Non-decreasing in `retries` and never above `max_delay`.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn backoff(&self, retries: u32) -> Duration {
        let exponent = retries.saturating_sub(1).min(i32::MAX as u32) as i32;
        // A multiplier below 1 would make the curve shrink.
        let multiplier = self.multiplier.max(1.0);
        let secs = self.initial_delay.as_secs_f64() * multiplier.powi(exponent);

        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Check if another retry may be scheduled after `retries` retries.
    #[must_use]
    pub const fn should_retry(&self, retries: u32) -> bool {
        retries < self.max_retries
    }
}

/// What the scheduler did with a transiently failed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Persisted with a later eligibility time.
    Rescheduled {
        /// New retry count.
        retries: u32,
        /// When the job becomes due again.
        eligible_at: DateTime<Utc>,
    },
    /// Retry ceiling reached; the job was deleted.
    Abandoned {
        /// Number of retries that had been scheduled.
        retries: u32,
    },
}

/// Applies [`RetryConfig`] to jobs in the durable store.
#[derive(Clone)]
pub struct RetryScheduler {
    store: Arc<dyn JobStore>,
    config: RetryConfig,
    state: Arc<ServerState>,
}

impl RetryScheduler {
    /// Create a new scheduler.
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>, config: RetryConfig, state: Arc<ServerState>) -> Self {
        Self {
            store,
            config,
            state,
        }
    }

    /// The active policy.
    #[must_use]
    pub const fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Reschedule or abandon a job whose attempt failed transiently.
    ///
    /// `retry_after` is a delay requested by the remote (e.g. `Retry-After`
    /// on a 429); it can lengthen the backoff but never past `max_delay`.
    pub async fn on_transient_failure(
        &self,
        job: &StoredJob,
        reason: &str,
        retry_after: Option<Duration>,
    ) -> Result<RetryDecision, StoreError> {
        let retries = job.record.retries;

        if !self.config.should_retry(retries) {
            self.store.delete(&job.queue, &job.id).await?;
            self.state.record_abandoned();
            error!(
                queue = %job.queue,
                job_id = %job.id,
                kind = job.record.kind.name(),
                retries,
                reason,
                "Job abandoned after {} attempts",
                retries + 1
            );
            return Ok(RetryDecision::Abandoned { retries });
        }

        let retries = retries + 1;
        let delay = retry_after.map_or_else(
            || self.config.backoff(retries),
            |hint| hint.max(self.config.backoff(retries)).min(self.config.max_delay),
        );
        let eligible_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1));

        self.store
            .update(&job.queue, &job.id, retries, eligible_at)
            .await?;
        self.state.record_rescheduled();

        info!(
            queue = %job.queue,
            job_id = %job.id,
            kind = job.record.kind.name(),
            retries,
            delay_secs = delay.as_secs(),
            reason,
            "Job rescheduled"
        );
        Ok(RetryDecision::Rescheduled {
            retries,
            eligible_at,
        })
    }
}
