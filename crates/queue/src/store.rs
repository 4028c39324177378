//! Durable job store.
//!
//! One queue per local user plus one shared queue. The filesystem backend
//! keeps one JSON file per job:
//!
//! ```text
//! {base}/shared/{id}.json
//! {base}/users/{owner}/{id}.json
//! {base}/users/{owner}/{id}.claimed   <- handed to a worker
//! ```
//!
//! Job IDs are monotonic ULIDs, so a sorted directory listing is creation
//! order. Writes go through a temporary file, `fsync` and `rename`, so a job
//! is durable before [`JobStore::enqueue`] returns.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tern_common::IdGenerator;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::job::{JobId, JobRecord, QueueId};

const PENDING_EXT: &str = "json";
const CLAIMED_EXT: &str = "claimed";
const TEMP_EXT: &str = "tmp";

/// Durable store error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job not found: {queue}/{id}")]
    NotFound { queue: QueueId, id: JobId },

    #[error("Invalid queue owner: {0:?}")]
    InvalidOwner(String),

    #[error("Corrupted job record {queue}/{id}: {reason}")]
    Corrupt {
        queue: QueueId,
        id: JobId,
        reason: String,
    },

    #[error("Storage I/O error ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<StoreError> for tern_common::AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => Self::NotFound(err.to_string()),
            StoreError::InvalidOwner(_) => Self::BadRequest(err.to_string()),
            StoreError::Corrupt { .. } | StoreError::Io { .. } => Self::Storage(err.to_string()),
        }
    }
}

/// Persistent storage of pending jobs.
///
/// Every job is visible to at most one worker: the sweep loop
/// [`claim`](JobStore::claim)s a job before dispatching it, and claimed jobs
/// are invisible to [`peek_due`](JobStore::peek_due) until they are
/// [`update`](JobStore::update)d, [`release`](JobStore::release)d or
/// [`delete`](JobStore::delete)d.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job and return its ID. Durable on return.
    async fn enqueue(&self, queue: &QueueId, record: &JobRecord) -> Result<JobId, StoreError>;

    /// All queues: the shared one plus one per local user with a queue directory.
    async fn queues(&self) -> Result<Vec<QueueId>, StoreError>;

    /// IDs of unclaimed jobs with `eligible_at <= now`, in creation order.
    ///
    /// Corrupted records found on the way are logged and dropped.
    async fn peek_due(&self, queue: &QueueId, now: DateTime<Utc>)
    -> Result<Vec<JobId>, StoreError>;

    /// Take exclusive ownership of a pending job. Returns `false` if the job
    /// is gone or already claimed.
    async fn claim(&self, queue: &QueueId, id: &str) -> Result<bool, StoreError>;

    /// Return a claimed job to the pending set unchanged.
    async fn release(&self, queue: &QueueId, id: &str) -> Result<(), StoreError>;

    /// Load a job, claimed or not.
    async fn load(&self, queue: &QueueId, id: &str) -> Result<JobRecord, StoreError>;

    /// Record a retry: persist the new counters and release the claim.
    async fn update(
        &self,
        queue: &QueueId,
        id: &str,
        retries: u32,
        eligible_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Remove a job. Deleting a missing job is not an error.
    async fn delete(&self, queue: &QueueId, id: &str) -> Result<(), StoreError>;

    /// Release every claim left behind by a previous process. Returns the
    /// number of jobs made pending again.
    async fn recover(&self) -> Result<usize, StoreError>;

    /// Remove temporary files older than `max_age` left by interrupted writes.
    async fn purge_stale(&self, max_age: Duration) -> Result<usize, StoreError>;
}

/// Filesystem-backed [`JobStore`].
#[derive(Debug)]
pub struct FsJobStore {
    base_path: PathBuf,
    ids: IdGenerator,
}

impl FsJobStore {
    /// Open (and create if needed) a store rooted at `base_path`.
    pub async fn open(base_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base_path = base_path.into();
        for dir in [base_path.join("shared"), base_path.join("users")] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| StoreError::io(format!("create {}", dir.display()), e))?;
        }
        info!(path = %base_path.display(), "Opened job store");
        Ok(Self {
            base_path,
            ids: IdGenerator::new(),
        })
    }

    fn queue_dir(&self, queue: &QueueId) -> Result<PathBuf, StoreError> {
        match queue {
            QueueId::Shared => Ok(self.base_path.join("shared")),
            QueueId::Owner(owner) => {
                if !is_valid_owner(owner) {
                    return Err(StoreError::InvalidOwner(owner.clone()));
                }
                Ok(self.base_path.join("users").join(owner))
            }
        }
    }

    fn job_path(&self, queue: &QueueId, id: &str, ext: &str) -> Result<PathBuf, StoreError> {
        if !is_valid_id(id) {
            return Err(StoreError::NotFound {
                queue: queue.clone(),
                id: id.to_string(),
            });
        }
        Ok(self.queue_dir(queue)?.join(format!("{id}.{ext}")))
    }

    async fn read_record(
        &self,
        queue: &QueueId,
        id: &str,
        path: &Path,
    ) -> Result<Option<JobRecord>, StoreError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(format!("read {}", path.display()), e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                queue: queue.clone(),
                id: id.to_string(),
                reason: e.to_string(),
            })
    }

    /// Write `record` to `{id}.json` atomically.
    async fn write_record(
        &self,
        queue: &QueueId,
        id: &str,
        record: &JobRecord,
    ) -> Result<(), StoreError> {
        let dir = self.queue_dir(queue)?;
        let target = self.job_path(queue, id, PENDING_EXT)?;
        let temp = dir.join(format!(".{id}.{TEMP_EXT}"));

        let bytes = serde_json::to_vec_pretty(record).map_err(|e| StoreError::Corrupt {
            queue: queue.clone(),
            id: id.to_string(),
            reason: e.to_string(),
        })?;

        let mut file = tokio::fs::File::create(&temp)
            .await
            .map_err(|e| StoreError::io(format!("create {}", temp.display()), e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| StoreError::io(format!("write {}", temp.display()), e))?;
        file.sync_all()
            .await
            .map_err(|e| StoreError::io(format!("sync {}", temp.display()), e))?;
        drop(file);

        tokio::fs::rename(&temp, &target)
            .await
            .map_err(|e| StoreError::io(format!("rename {}", target.display()), e))?;
        sync_dir(&dir).await;
        Ok(())
    }

    async fn remove_if_exists(path: &Path) -> Result<bool, StoreError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(format!("remove {}", path.display()), e)),
        }
    }

    /// Sorted file stems in `dir` with the given extension.
    async fn list_ids(dir: &Path, ext: &str) -> Result<Vec<JobId>, StoreError> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(format!("list {}", dir.display()), e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(format!("list {}", dir.display()), e))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name.strip_suffix(&format!(".{ext}"))
                && is_valid_id(id)
            {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl JobStore for FsJobStore {
    async fn enqueue(&self, queue: &QueueId, record: &JobRecord) -> Result<JobId, StoreError> {
        let dir = self.queue_dir(queue)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(format!("create {}", dir.display()), e))?;

        let id = self.ids.generate();
        self.write_record(queue, &id, record).await?;

        debug!(queue = %queue, job_id = %id, kind = record.kind.name(), "Enqueued job");
        Ok(id)
    }

    async fn queues(&self) -> Result<Vec<QueueId>, StoreError> {
        let users = self.base_path.join("users");
        let mut entries = tokio::fs::read_dir(&users)
            .await
            .map_err(|e| StoreError::io(format!("list {}", users.display()), e))?;

        let mut owners = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(format!("list {}", users.display()), e))?
        {
            let is_dir = entry.file_type().await.is_ok_and(|t| t.is_dir());
            if let Some(name) = entry.file_name().to_str()
                && is_dir
                && is_valid_owner(name)
            {
                owners.push(name.to_string());
            }
        }
        owners.sort();

        let mut queues: Vec<QueueId> = owners.into_iter().map(QueueId::Owner).collect();
        queues.push(QueueId::Shared);
        Ok(queues)
    }

    async fn peek_due(
        &self,
        queue: &QueueId,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError> {
        let dir = self.queue_dir(queue)?;
        let mut due = Vec::new();

        for id in Self::list_ids(&dir, PENDING_EXT).await? {
            let path = self.job_path(queue, &id, PENDING_EXT)?;
            match self.read_record(queue, &id, &path).await {
                Ok(Some(record)) if record.is_due(now) => due.push(id),
                Ok(_) => {}
                Err(e @ StoreError::Corrupt { .. }) => {
                    error!(error = %e, "Dropping corrupted job record");
                    Self::remove_if_exists(&path).await?;
                }
                Err(e) => {
                    warn!(queue = %queue, job_id = %id, error = %e, "Failed to read job, skipping");
                }
            }
        }

        Ok(due)
    }

    async fn claim(&self, queue: &QueueId, id: &str) -> Result<bool, StoreError> {
        let pending = self.job_path(queue, id, PENDING_EXT)?;
        let claimed = self.job_path(queue, id, CLAIMED_EXT)?;

        if tokio::fs::try_exists(&claimed).await.unwrap_or(false) {
            return Ok(false);
        }
        match tokio::fs::rename(&pending, &claimed).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(format!("claim {}", pending.display()), e)),
        }
    }

    async fn release(&self, queue: &QueueId, id: &str) -> Result<(), StoreError> {
        let pending = self.job_path(queue, id, PENDING_EXT)?;
        let claimed = self.job_path(queue, id, CLAIMED_EXT)?;

        match tokio::fs::rename(&claimed, &pending).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(format!("release {}", claimed.display()), e)),
        }
    }

    async fn load(&self, queue: &QueueId, id: &str) -> Result<JobRecord, StoreError> {
        for ext in [CLAIMED_EXT, PENDING_EXT] {
            let path = self.job_path(queue, id, ext)?;
            if let Some(record) = self.read_record(queue, id, &path).await? {
                return Ok(record);
            }
        }
        Err(StoreError::NotFound {
            queue: queue.clone(),
            id: id.to_string(),
        })
    }

    async fn update(
        &self,
        queue: &QueueId,
        id: &str,
        retries: u32,
        eligible_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut record = self.load(queue, id).await?;
        record.retries = retries;
        record.eligible_at = eligible_at;

        // The new pending file lands before the claim disappears; recover()
        // prefers the pending file when both exist.
        self.write_record(queue, id, &record).await?;
        Self::remove_if_exists(&self.job_path(queue, id, CLAIMED_EXT)?).await?;
        Ok(())
    }

    async fn delete(&self, queue: &QueueId, id: &str) -> Result<(), StoreError> {
        let removed_claimed = Self::remove_if_exists(&self.job_path(queue, id, CLAIMED_EXT)?).await?;
        let removed_pending = Self::remove_if_exists(&self.job_path(queue, id, PENDING_EXT)?).await?;
        if removed_claimed || removed_pending {
            debug!(queue = %queue, job_id = %id, "Deleted job");
        }
        Ok(())
    }

    async fn recover(&self) -> Result<usize, StoreError> {
        let mut released = 0;
        for queue in self.queues().await? {
            let dir = self.queue_dir(&queue)?;
            for id in Self::list_ids(&dir, CLAIMED_EXT).await? {
                let pending = self.job_path(&queue, &id, PENDING_EXT)?;
                if tokio::fs::try_exists(&pending).await.unwrap_or(false) {
                    Self::remove_if_exists(&self.job_path(&queue, &id, CLAIMED_EXT)?).await?;
                } else {
                    self.release(&queue, &id).await?;
                }
                released += 1;
            }
        }
        if released > 0 {
            info!(released, "Released jobs claimed by a previous run");
        }
        Ok(released)
    }

    async fn purge_stale(&self, max_age: Duration) -> Result<usize, StoreError> {
        let cutoff = SystemTime::now().checked_sub(max_age);
        let mut removed = 0;

        for queue in self.queues().await? {
            let dir = self.queue_dir(&queue)?;
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::io(format!("list {}", dir.display()), e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StoreError::io(format!("list {}", dir.display()), e))?
            {
                let is_temp = entry
                    .file_name()
                    .to_str()
                    .is_some_and(|n| n.starts_with('.') && n.ends_with(TEMP_EXT));
                if !is_temp {
                    continue;
                }
                let modified = entry.metadata().await.and_then(|m| m.modified()).ok();
                let stale = match (modified, cutoff) {
                    (Some(modified), Some(cutoff)) => modified <= cutoff,
                    _ => true,
                };
                if stale && Self::remove_if_exists(&entry.path()).await? {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

/// Best-effort `fsync` of a directory so a rename inside it is durable.
async fn sync_dir(dir: &Path) {
    // Not every platform allows opening a directory for syncing.
    if let Ok(handle) = tokio::fs::File::open(dir).await
        && let Err(e) = handle.sync_all().await
    {
        debug!(dir = %dir.display(), error = %e, "Directory sync failed");
    }
}

fn is_valid_owner(owner: &str) -> bool {
    !owner.is_empty()
        && !owner.starts_with('.')
        && owner
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::job::JobKind;
    use chrono::Duration as ChronoDuration;

    async fn store() -> (tempfile::TempDir, FsJobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsJobStore::open(dir.path()).await.unwrap();
        (dir, store)
    }

    fn question(id: &str) -> JobRecord {
        JobRecord::new(
            JobKind::CloseQuestion {
                question_id: id.to_string(),
            },
            Some("alice".to_string()),
        )
    }

    #[tokio::test]
    async fn test_enqueue_and_load() {
        let (_dir, store) = store().await;
        let queue = QueueId::Owner("alice".into());

        let record = question("q1");
        let id = store.enqueue(&queue, &record).await.unwrap();

        assert_eq!(store.load(&queue, &id).await.unwrap(), record);
        assert!(matches!(
            store.load(&QueueId::Shared, &id).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_peek_due_respects_eligibility_and_order() {
        let (_dir, store) = store().await;
        let queue = QueueId::Shared;
        let base = Utc::now();

        let first = store.enqueue(&queue, &question("a")).await.unwrap();
        let later = store
            .enqueue(&queue, &question("b").not_before(base + ChronoDuration::minutes(5)))
            .await
            .unwrap();
        let third = store.enqueue(&queue, &question("c")).await.unwrap();
        let now = Utc::now();

        assert_eq!(store.peek_due(&queue, now).await.unwrap(), vec![first.clone(), third.clone()]);
        assert_eq!(
            store
                .peek_due(&queue, base + ChronoDuration::minutes(5))
                .await
                .unwrap(),
            vec![first, later, third]
        );
    }

    #[tokio::test]
    async fn test_claim_hides_job_until_update() {
        let (_dir, store) = store().await;
        let queue = QueueId::Owner("alice".into());
        let id = store.enqueue(&queue, &question("q")).await.unwrap();
        let now = Utc::now();

        assert!(store.claim(&queue, &id).await.unwrap());
        assert!(!store.claim(&queue, &id).await.unwrap());
        assert!(store.peek_due(&queue, now).await.unwrap().is_empty());

        // Claimed jobs can still be loaded by their worker.
        assert_eq!(store.load(&queue, &id).await.unwrap().retries, 0);

        let next = now + ChronoDuration::seconds(30);
        store.update(&queue, &id, 1, next).await.unwrap();

        let record = store.load(&queue, &id).await.unwrap();
        assert_eq!(record.retries, 1);
        assert_eq!(record.eligible_at, next);
        assert!(store.peek_due(&queue, now).await.unwrap().is_empty());
        assert_eq!(store.peek_due(&queue, next).await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (_dir, store) = store().await;
        let queue = QueueId::Shared;
        let id = store.enqueue(&queue, &question("q")).await.unwrap();
        store.claim(&queue, &id).await.unwrap();

        store.delete(&queue, &id).await.unwrap();
        store.delete(&queue, &id).await.unwrap();

        assert!(matches!(
            store.load(&queue, &id).await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(store.peek_due(&queue, Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupted_record_is_dropped() {
        let (dir, store) = store().await;
        let queue = QueueId::Shared;
        let good = store.enqueue(&queue, &question("q")).await.unwrap();
        let bad_path = dir.path().join("shared").join("00000000000000000000000000.json");
        std::fs::write(&bad_path, b"{not json").unwrap();

        let due = store.peek_due(&queue, Utc::now()).await.unwrap();
        assert_eq!(due, vec![good]);
        assert!(!bad_path.exists());
    }

    #[tokio::test]
    async fn test_queues_lists_owners_and_shared() {
        let (_dir, store) = store().await;
        store
            .enqueue(&QueueId::Owner("bob".into()), &question("q"))
            .await
            .unwrap();
        store
            .enqueue(&QueueId::Owner("alice".into()), &question("q"))
            .await
            .unwrap();

        assert_eq!(
            store.queues().await.unwrap(),
            vec![
                QueueId::Owner("alice".into()),
                QueueId::Owner("bob".into()),
                QueueId::Shared
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_owner_rejected() {
        let (_dir, store) = store().await;
        let err = store
            .enqueue(&QueueId::Owner("../etc".into()), &question("q"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidOwner(_)));
    }

    #[tokio::test]
    async fn test_recover_releases_claims() {
        let (dir, store) = store().await;
        let queue = QueueId::Owner("alice".into());
        let id = store.enqueue(&queue, &question("q")).await.unwrap();
        assert!(store.claim(&queue, &id).await.unwrap());
        drop(store);

        let reopened = FsJobStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.recover().await.unwrap(), 1);
        assert_eq!(reopened.peek_due(&queue, Utc::now()).await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_purge_stale_removes_temp_files() {
        let (dir, store) = store().await;
        let temp = dir.path().join("shared").join(".01abc.tmp");
        std::fs::write(&temp, b"partial").unwrap();
        let id = store.enqueue(&QueueId::Shared, &question("q")).await.unwrap();

        assert_eq!(store.purge_stale(Duration::ZERO).await.unwrap(), 1);
        assert!(!temp.exists());
        assert!(store.load(&QueueId::Shared, &id).await.is_ok());
    }
}
