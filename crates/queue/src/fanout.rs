//! Job producers.
//!
//! [`Federator`] turns local actions into durable jobs. Outbound activities
//! addressed to many actors are grouped by shared inbox, so one remote server
//! receives an activity once no matter how many of its users it targets.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tern_common::{AppError, AppResult};
use tracing::{debug, info, warn};

use crate::handlers::{ActorDirectory, ActorInboxes};
use crate::job::{
    InboundProcessing, JobId, JobKind, JobRecord, OutboundDelivery, QueueId, RequestMeta,
    SigningKey,
};
use crate::store::JobStore;

/// One inbox to deliver to and the actors it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryTarget {
    /// Inbox URL (the shared inbox when one is advertised).
    pub inbox: String,
    /// Actors reached through this inbox.
    pub actors: Vec<String>,
    /// Whether `inbox` is a shared inbox.
    pub is_shared: bool,
}

/// Group resolved recipients by the inbox they should be delivered to.
///
/// Shared inboxes win over personal ones. Targets keep the order in which
/// their first actor appeared.
#[must_use]
pub fn group_by_inbox(recipients: Vec<(String, ActorInboxes)>) -> Vec<DeliveryTarget> {
    let mut targets: Vec<DeliveryTarget> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for (actor, inboxes) in recipients {
        let is_shared = inboxes.shared_inbox.is_some();
        let inbox = inboxes.shared_inbox.unwrap_or(inboxes.inbox);

        match index.get(&inbox) {
            Some(&i) => {
                if !targets[i].actors.contains(&actor) {
                    targets[i].actors.push(actor);
                }
            }
            None => {
                index.insert(inbox.clone(), targets.len());
                targets.push(DeliveryTarget {
                    inbox,
                    actors: vec![actor],
                    is_shared,
                });
            }
        }
    }

    targets
}

/// Creates jobs in the durable store.
#[derive(Clone)]
pub struct Federator {
    store: Arc<dyn JobStore>,
    directory: Arc<dyn ActorDirectory>,
}

impl Federator {
    /// Create a new federator.
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>, directory: Arc<dyn ActorDirectory>) -> Self {
        Self { store, directory }
    }

    /// Persist a job in the owner's queue, or the shared one.
    pub async fn enqueue(&self, owner: Option<&str>, record: JobRecord) -> AppResult<JobId> {
        let queue = QueueId::for_owner(owner);
        Ok(self.store.enqueue(&queue, &record).await?)
    }

    /// Queue one delivery of `activity` to `inbox`.
    pub async fn deliver_to_inbox(
        &self,
        owner: Option<&str>,
        key: &SigningKey,
        inbox: &str,
        activity: &Value,
    ) -> AppResult<JobId> {
        let kind = JobKind::OutboundDelivery(OutboundDelivery {
            key: key.clone(),
            inbox: inbox.to_string(),
            activity: activity.clone(),
        });
        let id = self
            .enqueue(owner, JobRecord::new(kind, owner.map(String::from)))
            .await?;

        debug!(inbox = %inbox, job_id = %id, "Queued delivery job");
        Ok(id)
    }

    /// Resolve `actors` and queue one delivery per distinct inbox.
    ///
    /// Unknown actors are skipped. Returns the IDs of the created jobs.
    pub async fn deliver_to_actors(
        &self,
        owner: Option<&str>,
        key: &SigningKey,
        activity: &Value,
        actors: &[String],
    ) -> AppResult<Vec<JobId>> {
        let mut recipients = Vec::with_capacity(actors.len());
        for actor in actors {
            match self.directory.inboxes(actor).await {
                Ok(Some(inboxes)) => recipients.push((actor.clone(), inboxes)),
                Ok(None) => warn!(actor = %actor, "Skipping delivery to unknown actor"),
                Err(e) => warn!(actor = %actor, error = %e, "Failed to resolve actor inbox"),
            }
        }

        let targets = group_by_inbox(recipients);
        let mut ids = Vec::with_capacity(targets.len());
        for target in &targets {
            ids.push(
                self.deliver_to_inbox(owner, key, &target.inbox, activity)
                    .await?,
            );
        }

        info!(
            owner = owner.unwrap_or("-"),
            actor_count = actors.len(),
            inbox_count = ids.len(),
            "Queued activity delivery"
        );
        Ok(ids)
    }

    /// Queue processing of an activity received by one of our inboxes.
    pub async fn enqueue_inbound(
        &self,
        owner: Option<&str>,
        activity: Value,
        request: RequestMeta,
    ) -> AppResult<JobId> {
        let kind = JobKind::InboundProcessing(InboundProcessing { activity, request });
        self.enqueue(owner, JobRecord::new(kind, owner.map(String::from)))
            .await
    }

    /// Queue a notification. Notifications go to the shared queue.
    pub async fn enqueue_notification(&self, kind: JobKind) -> AppResult<JobId> {
        if !matches!(
            kind,
            JobKind::EmailNotify { .. } | JobKind::TelegramNotify { .. } | JobKind::NtfyNotify { .. }
        ) {
            return Err(AppError::BadRequest(format!(
                "{} is not a notification job",
                kind.name()
            )));
        }
        self.enqueue(None, JobRecord::new(kind, None)).await
    }

    /// Queue closing a poll at its end time.
    pub async fn schedule_close_question(
        &self,
        owner: Option<&str>,
        question_id: &str,
        at: DateTime<Utc>,
    ) -> AppResult<JobId> {
        let kind = JobKind::CloseQuestion {
            question_id: question_id.to_string(),
        };
        self.enqueue(owner, JobRecord::new(kind, owner.map(String::from)).not_before(at))
            .await
    }

    /// Queue a refetch of a remote object.
    pub async fn schedule_refetch(
        &self,
        owner: Option<&str>,
        url: &str,
        key: &SigningKey,
        at: DateTime<Utc>,
    ) -> AppResult<JobId> {
        let kind = JobKind::ObjectRefetch {
            url: url.to_string(),
            key: key.clone(),
        };
        self.enqueue(owner, JobRecord::new(kind, owner.map(String::from)).not_before(at))
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::FsJobStore;
    use async_trait::async_trait;
    use serde_json::json;
    use tern_common::PrivateKeySource;

    struct Directory(HashMap<String, ActorInboxes>);

    #[async_trait]
    impl ActorDirectory for Directory {
        async fn inboxes(&self, actor: &str) -> AppResult<Option<ActorInboxes>> {
            if actor.contains("broken") {
                return Err(AppError::Federation("lookup failed".into()));
            }
            Ok(self.0.get(actor).cloned())
        }
    }

    fn inboxes(inbox: &str, shared: Option<&str>) -> ActorInboxes {
        ActorInboxes {
            inbox: inbox.to_string(),
            shared_inbox: shared.map(String::from),
        }
    }

    fn key() -> SigningKey {
        SigningKey::new(
            "https://tern.example/users/alice#main-key".into(),
            PrivateKeySource::File("/keys/alice.pem".into()),
        )
    }

    #[test]
    fn test_group_by_inbox() {
        let targets = group_by_inbox(vec![
            (
                "https://example.com/users/alice".into(),
                inboxes(
                    "https://example.com/users/alice/inbox",
                    Some("https://example.com/inbox"),
                ),
            ),
            (
                "https://other.com/users/charlie".into(),
                inboxes("https://other.com/users/charlie/inbox", None),
            ),
            (
                "https://example.com/users/bob".into(),
                inboxes(
                    "https://example.com/users/bob/inbox",
                    Some("https://example.com/inbox"),
                ),
            ),
        ]);

        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].inbox, "https://example.com/inbox");
        assert_eq!(targets[0].actors.len(), 2);
        assert!(targets[0].is_shared);
        assert_eq!(targets[1].inbox, "https://other.com/users/charlie/inbox");
        assert!(!targets[1].is_shared);
    }

    #[tokio::test]
    async fn test_deliver_to_actors_dedups_and_skips_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsJobStore::open(dir.path()).await.unwrap());
        let directory = Directory(HashMap::from([
            (
                "https://a.example/users/1".to_string(),
                inboxes("https://a.example/users/1/inbox", Some("https://a.example/inbox")),
            ),
            (
                "https://a.example/users/2".to_string(),
                inboxes("https://a.example/users/2/inbox", Some("https://a.example/inbox")),
            ),
            (
                "https://b.example/users/3".to_string(),
                inboxes("https://b.example/users/3/inbox", None),
            ),
        ]));
        let federator = Federator::new(store.clone(), Arc::new(directory));

        let actors = [
            "https://a.example/users/1",
            "https://a.example/users/2",
            "https://b.example/users/3",
            "https://c.example/users/unknown",
            "https://d.example/users/broken",
        ]
        .map(String::from);
        let ids = federator
            .deliver_to_actors(Some("alice"), &key(), &json!({"type": "Create"}), &actors)
            .await
            .unwrap();

        assert_eq!(ids.len(), 2);
        let queue = QueueId::Owner("alice".into());
        let mut inboxes: Vec<String> = Vec::new();
        for id in &ids {
            let record = store.load(&queue, id).await.unwrap();
            assert_eq!(record.origin_owner.as_deref(), Some("alice"));
            let JobKind::OutboundDelivery(delivery) = record.kind else {
                panic!("expected delivery job");
            };
            inboxes.push(delivery.inbox);
        }
        assert_eq!(
            inboxes,
            vec!["https://a.example/inbox", "https://b.example/users/3/inbox"]
        );
    }

    #[tokio::test]
    async fn test_scheduled_jobs_wait_for_their_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsJobStore::open(dir.path()).await.unwrap());
        let federator = Federator::new(store.clone(), Arc::new(Directory(HashMap::new())));
        let at = Utc::now() + chrono::Duration::hours(1);

        let id = federator
            .schedule_close_question(None, "https://tern.example/notes/q1", at)
            .await
            .unwrap();

        assert!(store.peek_due(&QueueId::Shared, Utc::now()).await.unwrap().is_empty());
        assert_eq!(store.peek_due(&QueueId::Shared, at).await.unwrap(), vec![id]);
    }
}
