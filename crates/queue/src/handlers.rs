//! Seams between the queue and the rest of the server.
//!
//! The queue does not know how activities are stored or how actors are
//! resolved. Those concerns sit behind these traits and are provided by the
//! embedding server.

use async_trait::async_trait;
use serde_json::Value;
use tern_common::AppResult;

use crate::job::RequestMeta;

/// Local side effects of queued jobs.
///
/// Errors are classified by the runner: client errors (`NotFound`,
/// `BadRequest`) drop the job, everything else retries it.
#[async_trait]
pub trait LocalHandler: Send + Sync {
    /// Apply an activity received by one of our inboxes.
    async fn process_inbound(&self, activity: &Value, request: &RequestMeta) -> AppResult<()>;

    /// Close a poll whose end time has passed.
    async fn close_question(&self, question_id: &str) -> AppResult<()>;

    /// Store a freshly fetched remote object.
    async fn store_object(&self, url: &str, object: &Value) -> AppResult<()>;

    /// Periodic maintenance. Returns the number of items removed.
    async fn purge(&self) -> AppResult<usize>;
}

/// Inbox endpoints of a remote actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorInboxes {
    /// Personal inbox.
    pub inbox: String,
    /// Server-wide shared inbox, if advertised.
    pub shared_inbox: Option<String>,
}

/// Resolves actor URIs to their inboxes.
#[async_trait]
pub trait ActorDirectory: Send + Sync {
    /// Look up an actor. `Ok(None)` means the actor is unknown.
    async fn inboxes(&self, actor: &str) -> AppResult<Option<ActorInboxes>>;
}

/// Unsigned retrieval of public remote objects, such as the actor document
/// holding the key of an inbound signature.
#[async_trait]
pub trait ObjectFetcher: Send + Sync {
    /// Fetch the object at `url`. Unreachable servers yield
    /// `AppError::Federation`; missing or malformed objects a client error.
    async fn fetch_object(&self, url: &str) -> AppResult<Value>;
}
