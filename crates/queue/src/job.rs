//! Job records.
//!
//! A [`JobRecord`] describes one unit of federation work. It is written to
//! the durable store when created and afterwards only has its `retries` and
//! `eligible_at` fields changed by the retry scheduler.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tern_common::PrivateKeySource;

/// Identifier of a job within its queue.
///
/// Time-derived: lexicographic order equals creation order.
pub type JobId = String;

/// Which durable queue a job lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueId {
    /// The shared/global queue.
    Shared,
    /// The queue of one local user.
    Owner(String),
}

impl QueueId {
    /// Queue for an optional owner: the user's queue, or the shared one.
    #[must_use]
    pub fn for_owner(owner: Option<&str>) -> Self {
        owner.map_or(Self::Shared, |o| Self::Owner(o.to_string()))
    }

    /// The owning local user, if any.
    #[must_use]
    pub fn owner(&self) -> Option<&str> {
        match self {
            Self::Shared => None,
            Self::Owner(o) => Some(o),
        }
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared => f.write_str("shared"),
            Self::Owner(o) => write!(f, "user:{o}"),
        }
    }
}

/// Signing identity used for outbound requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningKey {
    /// Public key URL (`keyId` in the Signature header).
    pub key_id: String,
    /// Private key material.
    pub private_key: PrivateKeySource,
}

impl SigningKey {
    /// Create a new signing key reference.
    #[must_use]
    pub const fn new(key_id: String, private_key: PrivateKeySource) -> Self {
        Self {
            key_id,
            private_key,
        }
    }
}

/// Deliver an activity to one remote inbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundDelivery {
    /// Key used to sign the request.
    pub key: SigningKey,
    /// Target inbox URL.
    pub inbox: String,
    /// Activity JSON to deliver.
    pub activity: Value,
}

/// Metadata of the HTTP request that carried an inbound activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMeta {
    /// Request path, e.g. `/users/alice/inbox`.
    pub path: String,
    /// `Host` header.
    #[serde(default)]
    pub host: Option<String>,
    /// `Date` header.
    #[serde(default)]
    pub date: Option<String>,
    /// `Digest` header.
    #[serde(default)]
    pub digest: Option<String>,
    /// Raw `Signature` header.
    #[serde(default)]
    pub signature: Option<String>,
    /// `keyId` extracted from the Signature header.
    #[serde(default)]
    pub key_id: Option<String>,
    /// `Content-Type` header.
    #[serde(default)]
    pub content_type: Option<String>,
}

/// Process an activity accepted by one of our inboxes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundProcessing {
    /// Activity JSON received.
    pub activity: Value,
    /// The request it arrived with.
    pub request: RequestMeta,
}

/// Kind of work, with its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "camelCase")]
pub enum JobKind {
    /// Deliver a signed activity to a remote inbox.
    OutboundDelivery(OutboundDelivery),
    /// Process a received activity.
    InboundProcessing(InboundProcessing),
    /// Close a poll whose end time has passed.
    #[serde(rename_all = "camelCase")]
    CloseQuestion {
        /// ID of the local question object.
        question_id: String,
    },
    /// Fetch a remote object again and store the fresh copy.
    #[serde(rename_all = "camelCase")]
    ObjectRefetch {
        /// Object URL.
        url: String,
        /// Key used to sign the fetch.
        key: SigningKey,
    },
    /// Send an email notification.
    #[serde(rename_all = "camelCase")]
    EmailNotify {
        /// Recipient address.
        to: String,
        /// Subject line.
        subject: String,
        /// Plain text body.
        body: String,
    },
    /// Send a Telegram message through the Bot API.
    #[serde(rename_all = "camelCase")]
    TelegramNotify {
        /// Bot token.
        bot_token: String,
        /// Target chat.
        chat_id: String,
        /// Message text.
        text: String,
    },
    /// Publish an ntfy message.
    #[serde(rename_all = "camelCase")]
    NtfyNotify {
        /// ntfy server base URL.
        server: String,
        /// Topic name.
        topic: String,
        /// Optional access token.
        #[serde(default)]
        token: Option<String>,
        /// Optional title.
        #[serde(default)]
        title: Option<String>,
        /// Message body.
        message: String,
    },
    /// Periodic storage maintenance.
    Purge,
}

impl JobKind {
    /// Short name used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::OutboundDelivery(_) => "outbound_delivery",
            Self::InboundProcessing(_) => "inbound_processing",
            Self::CloseQuestion { .. } => "close_question",
            Self::ObjectRefetch { .. } => "object_refetch",
            Self::EmailNotify { .. } => "email_notify",
            Self::TelegramNotify { .. } => "telegram_notify",
            Self::NtfyNotify { .. } => "ntfy_notify",
            Self::Purge => "purge",
        }
    }
}

/// One persisted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    /// Kind and payload.
    #[serde(flatten)]
    pub kind: JobKind,
    /// Number of retries already scheduled.
    #[serde(default)]
    pub retries: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Earliest time the job may be dispatched.
    pub eligible_at: DateTime<Utc>,
    /// Local user that produced the job, `None` for shared jobs.
    #[serde(default)]
    pub origin_owner: Option<String>,
}

impl JobRecord {
    /// Create a job that is eligible immediately.
    #[must_use]
    pub fn new(kind: JobKind, origin_owner: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            kind,
            retries: 0,
            created_at: now,
            eligible_at: now,
            origin_owner,
        }
    }

    /// Delay the first dispatch until `eligible_at`.
    #[must_use]
    pub const fn not_before(mut self, eligible_at: DateTime<Utc>) -> Self {
        self.eligible_at = eligible_at;
        self
    }

    /// Whether the job may be dispatched at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.eligible_at <= now
    }
}

/// A job loaded from its queue and handed to a worker.
#[derive(Debug, Clone)]
pub struct StoredJob {
    /// Queue holding the record.
    pub queue: QueueId,
    /// Job ID within the queue.
    pub id: JobId,
    /// The record itself.
    pub record: JobRecord,
}
