//! Local object cache.
//!
//! ActivityPub objects (remote actors, notes, local questions) are kept as
//! JSON files under `{base}/objects`, named by the SHA-256 of their `id`.
//! Inbound activities update this cache once their HTTP signature checks out,
//! and outbound fan-out reads actor inboxes from it.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tern_common::{AppError, AppResult, HttpSignature, verify_signature};
use tern_queue::{ActorDirectory, ActorInboxes, LocalHandler, ObjectFetcher, RequestMeta};
use tracing::{debug, info, warn};
use url::Url;

/// Cached remote objects older than this are dropped by the purge job.
const OBJECT_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

/// Pseudo-headers an inbound signature must cover.
const REQUIRED_SIGNED_HEADERS: [&str; 2] = ["(request-target)", "digest"];

/// Filesystem-backed object cache.
#[derive(Clone)]
pub struct FsObjectStore {
    dir: PathBuf,
    local_prefix: String,
    fetcher: Option<Arc<dyn ObjectFetcher>>,
}

impl FsObjectStore {
    /// Open the cache under `base`. Objects whose ID starts with
    /// `local_prefix` are never purged and never modified by remote actors.
    pub async fn open(base: impl AsRef<Path>, local_prefix: impl Into<String>) -> AppResult<Self> {
        let dir = base.as_ref().join("objects");
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            local_prefix: local_prefix.into(),
            fetcher: None,
        })
    }

    /// Fetch actor documents with `fetcher` when a signing key is not cached
    /// or no longer matches.
    #[must_use]
    pub fn with_fetcher(mut self, fetcher: Arc<dyn ObjectFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    fn path_for(&self, id: &str) -> PathBuf {
        let hash = Sha256::digest(id.as_bytes());
        self.dir.join(format!("{hash:x}.json"))
    }

    /// Load an object by ID.
    pub async fn get(&self, id: &str) -> AppResult<Option<Value>> {
        match tokio::fs::read(self.path_for(id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
                AppError::Storage(format!("Corrupted object {id}: {e}"))
            })?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Store an object under `id`, replacing any previous copy.
    pub async fn put(&self, id: &str, object: &Value) -> AppResult<()> {
        let path = self.path_for(id);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(object)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(id, "Stored object");
        Ok(())
    }

    /// Remove an object. Missing objects are not an error.
    pub async fn remove(&self, id: &str) -> AppResult<bool> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn is_local(&self, object: &Value) -> bool {
        object["id"]
            .as_str()
            .is_some_and(|id| id.starts_with(&self.local_prefix))
    }

    /// Check the stored request's signature and return the actor that owns
    /// the signing key.
    async fn verify_request(&self, request: &RequestMeta) -> AppResult<String> {
        let header = request
            .signature
            .as_deref()
            .ok_or_else(|| AppError::Unauthorized("Activity is not signed".to_string()))?;
        let signature =
            HttpSignature::parse(header).map_err(|e| AppError::Unauthorized(e.to_string()))?;
        for required in REQUIRED_SIGNED_HEADERS {
            if !signature
                .headers
                .iter()
                .any(|h| h.eq_ignore_ascii_case(required))
            {
                return Err(AppError::Unauthorized(format!(
                    "Signature does not cover {required}"
                )));
            }
        }

        let signer = key_owner(&signature.key_id).to_string();
        let headers = signed_header_values(request);

        if let Some(actor) = self.get(&signer).await?
            && let Some(pem) = public_key_pem(&actor, &signature.key_id)
            && signature_matches(&signature, pem, request, &headers)
        {
            return Ok(signer);
        }

        // Unknown or rotated key.
        let Some(fetcher) = &self.fetcher else {
            return Err(AppError::Unauthorized(format!(
                "No usable key {}",
                signature.key_id
            )));
        };
        let actor = fetcher.fetch_object(&signer).await?;
        if actor["id"] != signer.as_str() {
            return Err(AppError::Unauthorized(format!(
                "Actor document at {signer} has a different id"
            )));
        }
        let pem = public_key_pem(&actor, &signature.key_id).ok_or_else(|| {
            AppError::Unauthorized(format!("{signer} does not publish {}", signature.key_id))
        })?;
        if !signature_matches(&signature, pem, request, &headers) {
            return Err(AppError::Unauthorized(format!(
                "Signature by {} does not verify",
                signature.key_id
            )));
        }
        self.put(&signer, &actor).await?;
        Ok(signer)
    }

    /// Remote actors may only touch objects on their own origin.
    fn check_authority(&self, signer: &str, object_id: &str) -> AppResult<()> {
        if object_id.starts_with(&self.local_prefix) {
            return Err(AppError::Forbidden(format!(
                "{signer} cannot modify local object {object_id}"
            )));
        }
        let same_origin = match (Url::parse(signer), Url::parse(object_id)) {
            (Ok(a), Ok(b)) => a.origin() == b.origin(),
            _ => false,
        };
        if same_origin {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!(
                "{signer} cannot modify {object_id}"
            )))
        }
    }

    /// Cache an actor embedded in an activity signed by that same actor. A
    /// copy without `publicKey` keeps the key already on file.
    async fn cache_actor(&self, actor: &Value, signer: &str) -> AppResult<()> {
        let mut actor = actor.clone();
        if actor.get("publicKey").is_none()
            && let Some(cached) = self.get(signer).await?
            && let Some(key) = cached.get("publicKey")
        {
            actor["publicKey"] = key.clone();
        }
        self.put(signer, &actor).await
    }
}

fn object_id(value: &Value) -> Option<&str> {
    match value {
        Value::String(id) => Some(id),
        Value::Object(_) => value["id"].as_str(),
        _ => None,
    }
}

/// The actor part of a key ID, `https://host/users/bob#main-key` becoming
/// `https://host/users/bob`.
fn key_owner(key_id: &str) -> &str {
    key_id.split_once('#').map_or(key_id, |(owner, _)| owner)
}

/// PEM of the key `key_id` published by `actor`, if any.
fn public_key_pem<'a>(actor: &'a Value, key_id: &str) -> Option<&'a str> {
    let keys: Vec<&Value> = match &actor["publicKey"] {
        Value::Array(keys) => keys.iter().collect(),
        key => vec![key],
    };
    keys.into_iter()
        .find(|key| key["id"] == key_id)
        .and_then(|key| key["publicKeyPem"].as_str())
}

fn signed_header_values(request: &RequestMeta) -> HashMap<String, String> {
    [
        ("host", &request.host),
        ("date", &request.date),
        ("digest", &request.digest),
        ("content-type", &request.content_type),
    ]
    .into_iter()
    .filter_map(|(name, value)| value.clone().map(|v| (name.to_string(), v)))
    .collect()
}

fn signature_matches(
    signature: &HttpSignature,
    pem: &str,
    request: &RequestMeta,
    headers: &HashMap<String, String>,
) -> bool {
    match verify_signature(signature, pem, "post", &request.path, headers) {
        Ok(valid) => valid,
        Err(e) => {
            warn!(key_id = %signature.key_id, error = %e, "Signature check failed");
            false
        }
    }
}

#[async_trait]
impl LocalHandler for FsObjectStore {
    async fn process_inbound(&self, activity: &Value, request: &RequestMeta) -> AppResult<()> {
        let kind = activity["type"]
            .as_str()
            .ok_or_else(|| AppError::BadRequest("Activity has no type".to_string()))?;
        let signer = self.verify_request(request).await?;
        let actor = object_id(&activity["actor"])
            .ok_or_else(|| AppError::BadRequest("Activity has no actor".to_string()))?;
        if actor != signer {
            return Err(AppError::Forbidden(format!(
                "Activity by {actor} signed by {signer}"
            )));
        }
        let object = &activity["object"];

        match kind {
            "Create" | "Update" => {
                let id = object["id"].as_str().ok_or_else(|| {
                    AppError::BadRequest(format!("{kind} activity without embedded object"))
                })?;
                self.check_authority(&signer, id)?;
                if id == signer {
                    self.cache_actor(object, &signer).await?;
                } else {
                    self.put(id, object).await?;
                }
            }
            "Delete" => {
                if let Some(id) = object_id(object) {
                    self.check_authority(&signer, id)?;
                    self.remove(id).await?;
                }
            }
            _ => {}
        }

        if activity["actor"].is_object() && !(kind == "Delete" && object_id(object) == Some(actor)) {
            self.cache_actor(&activity["actor"], &signer).await?;
        }

        info!(
            activity_type = kind,
            path = %request.path,
            signer = %signer,
            "Processed inbound activity"
        );
        Ok(())
    }

    async fn close_question(&self, question_id: &str) -> AppResult<()> {
        let mut question = self
            .get(question_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Question {question_id}")))?;
        if question["type"] != "Question" {
            return Err(AppError::BadRequest(format!("{question_id} is not a question")));
        }
        if question.get("closed").is_some_and(|c| !c.is_null()) {
            return Ok(());
        }

        question["closed"] = Value::String(Utc::now().to_rfc3339());
        self.put(question_id, &question).await?;
        info!(question_id, "Closed question");
        Ok(())
    }

    async fn store_object(&self, url: &str, object: &Value) -> AppResult<()> {
        let id = object["id"].as_str().unwrap_or(url);
        self.put(id, object).await
    }

    async fn purge(&self) -> AppResult<usize> {
        let cutoff = SystemTime::now().checked_sub(OBJECT_TTL);
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let modified = entry.metadata().await.and_then(|m| m.modified()).ok();
            let expired = matches!((modified, cutoff), (Some(m), Some(c)) if m <= c);
            if !expired {
                continue;
            }
            let keep = match tokio::fs::read(&path).await {
                Ok(bytes) => serde_json::from_slice::<Value>(&bytes)
                    .is_ok_and(|object| self.is_local(&object)),
                Err(_) => false,
            };
            if !keep && tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }

        Ok(removed)
    }
}

#[async_trait]
impl ActorDirectory for FsObjectStore {
    async fn inboxes(&self, actor: &str) -> AppResult<Option<ActorInboxes>> {
        let Some(object) = self.get(actor).await? else {
            return Ok(None);
        };
        let Some(inbox) = object["inbox"].as_str() else {
            return Ok(None);
        };
        Ok(Some(ActorInboxes {
            inbox: inbox.to_string(),
            shared_inbox: object["endpoints"]["sharedInbox"]
                .as_str()
                .map(String::from),
        }))
    }
}
