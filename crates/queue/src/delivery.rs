//! Signed HTTP requests to remote servers.
//!
//! [`DeliveryExecutor`] performs one attempt of an outbound delivery or an
//! object fetch and reports an [`Outcome`]. It never touches the job store;
//! the worker decides what to do with the outcome.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, Response, StatusCode, header};
use serde_json::Value;
use tern_common::config::QueueConfig;
use tern_common::{AppError, AppResult, sign_request};
use tracing::{debug, warn};
use url::Url;

use crate::handlers::ObjectFetcher;
use crate::job::{OutboundDelivery, SigningKey};

const ACTIVITY_JSON: &str = "application/activity+json";
const ACCEPT_ACTIVITY: &str =
    r#"application/activity+json, application/ld+json; profile="https://www.w3.org/ns/activitystreams""#;

/// Redirects followed before giving up on an attempt.
const MAX_REDIRECTS: usize = 1;

/// Result of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The remote accepted the request.
    Delivered,
    /// Worth retrying later.
    TransientFailure {
        /// Human-readable cause.
        reason: String,
        /// Delay requested by the remote, if any.
        retry_after: Option<Duration>,
    },
    /// Retrying cannot help.
    PermanentFailure(String),
}

impl Outcome {
    /// Transient failure without a remote-requested delay.
    #[must_use]
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::TransientFailure {
            reason: reason.into(),
            retry_after: None,
        }
    }

    /// Permanent failure.
    #[must_use]
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::PermanentFailure(reason.into())
    }
}

impl From<AppError> for Outcome {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Storage(_) | AppError::Federation(_) | AppError::Internal(_) => {
                Self::transient(err.to_string())
            }
            _ => Self::permanent(err.to_string()),
        }
    }
}

/// Classify a final (non-redirect-followed) response status.
///
/// 2xx is success; 408, 429 and 5xx are worth retrying; any other 4xx means
/// the remote rejected the request for good. An unfollowed 3xx is retried.
#[must_use]
pub fn classify_status(status: u16) -> Outcome {
    match status {
        200..=299 => Outcome::Delivered,
        300..=399 => Outcome::transient(format!("unfollowed redirect {status}")),
        408 | 429 => Outcome::transient(format!("remote returned {status}")),
        400..=499 => Outcome::permanent(format!("remote rejected with {status}")),
        _ => Outcome::transient(format!("remote returned {status}")),
    }
}

/// Parse a `Retry-After` header value: delay seconds or an HTTP date.
#[must_use]
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

pub(crate) fn outcome_for_response(response: &Response) -> Outcome {
    let status = response.status();
    match classify_status(status.as_u16()) {
        Outcome::TransientFailure { reason, .. }
            if matches!(
                status,
                StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE
            ) =>
        {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| parse_retry_after(v, Utc::now()));
            Outcome::TransientFailure {
                reason,
                retry_after,
            }
        }
        other => other,
    }
}

/// Outcome for a request that got no response. The request URL is stripped
/// from the reason; it may carry credentials such as a bot token.
pub(crate) fn outcome_for_error(err: reqwest::Error) -> Outcome {
    let err = err.without_url();
    if err.is_builder() {
        Outcome::permanent(format!("invalid request: {err}"))
    } else if err.is_timeout() {
        Outcome::transient(format!("request timed out: {err}"))
    } else {
        Outcome::transient(format!("request failed: {err}"))
    }
}

/// HTTP client for signed ActivityPub requests.
#[derive(Clone)]
pub struct DeliveryExecutor {
    client: Client,
}

impl DeliveryExecutor {
    /// Create an executor with the configured timeouts.
    ///
    /// Redirects are never followed by the client itself, so every hop is
    /// re-signed for its own target.
    pub fn new(config: &QueueConfig, user_agent: &str) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(user_agent)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client })
    }

    /// The underlying client.
    #[must_use]
    pub const fn client(&self) -> &Client {
        &self.client
    }

    /// POST a signed activity to its inbox.
    pub async fn deliver(&self, job: &OutboundDelivery) -> Outcome {
        let inbox = match Url::parse(&job.inbox) {
            Ok(url) => url,
            Err(e) => return Outcome::permanent(format!("invalid inbox URL {}: {e}", job.inbox)),
        };
        let body = match serde_json::to_vec(&job.activity) {
            Ok(body) => body,
            Err(e) => return Outcome::permanent(format!("unserializable activity: {e}")),
        };

        match self.send_signed(Method::POST, inbox, &job.key, Some(body)).await {
            Ok(response) => {
                debug!(inbox = %job.inbox, status = %response.status(), "Activity delivered");
                Outcome::Delivered
            }
            Err(outcome) => outcome,
        }
    }

    /// GET a remote object with a signed request.
    pub async fn fetch(&self, url: &str, key: &SigningKey) -> Result<Value, Outcome> {
        let target =
            Url::parse(url).map_err(|e| Outcome::permanent(format!("invalid URL {url}: {e}")))?;

        let response = self.send_signed(Method::GET, target, key, None).await?;
        response
            .json::<Value>()
            .await
            .map_err(|e| Outcome::permanent(format!("invalid JSON from {url}: {e}")))
    }

    /// Send a signed request, following at most [`MAX_REDIRECTS`] redirects.
    ///
    /// Returns the 2xx response, or the outcome describing why there is none.
    async fn send_signed(
        &self,
        method: Method,
        mut target: Url,
        key: &SigningKey,
        body: Option<Vec<u8>>,
    ) -> Result<Response, Outcome> {
        let private_key = key.private_key.load().await.map_err(Outcome::from)?;

        for hop in 0..=MAX_REDIRECTS {
            let signed = sign_request(
                &private_key,
                &key.key_id,
                method.as_str(),
                &target,
                body.as_deref(),
            )
            .map_err(Outcome::from)?;

            let mut request = self
                .client
                .request(method.clone(), target.clone())
                .header(header::ACCEPT, ACCEPT_ACTIVITY);
            for (name, value) in signed.iter() {
                request = request.header(name, value);
            }
            if let Some(ref body) = body {
                request = request
                    .header(header::CONTENT_TYPE, ACTIVITY_JSON)
                    .body(body.clone());
            }

            let response = request.send().await.map_err(outcome_for_error)?;
            let status = response.status();

            if status.is_success() {
                return Ok(response);
            }
            if !status.is_redirection() {
                return Err(outcome_for_response(&response));
            }

            let location = response
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|loc| target.join(loc).ok());
            match location {
                Some(next) if hop < MAX_REDIRECTS => {
                    debug!(from = %target, to = %next, status = %status, "Following redirect");
                    target = next;
                }
                Some(_) => {
                    warn!(target = %target, "Too many redirects");
                    return Err(Outcome::transient(format!("too many redirects at {target}")));
                }
                None => {
                    return Err(Outcome::transient(format!(
                        "redirect {status} without usable Location from {target}"
                    )));
                }
            }
        }

        Err(Outcome::transient(format!("too many redirects at {target}")))
    }
}

#[async_trait]
impl ObjectFetcher for DeliveryExecutor {
    async fn fetch_object(&self, url: &str) -> AppResult<Value> {
        let target = Url::parse(url)
            .map_err(|e| AppError::BadRequest(format!("Invalid URL {url}: {e}")))?;

        let response = self
            .client
            .get(target)
            .header(header::ACCEPT, ACCEPT_ACTIVITY)
            .send()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to fetch {url}: {}", e.without_url())))?;

        let status = response.status();
        if !status.is_success() {
            return Err(match classify_status(status.as_u16()) {
                Outcome::PermanentFailure(_) => {
                    AppError::NotFound(format!("{url} returned {status}"))
                }
                _ => AppError::Federation(format!("{url} returned {status}")),
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| AppError::BadRequest(format!("Invalid JSON from {url}: {e}")))
    }
}
