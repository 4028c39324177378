//! Inbound HTTP surface.
//!
//! Accepted connections are served one at a time by a worker. Inbox requests
//! are only persisted as jobs here; processing happens later in the queue.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use serde_json::{Value, json};
use chrono::{DateTime, Utc};
use tern_common::{AppError, HttpSignature, calculate_digest};
use tern_queue::{ConnectionHandler, Federator, RequestMeta, ServerState, StateSnapshot};
use tokio::net::TcpStream;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Largest accepted inbox payload.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// How far a signed `Date` may be from our clock.
const MAX_DATE_SKEW: chrono::TimeDelta = chrono::TimeDelta::hours(12);

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Persists accepted activities as inbound jobs.
    pub federator: Federator,
    /// Runtime state reported by `/status`.
    pub state: Arc<ServerState>,
}

/// [`AppError`] rendered as a JSON error response.
#[derive(Debug)]
pub struct HttpError(pub AppError);

impl From<AppError> for HttpError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let code = self.0.error_code();

        if self.0.is_client_error() {
            debug!(error = %self.0, code, "Client error occurred");
        } else {
            tracing::error!(error = %self.0, code, "Server error occurred");
        }

        let body = Json(json!({
            "error": {
                "code": code,
                "message": self.0.to_string(),
            }
        }));
        (status, body).into_response()
    }
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/inbox", post(shared_inbox_handler))
        .route("/users/{username}/inbox", post(user_inbox_handler))
        .route("/status", get(status_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn header_value(headers: &HeaderMap, name: impl header::AsHeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

fn request_meta(path: String, headers: &HeaderMap) -> RequestMeta {
    let signature = header_value(headers, "signature");
    let key_id = signature
        .as_deref()
        .and_then(|s| HttpSignature::parse(s).ok())
        .map(|s| s.key_id);

    RequestMeta {
        path,
        host: header_value(headers, header::HOST),
        date: header_value(headers, header::DATE),
        digest: header_value(headers, "digest"),
        signature,
        key_id,
        content_type: header_value(headers, header::CONTENT_TYPE),
    }
}

/// Cheap checks before a request is persisted. The signature itself is
/// verified when the job runs, against the actor's current key.
fn check_request_headers(headers: &HeaderMap, body: &[u8]) -> Result<(), AppError> {
    if !headers.contains_key("signature") {
        return Err(AppError::Unauthorized("Missing Signature header".to_string()));
    }

    let digest = header_value(headers, "digest")
        .ok_or_else(|| AppError::BadRequest("Missing Digest header".to_string()))?;
    if digest != calculate_digest(body) {
        return Err(AppError::BadRequest("Digest does not match body".to_string()));
    }

    if let Some(date) = header_value(headers, header::DATE) {
        let date = DateTime::parse_from_rfc2822(&date)
            .map_err(|e| AppError::BadRequest(format!("Invalid Date header: {e}")))?;
        if (Utc::now() - date.with_timezone(&Utc)).abs() > MAX_DATE_SKEW {
            return Err(AppError::Unauthorized(format!(
                "Date {date} is outside the accepted window"
            )));
        }
    }
    Ok(())
}

async fn accept_activity(
    app: &AppState,
    owner: Option<&str>,
    path: String,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<StatusCode, HttpError> {
    check_request_headers(headers, body).inspect_err(|e| {
        warn!(error = %e, path = %path, "Rejected inbox request");
    })?;

    let activity: Value = serde_json::from_slice(body).map_err(|e| {
        warn!(error = %e, "Failed to parse activity");
        AppError::BadRequest(format!("Invalid activity JSON: {e}"))
    })?;
    if !activity.is_object() {
        return Err(AppError::BadRequest("Activity must be a JSON object".to_string()).into());
    }

    let activity_type = activity["type"].as_str().unwrap_or("-").to_string();
    let meta = request_meta(path, headers);
    let id = app
        .federator
        .enqueue_inbound(owner, activity, meta)
        .await?;

    info!(
        job_id = %id,
        owner = owner.unwrap_or("-"),
        activity_type = %activity_type,
        "Received activity"
    );
    Ok(StatusCode::ACCEPTED)
}

async fn shared_inbox_handler(
    State(app): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, HttpError> {
    accept_activity(&app, None, "/inbox".to_string(), &headers, &body).await
}

async fn user_inbox_handler(
    State(app): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, HttpError> {
    let path = format!("/users/{username}/inbox");
    accept_activity(&app, Some(&username), path, &headers, &body).await
}

async fn status_handler(State(app): State<AppState>) -> Json<StateSnapshot> {
    Json(app.state.snapshot())
}

/// Serves one connection per call with HTTP/1.1 and no keep-alive, so a
/// worker is never parked on an idle client.
#[derive(Clone)]
pub struct HttpConnectionHandler {
    router: Router,
    timeout: Duration,
}

impl HttpConnectionHandler {
    /// Create a handler; `timeout` bounds the whole connection.
    #[must_use]
    pub const fn new(router: Router, timeout: Duration) -> Self {
        Self { router, timeout }
    }
}

#[async_trait]
impl ConnectionHandler for HttpConnectionHandler {
    async fn serve(&self, stream: TcpStream, peer: SocketAddr) -> tern_common::AppResult<()> {
        let service = TowerToHyperService::new(self.router.clone());
        let connection = http1::Builder::new()
            .keep_alive(false)
            .serve_connection(TokioIo::new(stream), service);

        match tokio::time::timeout(self.timeout, connection).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(AppError::Internal(format!("Connection from {peer} failed: {e}"))),
            Err(_) => Err(AppError::Internal(format!("Connection from {peer} timed out"))),
        }
    }
}
