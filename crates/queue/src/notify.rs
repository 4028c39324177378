//! Outbound notification transports: email, Telegram and ntfy.

use std::sync::Arc;

use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use reqwest::{Client, header};
use serde_json::json;
use tern_common::config::NotifyConfig;
use tern_common::{AppError, AppResult};
use tracing::{debug, info};

use crate::delivery::{Outcome, outcome_for_error, outcome_for_response};

const TELEGRAM_API: &str = "https://api.telegram.org";

struct Smtp {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

/// Sends notification jobs.
#[derive(Clone)]
pub struct Notifier {
    client: Client,
    smtp: Option<Arc<Smtp>>,
    telegram_api: String,
}

impl Notifier {
    /// Create a notifier. Email is only available when SMTP is configured.
    pub fn new(config: &NotifyConfig, client: Client) -> AppResult<Self> {
        let smtp = match config.smtp {
            Some(ref smtp) => {
                let from = smtp.from.parse::<Mailbox>().map_err(|e| {
                    AppError::Config(format!("Invalid SMTP from address {}: {e}", smtp.from))
                })?;
                let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.host)
                    .map_err(|e| AppError::Config(format!("Invalid SMTP relay: {e}")))?
                    .port(smtp.port);
                if let (Some(user), Some(pass)) = (&smtp.username, &smtp.password) {
                    builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
                }
                info!(host = %smtp.host, port = smtp.port, "SMTP transport configured");
                Some(Arc::new(Smtp {
                    transport: builder.build(),
                    from,
                }))
            }
            None => None,
        };

        Ok(Self {
            client,
            smtp,
            telegram_api: TELEGRAM_API.to_string(),
        })
    }

    /// Point Telegram requests at a different API base URL.
    #[must_use]
    pub fn with_telegram_api(mut self, base: impl Into<String>) -> Self {
        self.telegram_api = base.into().trim_end_matches('/').to_string();
        self
    }

    /// Whether email can be sent.
    #[must_use]
    pub fn email_enabled(&self) -> bool {
        self.smtp.is_some()
    }

    /// Send a plain-text email.
    pub async fn send_email(&self, to: &str, subject: &str, body: &str) -> Outcome {
        let Some(ref smtp) = self.smtp else {
            return Outcome::permanent("SMTP is not configured");
        };
        let recipient = match to.parse::<Mailbox>() {
            Ok(m) => m,
            Err(e) => return Outcome::permanent(format!("invalid recipient {to}: {e}")),
        };
        let message = match Message::builder()
            .from(smtp.from.clone())
            .to(recipient)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
        {
            Ok(m) => m,
            Err(e) => return Outcome::permanent(format!("invalid email: {e}")),
        };

        match smtp.transport.send(message).await {
            Ok(response) => {
                debug!(to, code = %response.code(), "Email sent");
                Outcome::Delivered
            }
            Err(e) if e.is_permanent() => Outcome::permanent(format!("SMTP rejected: {e}")),
            Err(e) => Outcome::transient(format!("SMTP failed: {e}")),
        }
    }

    /// Send a Telegram message through the Bot API.
    pub async fn send_telegram(&self, bot_token: &str, chat_id: &str, text: &str) -> Outcome {
        let url = format!("{}/bot{bot_token}/sendMessage", self.telegram_api);
        let request = self
            .client
            .post(url)
            .json(&json!({ "chat_id": chat_id, "text": text }));

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(chat_id, "Telegram message sent");
                Outcome::Delivered
            }
            Ok(response) => outcome_for_response(&response),
            Err(e) => outcome_for_error(e),
        }
    }

    /// Publish a message to an ntfy topic.
    pub async fn send_ntfy(
        &self,
        server: &str,
        topic: &str,
        token: Option<&str>,
        title: Option<&str>,
        message: &str,
    ) -> Outcome {
        let url = format!("{}/{topic}", server.trim_end_matches('/'));
        let mut request = self.client.post(url).body(message.to_string());
        if let Some(title) = title {
            request = request.header("Title", title);
        }
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(server, topic, "ntfy message published");
                Outcome::Delivered
            }
            Ok(response) => outcome_for_response(&response),
            Err(e) => outcome_for_error(e),
        }
    }
}
