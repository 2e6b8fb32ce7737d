//! Outbound email transport.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// Default Resend API base URL.
pub const RESEND_API_URL: &str = "https://api.resend.com";

/// A message handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// Identifier the transport assigned to an accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryId(pub String);

impl std::fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Mail transport error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MailError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("mail rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("invalid transport response: {0}")]
    InvalidResponse(String),
}

/// Outbound transport collaborator: a single synchronous send with no
/// retries of its own.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<DeliveryId, MailError>;
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

/// Mailer backed by the Resend HTTP API.
#[derive(Clone)]
pub struct ResendMailer {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl std::fmt::Debug for ResendMailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResendMailer")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ResendMailer {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: RESEND_API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl Mailer for ResendMailer {
    #[instrument(skip(self, email), fields(to = %email.to, subject = %email.subject))]
    async fn send(&self, email: &OutboundEmail) -> Result<DeliveryId, MailError> {
        let request = SendRequest {
            from: &email.from,
            to: [&email.to],
            subject: &email.subject,
            html: &email.html,
            text: &email.text,
        };

        let resp = self
            .client
            .post(format!("{}/emails", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| MailError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(MailError::Rejected {
                status: status.as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }

        let body: SendResponse = resp
            .json()
            .await
            .map_err(|e| MailError::InvalidResponse(e.to_string()))?;
        debug!(delivery_id = %body.id, "email accepted by transport");
        Ok(DeliveryId(body.id))
    }
}
