//! Email-channel job handler.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::jobs::{Job, JobKind};
use crate::workers::{HandlerError, JobHandler};

use super::mailer::{Mailer, OutboundEmail};
use super::payload::EmailPayload;
use super::templates;

/// Sender identity and delivery routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailSettings {
    pub from: String,
    /// Outside production every message goes here instead.
    pub verified_email: Option<String>,
    pub production: bool,
    /// Used when a payload carries no dashboard URL.
    pub dashboard_url: String,
}

impl Default for MailSettings {
    fn default() -> Self {
        Self {
            from: "EchoBoard <noreply@resend.dev>".to_string(),
            verified_email: None,
            production: false,
            dashboard_url: "https://echoboard.dev".to_string(),
        }
    }
}

impl MailSettings {
    /// Actual recipient for a message addressed to `to`.
    pub fn recipient_for<'a>(&'a self, to: &'a str) -> &'a str {
        match (&self.verified_email, self.production) {
            (Some(verified), false) => verified,
            _ => to,
        }
    }
}

/// Renders the job's template and hands it to the mail transport.
pub struct NotificationHandler {
    mailer: Arc<dyn Mailer>,
    settings: MailSettings,
}

impl NotificationHandler {
    pub fn new(mailer: Arc<dyn Mailer>, settings: MailSettings) -> Self {
        Self { mailer, settings }
    }
}

#[async_trait]
impl JobHandler for NotificationHandler {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        let JobKind::Notification(kind) = job.kind else {
            return Err(HandlerError::UnsupportedKind(job.kind.type_name()));
        };

        let payload: EmailPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| HandlerError::InvalidPayload(e.to_string()))?;
        let mut data = payload.data;
        if data.dashboard_url.is_none() {
            data.dashboard_url = Some(self.settings.dashboard_url.clone());
        }

        let rendered = templates::render(kind, &data)
            .map_err(|e| HandlerError::Failed(format!("template render failed: {e}")))?;
        let recipient = self.settings.recipient_for(&payload.to);
        if recipient != payload.to {
            info!(
                job_id = %job.id,
                original = %payload.to,
                redirected_to = %recipient,
                "recipient redirected outside production"
            );
        }

        let email = OutboundEmail {
            from: self.settings.from.clone(),
            to: recipient.to_string(),
            subject: payload.subject.unwrap_or(rendered.subject),
            html: rendered.html,
            text: rendered.text,
        };

        let delivery_id = self.mailer.send(&email).await?;
        info!(
            job_id = %job.id,
            kind = kind.as_str(),
            to = %email.to,
            %delivery_id,
            "notification sent"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::jobs::{MaintenanceTask, NotificationKind, RetryPolicy};
    use crate::testing::RecordingMailer;

    fn job(kind: JobKind, payload: serde_json::Value) -> Job {
        Job::new(kind, payload, RetryPolicy::default(), None, Utc::now())
    }

    #[tokio::test]
    async fn renders_and_sends_to_original_recipient_in_production() {
        let mailer = Arc::new(RecordingMailer::default());
        let settings = MailSettings {
            production: true,
            verified_email: Some("dev@x.com".to_string()),
            ..MailSettings::default()
        };
        let handler = NotificationHandler::new(mailer.clone(), settings);

        let job = job(
            NotificationKind::WelcomeEmail.into(),
            serde_json::json!({"to": "a@x.com", "data": {"user_name": "Ada"}}),
        );
        handler.handle(&job).await.unwrap();

        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "a@x.com");
        assert_eq!(sent[0].subject, "Welcome to EchoBoard!");
        assert_eq!(sent[0].from, "EchoBoard <noreply@resend.dev>");
        assert!(sent[0].text.contains("Hi Ada,"));
    }

    #[tokio::test]
    async fn redirects_to_verified_address_outside_production() {
        let mailer = Arc::new(RecordingMailer::default());
        let settings = MailSettings {
            verified_email: Some("dev@x.com".to_string()),
            ..MailSettings::default()
        };
        let handler = NotificationHandler::new(mailer.clone(), settings);

        let job = job(
            NotificationKind::ReminderEmail.into(),
            serde_json::json!({"to": "a@x.com", "subject": "Custom"}),
        );
        handler.handle(&job).await.unwrap();

        let sent = mailer.sent();
        assert_eq!(sent[0].to, "dev@x.com");
        assert_eq!(sent[0].subject, "Custom");
    }

    #[tokio::test]
    async fn transport_failure_is_a_handler_error() {
        let mailer = Arc::new(RecordingMailer::failing(2));
        let handler = NotificationHandler::new(mailer.clone(), MailSettings::default());
        let job = job(
            NotificationKind::WelcomeEmail.into(),
            serde_json::json!({"to": "a@x.com"}),
        );

        assert!(matches!(handler.handle(&job).await, Err(HandlerError::Mail(_))));
        assert!(handler.handle(&job).await.is_err());
        assert!(handler.handle(&job).await.is_ok());
    }

    #[tokio::test]
    async fn rejects_bad_payload_and_foreign_kinds() {
        let handler =
            NotificationHandler::new(Arc::new(RecordingMailer::default()), MailSettings::default());

        let bad = job(
            NotificationKind::WelcomeEmail.into(),
            serde_json::json!({"recipient": "a@x.com"}),
        );
        assert!(matches!(handler.handle(&bad).await, Err(HandlerError::InvalidPayload(_))));

        let foreign = job(MaintenanceTask::CleanupOldFeedback.into(), serde_json::Value::Null);
        assert!(matches!(
            handler.handle(&foreign).await,
            Err(HandlerError::UnsupportedKind("cleanup_old_feedback"))
        ));
    }
}
