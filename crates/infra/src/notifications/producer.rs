//! Fire-and-forget notification producer used by the request path.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use echoboard_feedback::{Author, FeedbackRecord};

use crate::jobs::{Channel, JobId, JobKind, JobOptions, JobQueue, NotificationKind, QueueError};

use super::payload::EmailPayload;

/// Enqueues notification jobs without ever failing the caller.
///
/// Each call spawns an independent task bounded by the enqueue timeout;
/// failures are logged and dropped. Delivery is best-effort: a job lost
/// during a transport outage is not recovered.
#[derive(Clone)]
pub struct NotificationProducer {
    queue: Arc<JobQueue>,
    enqueue_timeout: Duration,
    dashboard_url: String,
}

impl std::fmt::Debug for NotificationProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationProducer")
            .field("enqueue_timeout", &self.enqueue_timeout)
            .field("dashboard_url", &self.dashboard_url)
            .finish_non_exhaustive()
    }
}

impl NotificationProducer {
    pub fn new(queue: Arc<JobQueue>, enqueue_timeout: Duration, dashboard_url: impl Into<String>) -> Self {
        Self {
            queue,
            enqueue_timeout,
            dashboard_url: dashboard_url.into(),
        }
    }

    /// Enqueue with the timeout applied, surfacing the error.
    pub async fn try_enqueue(
        &self,
        channel: Channel,
        kind: JobKind,
        payload: &serde_json::Value,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        let enqueue = self.queue.enqueue(channel, kind, payload, options);
        match tokio::time::timeout(self.enqueue_timeout, enqueue).await {
            Ok(result) => result,
            Err(_) => Err(QueueError::Timeout(self.enqueue_timeout)),
        }
    }

    /// Spawn the enqueue and return immediately. The handle resolves to the
    /// job id, or `None` when the enqueue failed (already logged).
    pub fn enqueue(
        &self,
        channel: Channel,
        kind: JobKind,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> JoinHandle<Option<JobId>> {
        let producer = self.clone();
        tokio::spawn(async move {
            match producer.try_enqueue(channel, kind, &payload, options).await {
                Ok(id) => {
                    debug!(%channel, job_id = %id, kind = kind.type_name(), "job queued");
                    Some(id)
                }
                Err(err) => {
                    warn!(
                        %channel,
                        kind = kind.type_name(),
                        error = %err,
                        "failed to queue job; continuing without it"
                    );
                    None
                }
            }
        })
    }

    /// Fire-and-forget enqueue of an email notification.
    pub fn enqueue_notification(
        &self,
        kind: NotificationKind,
        payload: EmailPayload,
        options: JobOptions,
    ) -> JoinHandle<Option<JobId>> {
        match serde_json::to_value(&payload) {
            Ok(value) => self.enqueue(Channel::Email, kind.into(), value, options),
            Err(err) => {
                warn!(kind = kind.as_str(), error = %err, "notification payload not serializable");
                tokio::spawn(async { None })
            }
        }
    }

    pub fn feedback_created(&self, record: &FeedbackRecord) -> JoinHandle<Option<JobId>> {
        self.enqueue_notification(
            NotificationKind::FeedbackCreated,
            EmailPayload::for_feedback(record),
            JobOptions::default(),
        )
    }

    pub fn feedback_updated(&self, record: &FeedbackRecord) -> JoinHandle<Option<JobId>> {
        self.enqueue_notification(
            NotificationKind::FeedbackUpdated,
            EmailPayload::for_feedback(record),
            JobOptions::default(),
        )
    }

    pub fn feedback_approved(&self, record: &FeedbackRecord) -> JoinHandle<Option<JobId>> {
        let mut payload = EmailPayload::for_feedback(record);
        payload.data = payload.data.with_dashboard_url(self.dashboard_url.clone());
        self.enqueue_notification(NotificationKind::FeedbackApproved, payload, JobOptions::default())
    }

    pub fn feedback_rejected(&self, record: &FeedbackRecord) -> JoinHandle<Option<JobId>> {
        let mut payload = EmailPayload::for_feedback(record);
        payload.data = payload.data.with_dashboard_url(self.dashboard_url.clone());
        self.enqueue_notification(NotificationKind::FeedbackRejected, payload, JobOptions::default())
    }

    pub fn welcome(&self, user: &Author) -> JoinHandle<Option<JobId>> {
        self.enqueue_notification(
            NotificationKind::WelcomeEmail,
            EmailPayload::for_user(user),
            JobOptions::default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use echoboard_core::UserId;
    use echoboard_feedback::Rating;

    use super::*;
    use crate::jobs::{InMemoryJobStore, JobState, JobStore};

    fn author() -> Author {
        Author {
            id: UserId::new(),
            name: "Ada".to_string(),
            email: "ada@x.com".to_string(),
        }
    }

    fn producer(store: Arc<InMemoryJobStore>) -> NotificationProducer {
        let queue = Arc::new(JobQueue::new(store));
        NotificationProducer::new(queue, Duration::from_millis(200), "https://echoboard.dev")
    }

    #[tokio::test]
    async fn approved_notification_carries_feedback_and_dashboard() {
        let store = InMemoryJobStore::arc();
        let producer = producer(store.clone());
        let record =
            FeedbackRecord::new(author(), "Dark mode", "Please", Rating::new(5).unwrap()).unwrap();

        let id = producer.feedback_approved(&record).await.unwrap().unwrap();

        let job = store.get(Channel::Email, id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
        let payload: EmailPayload = serde_json::from_value(job.payload).unwrap();
        assert_eq!(payload.to, "ada@x.com");
        assert_eq!(payload.data.feedback_title.as_deref(), Some("Dark mode"));
        assert_eq!(payload.data.feedback_rating, Some(5));
        assert_eq!(payload.data.dashboard_url.as_deref(), Some("https://echoboard.dev"));
    }

    #[tokio::test]
    async fn enqueue_failure_is_swallowed() {
        let store = InMemoryJobStore::arc();
        store.set_reachable(false);
        let producer = producer(store.clone());

        let result = producer.welcome(&author()).await.unwrap();
        assert!(result.is_none());

        let err = producer
            .try_enqueue(
                Channel::Email,
                NotificationKind::WelcomeEmail.into(),
                &serde_json::json!({"to": "a@x.com"}),
                JobOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(err.is_connectivity());
    }

    #[tokio::test]
    async fn mismatched_channel_is_logged_not_raised() {
        let store = InMemoryJobStore::arc();
        let producer = producer(store.clone());

        let handle = producer.enqueue(
            Channel::Email,
            crate::jobs::MaintenanceTask::CleanupOldFeedback.into(),
            serde_json::Value::Null,
            JobOptions::default(),
        );
        assert!(handle.await.unwrap().is_none());
        assert_eq!(store.counts(Channel::Email).await.unwrap().waiting, 0);
    }
}
