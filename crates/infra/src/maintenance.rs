//! Scheduled-channel job handler and its collaborators.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::jobs::{Channel, Job, JobKind, JobOptions, JobQueue, MaintenanceTask, NotificationKind};
use crate::notifications::{EmailPayload, TemplateData};
use crate::workers::{HandlerError, JobHandler};

/// Maintenance routines backed by the application's storage.
#[async_trait]
pub trait MaintenanceRoutines: Send + Sync {
    async fn cleanup_old_feedback(&self) -> Result<(), HandlerError>;
    async fn generate_daily_report(&self) -> Result<(), HandlerError>;
}

/// Routines that only record that they ran.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingMaintenance;

#[async_trait]
impl MaintenanceRoutines for LoggingMaintenance {
    async fn cleanup_old_feedback(&self) -> Result<(), HandlerError> {
        info!("old feedback cleanup completed");
        Ok(())
    }

    async fn generate_daily_report(&self) -> Result<(), HandlerError> {
        info!("daily report generated");
        Ok(())
    }
}

/// Someone who should receive a reminder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderRecipient {
    pub email: String,
    pub name: Option<String>,
}

/// Decides who gets reminded. Eligibility rules belong to the application.
#[async_trait]
pub trait ReminderAudience: Send + Sync {
    async fn recipients(&self) -> Result<Vec<ReminderRecipient>, HandlerError>;
}

/// Fixed recipient list.
#[derive(Debug, Clone, Default)]
pub struct StaticReminderAudience {
    recipients: Vec<ReminderRecipient>,
}

impl StaticReminderAudience {
    pub fn new(recipients: Vec<ReminderRecipient>) -> Self {
        Self { recipients }
    }

    /// Reminds only the verified address, when one is configured.
    pub fn verified(email: Option<String>) -> Self {
        Self::new(
            email
                .into_iter()
                .map(|email| ReminderRecipient {
                    email,
                    name: Some("EchoBoard User".to_string()),
                })
                .collect(),
        )
    }
}

#[async_trait]
impl ReminderAudience for StaticReminderAudience {
    async fn recipients(&self) -> Result<Vec<ReminderRecipient>, HandlerError> {
        Ok(self.recipients.clone())
    }
}

/// Dispatches scheduled jobs to their routine.
pub struct ScheduledTaskHandler {
    queue: Arc<JobQueue>,
    routines: Arc<dyn MaintenanceRoutines>,
    audience: Arc<dyn ReminderAudience>,
    dashboard_url: String,
}

impl ScheduledTaskHandler {
    pub fn new(
        queue: Arc<JobQueue>,
        routines: Arc<dyn MaintenanceRoutines>,
        audience: Arc<dyn ReminderAudience>,
        dashboard_url: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            routines,
            audience,
            dashboard_url: dashboard_url.into(),
        }
    }

    /// Enqueue one reminder notification per recipient. Errors propagate so
    /// the scheduled job is retried.
    async fn send_reminders(&self) -> Result<usize, HandlerError> {
        let recipients = self.audience.recipients().await?;
        for recipient in &recipients {
            let mut data = TemplateData::default().with_dashboard_url(self.dashboard_url.clone());
            data.user_name = recipient.name.clone();
            let payload = EmailPayload::new(recipient.email.clone(), data);

            self.queue
                .enqueue(
                    Channel::Email,
                    NotificationKind::ReminderEmail,
                    &payload,
                    JobOptions::default(),
                )
                .await?;
        }
        Ok(recipients.len())
    }
}

#[async_trait]
impl JobHandler for ScheduledTaskHandler {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        let JobKind::Maintenance(task) = job.kind else {
            return Err(HandlerError::UnsupportedKind(job.kind.type_name()));
        };

        info!(job_id = %job.id, task = task.as_str(), "running scheduled task");
        match task {
            MaintenanceTask::CleanupOldFeedback => self.routines.cleanup_old_feedback().await,
            MaintenanceTask::GenerateDailyReport => self.routines.generate_daily_report().await,
            MaintenanceTask::SendReminderEmails => {
                let queued = self.send_reminders().await?;
                info!(job_id = %job.id, queued, "reminder emails queued");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;

    use super::*;
    use crate::jobs::{InMemoryJobStore, JobState, RetryPolicy};

    #[derive(Default)]
    struct CountingRoutines {
        cleanups: AtomicUsize,
        reports: AtomicUsize,
    }

    #[async_trait]
    impl MaintenanceRoutines for CountingRoutines {
        async fn cleanup_old_feedback(&self) -> Result<(), HandlerError> {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn generate_daily_report(&self) -> Result<(), HandlerError> {
            self.reports.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::Failed("report storage offline".to_string()))
        }
    }

    fn job(task: MaintenanceTask) -> Job {
        Job::new(task.into(), serde_json::Value::Null, RetryPolicy::default(), None, Utc::now())
    }

    #[tokio::test]
    async fn dispatches_to_routines() {
        let queue = Arc::new(JobQueue::new(InMemoryJobStore::arc()));
        let routines = Arc::new(CountingRoutines::default());
        let handler = ScheduledTaskHandler::new(
            queue,
            routines.clone(),
            Arc::new(StaticReminderAudience::default()),
            "https://echoboard.dev",
        );

        handler.handle(&job(MaintenanceTask::CleanupOldFeedback)).await.unwrap();
        let err = handler
            .handle(&job(MaintenanceTask::GenerateDailyReport))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("report storage offline"));
        assert_eq!(routines.cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(routines.reports.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reminder_broadcast_enqueues_one_notification_per_recipient() {
        let queue = Arc::new(JobQueue::new(InMemoryJobStore::arc()));
        let audience = StaticReminderAudience::new(vec![
            ReminderRecipient {
                email: "a@x.com".to_string(),
                name: Some("Ada".to_string()),
            },
            ReminderRecipient {
                email: "b@x.com".to_string(),
                name: None,
            },
        ]);
        let handler = ScheduledTaskHandler::new(
            queue.clone(),
            Arc::new(LoggingMaintenance),
            Arc::new(audience),
            "https://echoboard.dev",
        );

        handler.handle(&job(MaintenanceTask::SendReminderEmails)).await.unwrap();

        let waiting = queue.list(Channel::Email, JobState::Waiting, 10).await.unwrap();
        assert_eq!(waiting.len(), 2);
        assert!(waiting
            .iter()
            .all(|j| j.kind == JobKind::Notification(NotificationKind::ReminderEmail)));
        let first: EmailPayload = serde_json::from_value(waiting[0].payload.clone()).unwrap();
        assert_eq!(first.to, "a@x.com");
        assert_eq!(first.data.dashboard_url.as_deref(), Some("https://echoboard.dev"));
    }

    #[tokio::test]
    async fn verified_audience_is_empty_without_address() {
        let audience = StaticReminderAudience::verified(None);
        assert!(audience.recipients().await.unwrap().is_empty());

        let audience = StaticReminderAudience::verified(Some("dev@x.com".to_string()));
        assert_eq!(audience.recipients().await.unwrap()[0].email, "dev@x.com");
    }

    #[tokio::test]
    async fn reminder_fails_when_queue_is_down() {
        let store = InMemoryJobStore::arc();
        let queue = Arc::new(JobQueue::new(store.clone()));
        let handler = ScheduledTaskHandler::new(
            queue,
            Arc::new(LoggingMaintenance),
            Arc::new(StaticReminderAudience::verified(Some("dev@x.com".to_string()))),
            "https://echoboard.dev",
        );

        store.set_reachable(false);
        let err = handler
            .handle(&job(MaintenanceTask::SendReminderEmails))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Queue(_)));
    }
}
