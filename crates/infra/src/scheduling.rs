//! Recurring (cron) triggers that enqueue jobs on a calendar schedule.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::jobs::{Channel, JobKind, JobOptions, JobQueue};

/// Scheduler errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("failed to create scheduler: {0}")]
    CreationFailed(String),
    #[error("failed to start scheduler: {0}")]
    StartFailed(String),
    #[error("failed to stop scheduler: {0}")]
    StopFailed(String),
    #[error("invalid cron expression {cron:?}: {reason}")]
    InvalidCron { cron: String, reason: String },
    #[error("job kind {kind} cannot be scheduled on channel {channel}")]
    ChannelMismatch { kind: &'static str, channel: Channel },
    #[error("failed to register job: {0}")]
    JobRegistrationFailed(String),
}

/// One registered recurring trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurringSchedule {
    pub id: Uuid,
    pub channel: Channel,
    pub kind: JobKind,
    pub cron: String,
}

type ScheduleKey = (Channel, JobKind, String);

/// Cron-driven enqueuer. Registration is idempotent per
/// `(channel, kind, cron)`.
pub struct RecurringScheduler {
    queue: Arc<JobQueue>,
    scheduler: RwLock<JobScheduler>,
    registrations: Mutex<HashMap<ScheduleKey, Uuid>>,
}

impl std::fmt::Debug for RecurringScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecurringScheduler").finish_non_exhaustive()
    }
}

impl RecurringScheduler {
    pub async fn new(queue: Arc<JobQueue>) -> Result<Self, SchedulerError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| SchedulerError::CreationFailed(e.to_string()))?;

        Ok(Self {
            queue,
            scheduler: RwLock::new(scheduler),
            registrations: Mutex::new(HashMap::new()),
        })
    }

    /// Arm a recurring enqueue of `kind` on `channel`. Accepts five-field
    /// (minute precision) or six-field (with seconds) cron expressions.
    /// Re-registering an identical schedule returns the existing id.
    ///
    /// Registrations live in this process's memory only: a restart re-arms
    /// from scratch and two processes sharing a store each arm their own
    /// trigger. Run one scheduler per deployment.
    #[instrument(skip(self, kind))]
    pub async fn schedule_recurring(
        &self,
        channel: Channel,
        kind: impl Into<JobKind>,
        cron: &str,
    ) -> Result<Uuid, SchedulerError> {
        let kind = kind.into();
        if kind.channel() != channel {
            return Err(SchedulerError::ChannelMismatch {
                kind: kind.type_name(),
                channel,
            });
        }

        let expression = normalize_cron(cron)?;
        let key = (channel, kind, expression.clone());

        let mut registrations = self.registrations.lock().await;
        if let Some(id) = registrations.get(&key) {
            debug!(schedule_id = %id, cron = %expression, "recurring schedule already armed");
            return Ok(*id);
        }

        let queue = self.queue.clone();
        let job = CronJob::new_async(expression.as_str(), move |_id, _lock| {
            let queue = queue.clone();
            Box::pin(async move {
                match queue
                    .enqueue(channel, kind, &serde_json::Value::Null, JobOptions::default())
                    .await
                {
                    Ok(job_id) => {
                        info!(%channel, %job_id, kind = kind.type_name(), "recurring job enqueued");
                    }
                    Err(err) => {
                        error!(
                            %channel,
                            kind = kind.type_name(),
                            error = %err,
                            "recurring enqueue failed"
                        );
                    }
                }
            })
        })
        .map_err(|e| SchedulerError::InvalidCron {
            cron: cron.to_string(),
            reason: e.to_string(),
        })?;

        let id = job.guid();
        self.scheduler
            .read()
            .await
            .add(job)
            .await
            .map_err(|e| SchedulerError::JobRegistrationFailed(e.to_string()))?;

        registrations.insert(key, id);
        info!(schedule_id = %id, %channel, cron = %expression, "recurring schedule armed");
        Ok(id)
    }

    pub async fn schedules(&self) -> Vec<RecurringSchedule> {
        let registrations = self.registrations.lock().await;
        let mut schedules: Vec<_> = registrations
            .iter()
            .map(|((channel, kind, cron), id)| RecurringSchedule {
                id: *id,
                channel: *channel,
                kind: *kind,
                cron: cron.clone(),
            })
            .collect();
        schedules.sort_by(|a, b| a.cron.cmp(&b.cron).then(a.id.cmp(&b.id)));
        schedules
    }

    pub async fn start(&self) -> Result<(), SchedulerError> {
        self.scheduler
            .read()
            .await
            .start()
            .await
            .map_err(|e| SchedulerError::StartFailed(e.to_string()))?;
        info!("recurring scheduler started");
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.scheduler
            .write()
            .await
            .shutdown()
            .await
            .map_err(|e| SchedulerError::StopFailed(e.to_string()))?;
        info!("recurring scheduler stopped");
        Ok(())
    }
}

/// Prepend a seconds field to five-field expressions.
pub fn normalize_cron(cron: &str) -> Result<String, SchedulerError> {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    match fields.len() {
        5 => Ok(format!("0 {}", fields.join(" "))),
        6 | 7 => Ok(fields.join(" ")),
        n => Err(SchedulerError::InvalidCron {
            cron: cron.to_string(),
            reason: format!("expected 5 to 7 fields, got {n}"),
        }),
    }
}
