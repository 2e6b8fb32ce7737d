//! Queue service: the explicitly constructed owner of the queue, worker pools,
//! recurring schedules and health monitor for one process.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::health::{HealthMonitor, HealthMonitorConfig, HealthState};
use crate::jobs::{
    Channel, JobCounts, JobId, JobKind, JobOptions, JobQueue, JobStore, MaintenanceTask, QueueError,
};
use crate::maintenance::{MaintenanceRoutines, ReminderAudience, ScheduledTaskHandler};
use crate::notifications::{Mailer, NotificationHandler, NotificationProducer};
use crate::scheduling::{RecurringScheduler, SchedulerError};
use crate::workers::{HandlerRegistry, WorkerSupervisor};

/// Snapshot for the operational health endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub per_channel: BTreeMap<Channel, JobCounts>,
    pub workers_running: BTreeMap<Channel, bool>,
    /// Set when the counts could not be read; counts are then zeroed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Collaborators supplied by the host application.
pub struct ServiceCollaborators {
    pub store: Arc<dyn JobStore>,
    pub mailer: Arc<dyn Mailer>,
    pub routines: Arc<dyn MaintenanceRoutines>,
    pub audience: Arc<dyn ReminderAudience>,
}

pub struct QueueService {
    queue: Arc<JobQueue>,
    supervisor: Arc<WorkerSupervisor>,
    producer: NotificationProducer,
    scheduler: RecurringScheduler,
    monitor: Arc<HealthMonitor>,
    cancel: CancellationToken,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for QueueService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueService")
            .field("queue", &self.queue)
            .field("supervisor", &self.supervisor)
            .finish_non_exhaustive()
    }
}

impl QueueService {
    pub fn new(
        queue: Arc<JobQueue>,
        supervisor: Arc<WorkerSupervisor>,
        producer: NotificationProducer,
        scheduler: RecurringScheduler,
        health: HealthMonitorConfig,
    ) -> Self {
        let monitor = Arc::new(HealthMonitor::new(supervisor.clone(), health));
        Self {
            queue,
            supervisor,
            producer,
            scheduler,
            monitor,
            cancel: CancellationToken::new(),
            monitor_task: Mutex::new(None),
        }
    }

    /// Wire the queue, both channel handlers, producer and scheduler from
    /// configuration.
    pub async fn assemble(
        collaborators: ServiceCollaborators,
        config: &WorkerConfig,
    ) -> Result<Self, SchedulerError> {
        let queue = Arc::new(
            JobQueue::new(collaborators.store)
                .with_channel_config(Channel::Email, config.channel_config(Channel::Email))
                .with_channel_config(Channel::Scheduled, config.channel_config(Channel::Scheduled)),
        );

        let notifications = Arc::new(NotificationHandler::new(
            collaborators.mailer,
            config.mail.clone(),
        ));
        let scheduled = Arc::new(ScheduledTaskHandler::new(
            queue.clone(),
            collaborators.routines,
            collaborators.audience,
            config.mail.dashboard_url.clone(),
        ));
        let handlers = HandlerRegistry::new()
            .register(Channel::Email, notifications)
            .register(Channel::Scheduled, scheduled);

        let supervisor = Arc::new(WorkerSupervisor::new(queue.clone(), handlers, config.supervisor));
        let producer = NotificationProducer::new(
            queue.clone(),
            config.enqueue_timeout,
            config.mail.dashboard_url.clone(),
        );
        let scheduler = RecurringScheduler::new(queue.clone()).await?;

        Ok(Self::new(queue, supervisor, producer, scheduler, config.health))
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn supervisor(&self) -> &Arc<WorkerSupervisor> {
        &self.supervisor
    }

    pub fn producer(&self) -> &NotificationProducer {
        &self.producer
    }

    pub fn health(&self) -> HealthState {
        self.monitor.state()
    }

    /// Start worker pools, the recurring scheduler and the health monitor.
    ///
    /// An unreachable backend is not fatal: the monitor rebuilds the pools
    /// once it answers.
    pub async fn start(&self) -> Result<(), QueueError> {
        match self.supervisor.start().await {
            Ok(()) => {}
            Err(err) if err.is_connectivity() => {
                warn!(error = %err, "queue backend unreachable at startup; workers start on recovery");
            }
            Err(err) => return Err(err),
        }
        if let Err(err) = self.scheduler.start().await {
            error!(error = %err, "recurring scheduler failed to start");
        }

        let mut task = self.monitor_task.lock().await;
        if task.is_none() {
            *task = Some(self.monitor.clone().spawn(self.cancel.child_token()));
        }
        info!("queue service started");
        Ok(())
    }

    /// Fire-and-forget enqueue from the request path.
    pub fn enqueue_notification(
        &self,
        channel: Channel,
        kind: impl Into<JobKind>,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> JoinHandle<Option<JobId>> {
        self.producer.enqueue(channel, kind.into(), payload, options)
    }

    pub async fn schedule_recurring(
        &self,
        channel: Channel,
        kind: impl Into<JobKind>,
        cron: &str,
    ) -> Result<Uuid, SchedulerError> {
        self.scheduler.schedule_recurring(channel, kind, cron).await
    }

    /// Enqueue an immediate reminder broadcast.
    pub async fn trigger_reminder_now(&self) -> Result<JobId, QueueError> {
        let id = self
            .queue
            .enqueue(
                Channel::Scheduled,
                MaintenanceTask::SendReminderEmails,
                &serde_json::Value::Null,
                JobOptions::default(),
            )
            .await?;
        info!(job_id = %id, "reminder broadcast triggered");
        Ok(id)
    }

    /// Per-channel counts plus worker flags. Never fails: on a transport
    /// error the counts are zeroed, workers reported down and the error kept.
    pub async fn stats(&self) -> QueueStats {
        let mut per_channel = BTreeMap::new();
        for channel in Channel::ALL {
            match self.queue.stats(channel).await {
                Ok(counts) => {
                    per_channel.insert(channel, counts);
                }
                Err(err) => {
                    warn!(%channel, error = %err, "failed to read queue stats");
                    return QueueStats {
                        per_channel: Channel::ALL
                            .into_iter()
                            .map(|c| (c, JobCounts::default()))
                            .collect(),
                        workers_running: Channel::ALL.into_iter().map(|c| (c, false)).collect(),
                        error: Some(err.to_string()),
                    };
                }
            }
        }

        QueueStats {
            per_channel,
            workers_running: self.supervisor.workers_running().await,
            error: None,
        }
    }

    /// Stop the monitor and scheduler, then drain the pools within the grace
    /// deadline.
    pub async fn shutdown(&self) {
        info!("queue service shutting down");
        self.cancel.cancel();
        if let Some(task) = self.monitor_task.lock().await.take() {
            if let Err(err) = task.await {
                warn!(error = %err, "health monitor task ended abnormally");
            }
        }
        if let Err(err) = self.scheduler.shutdown().await {
            warn!(error = %err, "recurring scheduler did not stop cleanly");
        }
        self.supervisor.stop().await;
        info!("queue service stopped");
    }
}
