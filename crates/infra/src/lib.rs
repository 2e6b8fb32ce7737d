//! `echoboard-infra`: background job infrastructure.
//!
//! Durable per-channel job queues, worker pools with retry/backoff, a health
//! monitor that rebuilds workers after backend outages, cron-driven
//! recurring jobs, and transactional email delivery.

pub mod config;
pub mod feedback;
pub mod health;
pub mod jobs;
pub mod maintenance;
pub mod notifications;
pub mod scheduling;
pub mod service;
pub mod workers;

#[cfg(test)]
pub(crate) mod testing;


pub use config::{ConfigError, RedisConfig, WorkerConfig};
pub use feedback::{FeedbackStatusUpdater, StatusUpdate, UpdateError};
pub use health::{HealthMonitor, HealthMonitorConfig, HealthState};
pub use maintenance::{
    LoggingMaintenance, MaintenanceRoutines, ReminderAudience, ReminderRecipient,
    ScheduledTaskHandler, StaticReminderAudience,
};
pub use scheduling::{RecurringSchedule, RecurringScheduler, SchedulerError};
pub use service::{QueueService, QueueStats, ServiceCollaborators};
