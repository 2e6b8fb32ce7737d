//! Core job types and policies.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::from_str(s).map(Self)
    }
}

/// Logical queue a job lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Outbound notification mail.
    Email,
    /// Maintenance and recurring tasks.
    Scheduled,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Email, Channel::Scheduled];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Scheduled => "scheduled",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(Channel::Email),
            "scheduled" => Ok(Channel::Scheduled),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

/// Notification mail kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    FeedbackCreated,
    FeedbackUpdated,
    FeedbackApproved,
    FeedbackRejected,
    WelcomeEmail,
    ReminderEmail,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::FeedbackCreated => "feedback_created",
            NotificationKind::FeedbackUpdated => "feedback_updated",
            NotificationKind::FeedbackApproved => "feedback_approved",
            NotificationKind::FeedbackRejected => "feedback_rejected",
            NotificationKind::WelcomeEmail => "welcome_email",
            NotificationKind::ReminderEmail => "reminder_email",
        }
    }
}

/// Maintenance routines run from the scheduled channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceTask {
    CleanupOldFeedback,
    GenerateDailyReport,
    SendReminderEmails,
}

impl MaintenanceTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaintenanceTask::CleanupOldFeedback => "cleanup_old_feedback",
            MaintenanceTask::GenerateDailyReport => "generate_daily_report",
            MaintenanceTask::SendReminderEmails => "send_reminder_emails",
        }
    }
}

/// Job kind for routing to the channel's handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "family", content = "type", rename_all = "snake_case")]
pub enum JobKind {
    Notification(NotificationKind),
    Maintenance(MaintenanceTask),
}

impl JobKind {
    /// The only channel this kind may be enqueued on.
    pub fn channel(&self) -> Channel {
        match self {
            JobKind::Notification(_) => Channel::Email,
            JobKind::Maintenance(_) => Channel::Scheduled,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            JobKind::Notification(kind) => kind.as_str(),
            JobKind::Maintenance(task) => task.as_str(),
        }
    }
}

impl From<NotificationKind> for JobKind {
    fn from(kind: NotificationKind) -> Self {
        JobKind::Notification(kind)
    }
}

impl From<MaintenanceTask> for JobKind {
    fn from(task: MaintenanceTask) -> Self {
        JobKind::Maintenance(task)
    }
}

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued, ready to be claimed
    Waiting,
    /// Waiting for its retry (or initial) delay to elapse
    Delayed,
    /// Claimed by exactly one worker
    Active,
    /// Acknowledged
    Completed,
    /// Retries exhausted (dead-lettered)
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(failed attempts - 1)
    Exponential,
}

/// Maps a failed-attempt count to the delay before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub kind: BackoffKind,
    pub base_delay: Duration,
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            base_delay: delay,
        }
    }

    pub fn exponential(base_delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_delay,
        }
    }

    /// Delay before the attempt following the `failed_attempts`-th failure (1-indexed).
    pub fn delay_for_attempt(&self, failed_attempts: u32) -> Duration {
        if failed_attempts == 0 {
            return Duration::ZERO;
        }

        match self.kind {
            BackoffKind::Fixed => self.base_delay,
            BackoffKind::Exponential => {
                let factor = 2u32.saturating_pow(failed_attempts - 1);
                self.base_delay.saturating_mul(factor)
            }
        }
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_secs(2))
    }
}

impl RetryPolicy {
    /// A single attempt, never retried.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::fixed(Duration::ZERO),
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::fixed(delay),
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::exponential(base_delay),
        }
    }

    /// Check if another attempt is allowed after `attempts` finished attempts.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Per-enqueue overrides of the channel defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    pub max_attempts: Option<u32>,
    pub backoff: Option<Backoff>,
    /// Initial delay before the first attempt becomes claimable.
    pub delay: Option<Duration>,
}

impl JobOptions {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Resolve these overrides against a channel default.
    pub fn resolve(&self, default: RetryPolicy) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(default.max_attempts).max(1),
            backoff: self.backoff.unwrap_or(default.backoff),
        }
    }
}

/// A queued unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub channel: Channel,
    pub kind: JobKind,
    /// Opaque data the handler needs (e.g. the notification payload)
    pub payload: serde_json::Value,
    /// Finished attempts so far
    pub attempts: u32,
    pub retry_policy: RetryPolicy,
    pub state: JobState,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time the job may be claimed (delayed jobs)
    pub ready_at: Option<DateTime<Utc>>,
    /// Start of the attempt in progress
    pub started_at: Option<DateTime<Utc>>,
    /// Execution history (one record per finished attempt)
    pub history: Vec<JobAttemptRecord>,
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// What a failed attempt resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Re-queued in the delayed state.
    Retry { delay: Duration },
    /// Retries exhausted.
    DeadLettered,
}

impl Job {
    /// Create a new job; `delay` puts it in the delayed state first.
    pub fn new(
        kind: JobKind,
        payload: serde_json::Value,
        retry_policy: RetryPolicy,
        delay: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Self {
        let (state, ready_at) = match delay.filter(|d| !d.is_zero()) {
            Some(delay) => (JobState::Delayed, Some(now + to_chrono(delay))),
            None => (JobState::Waiting, None),
        };

        Self {
            id: JobId::new(),
            channel: kind.channel(),
            kind,
            payload,
            attempts: 0,
            retry_policy,
            state,
            last_error: None,
            created_at: now,
            updated_at: now,
            ready_at,
            started_at: None,
            history: Vec::new(),
        }
    }

    /// Check if the job may be claimed at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Waiting => true,
            JobState::Delayed => self.ready_at.is_none_or(|at| now >= at),
            _ => false,
        }
    }

    /// Mark job as claimed.
    pub fn mark_active(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Active;
        self.ready_at = None;
        self.started_at = Some(now);
        self.updated_at = now;
    }

    /// Mark job as completed.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.attempts += 1;
        self.record_attempt(now, None);
        self.state = JobState::Completed;
        self.last_error = None;
        self.updated_at = now;
    }

    /// Record a failed attempt and decide between retry and dead-letter.
    pub fn mark_failed(&mut self, error: String, now: DateTime<Utc>) -> FailureOutcome {
        self.attempts += 1;
        self.record_attempt(now, Some(error.clone()));
        self.last_error = Some(error);
        self.updated_at = now;

        if self.retry_policy.should_retry(self.attempts) {
            let delay = self.retry_policy.backoff.delay_for_attempt(self.attempts);
            self.state = JobState::Delayed;
            self.ready_at = Some(now + to_chrono(delay));
            FailureOutcome::Retry { delay }
        } else {
            self.state = JobState::Failed;
            self.ready_at = None;
            FailureOutcome::DeadLettered
        }
    }

    /// Put an abandoned active job back in line without consuming an attempt.
    pub fn mark_stalled(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Waiting;
        self.started_at = None;
        self.ready_at = None;
        self.updated_at = now;
    }

    /// Reset a dead-lettered job for manual replay.
    pub fn reset_for_replay(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Waiting;
        self.attempts = 0;
        self.last_error = None;
        self.ready_at = None;
        self.started_at = None;
        self.history.clear();
        self.updated_at = now;
    }

    fn record_attempt(&mut self, now: DateTime<Utc>, error: Option<String>) {
        let started_at = self.started_at.take().unwrap_or(now);
        self.history.push(JobAttemptRecord {
            attempt: self.attempts,
            started_at,
            finished_at: now,
            success: error.is_none(),
            error,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }
}

/// Per-state job counts for one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
}

pub(crate) fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX)
}
