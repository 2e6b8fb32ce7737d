//! Durable queue facade: channel configuration, retry resolution and wake-ups
//! on top of a [`JobStore`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use echoboard_core::{Clock, SystemClock};

use super::store::{JobStore, StoreError};
use super::types::{
    Channel, FailureOutcome, Job, JobCounts, JobId, JobKind, JobOptions, JobState, RetryPolicy,
};

/// Per-channel queue and worker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Number of concurrent executors.
    pub concurrency: usize,
    /// Default retry policy, overridable per enqueue.
    pub retry: RetryPolicy,
    /// Completed jobs kept for inspection.
    pub keep_completed: usize,
    /// Failed (dead-lettered) jobs kept for inspection.
    pub keep_failed: usize,
    /// Upper bound on a single handler invocation.
    pub job_timeout: Duration,
    /// Idle executors re-check the store at least this often.
    pub poll_interval: Duration,
}

impl ChannelConfig {
    /// Notification mail: many light jobs.
    pub fn email() -> Self {
        Self {
            concurrency: 5,
            retry: RetryPolicy::exponential(3, Duration::from_secs(2)),
            keep_completed: 10,
            keep_failed: 5,
            job_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
        }
    }

    /// Maintenance: rare, heavier jobs.
    pub fn scheduled() -> Self {
        Self {
            concurrency: 2,
            retry: RetryPolicy::fixed(2, Duration::from_secs(5)),
            keep_completed: 10,
            keep_failed: 5,
            job_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn for_channel(channel: Channel) -> Self {
        match channel {
            Channel::Email => Self::email(),
            Channel::Scheduled => Self::scheduled(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Queue error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("job kind {kind} cannot be enqueued on channel {channel}")]
    ChannelMismatch { kind: &'static str, channel: Channel },
    #[error("invalid payload: {0}")]
    Payload(String),
    #[error("enqueue timed out after {0:?}")]
    Timeout(Duration),
}

impl QueueError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, QueueError::Store(err) if err.is_connectivity())
    }
}

/// The durable queue. Exclusively owns job state; workers and producers only
/// go through `enqueue`/`dequeue`/`ack`/`nack`.
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    configs: HashMap<Channel, ChannelConfig>,
    signals: HashMap<Channel, Arc<Notify>>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("configs", &self.configs)
            .finish_non_exhaustive()
    }
}

impl JobQueue {
    /// Queue with the default configuration for every channel.
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Self {
        let configs = Channel::ALL
            .into_iter()
            .map(|channel| (channel, ChannelConfig::for_channel(channel)))
            .collect();
        let signals = Channel::ALL
            .into_iter()
            .map(|channel| (channel, Arc::new(Notify::new())))
            .collect();

        Self {
            store,
            clock,
            configs,
            signals,
        }
    }

    pub fn with_channel_config(mut self, channel: Channel, config: ChannelConfig) -> Self {
        self.configs.insert(channel, config);
        self
    }

    pub fn config(&self, channel: Channel) -> ChannelConfig {
        self.configs
            .get(&channel)
            .cloned()
            .unwrap_or_else(|| ChannelConfig::for_channel(channel))
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Wake-up signal fired whenever a job may have become claimable.
    pub fn signal(&self, channel: Channel) -> Arc<Notify> {
        self.signals
            .get(&channel)
            .cloned()
            .unwrap_or_else(|| Arc::new(Notify::new()))
    }

    fn wake(&self, channel: Channel) {
        if let Some(signal) = self.signals.get(&channel) {
            signal.notify_one();
        }
    }

    /// Persist a new job and return its id.
    pub async fn enqueue<P: Serialize>(
        &self,
        channel: Channel,
        kind: impl Into<JobKind>,
        payload: &P,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        let kind = kind.into();
        if kind.channel() != channel {
            return Err(QueueError::ChannelMismatch {
                kind: kind.type_name(),
                channel,
            });
        }

        let payload =
            serde_json::to_value(payload).map_err(|e| QueueError::Payload(e.to_string()))?;
        let retry = options.resolve(self.config(channel).retry);
        let job = Job::new(kind, payload, retry, options.delay, self.clock.now());
        let id = job.id;
        let delayed = job.state == JobState::Delayed;

        self.store.push(job).await?;
        debug!(%channel, job_id = %id, kind = kind.type_name(), delayed, "job enqueued");

        if !delayed {
            self.wake(channel);
        }
        Ok(id)
    }

    /// Claim at most one job. The returned job is owned by the caller until it
    /// is handed back through [`ack`](Self::ack) or [`nack`](Self::nack).
    pub async fn dequeue(&self, channel: Channel) -> Result<Option<Job>, QueueError> {
        let job = self.store.claim_next(channel, self.clock.now()).await?;
        if let Some(job) = &job {
            debug!(%channel, job_id = %job.id, attempt = job.attempts + 1, "job claimed");
        }
        Ok(job)
    }

    /// Mark a claimed job as completed.
    pub async fn ack(&self, mut job: Job) -> Result<(), QueueError> {
        let config = self.config(job.channel);
        job.mark_completed(self.clock.now());
        self.store.complete(&job, config.keep_completed).await?;

        debug!(channel = %job.channel, job_id = %job.id, attempts = job.attempts, "job completed");
        Ok(())
    }

    /// Record a failed attempt: re-delay it per its backoff, or dead-letter it
    /// once `max_attempts` is reached.
    pub async fn nack(
        &self,
        mut job: Job,
        error: impl Into<String>,
    ) -> Result<FailureOutcome, QueueError> {
        let config = self.config(job.channel);
        let error = error.into();
        let outcome = job.mark_failed(error.clone(), self.clock.now());

        match outcome {
            FailureOutcome::Retry { delay } => {
                self.store.reschedule(&job).await?;
                warn!(
                    channel = %job.channel,
                    job_id = %job.id,
                    kind = job.kind.type_name(),
                    attempt = job.attempts,
                    max_attempts = job.retry_policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "job failed, retry scheduled"
                );
            }
            FailureOutcome::DeadLettered => {
                self.store.fail(&job, config.keep_failed).await?;
                warn!(
                    channel = %job.channel,
                    job_id = %job.id,
                    kind = job.kind.type_name(),
                    attempts = job.attempts,
                    error = %error,
                    "job dead-lettered"
                );
            }
        }

        Ok(outcome)
    }

    /// Counts per state for one channel.
    pub async fn stats(&self, channel: Channel) -> Result<JobCounts, QueueError> {
        Ok(self.store.counts(channel).await?)
    }

    pub async fn get(&self, channel: Channel, id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.store.get(channel, id).await?)
    }

    /// Inspect jobs in one state (e.g. the dead-letter list).
    pub async fn list(
        &self,
        channel: Channel,
        state: JobState,
        limit: usize,
    ) -> Result<Vec<Job>, QueueError> {
        Ok(self.store.list(channel, state, limit).await?)
    }

    /// Replay a dead-lettered job with a fresh attempt budget.
    pub async fn retry_failed(&self, channel: Channel, id: JobId) -> Result<Job, QueueError> {
        let job = self.store.retry_failed(channel, id, self.clock.now()).await?;
        info!(%channel, job_id = %id, "dead-lettered job replayed");
        self.wake(channel);
        Ok(job)
    }

    /// Move jobs abandoned in the active state back to waiting.
    pub async fn recover_stalled(&self, channel: Channel) -> Result<usize, QueueError> {
        let recovered = self.store.requeue_active(channel, self.clock.now()).await?;
        if recovered > 0 {
            warn!(%channel, recovered, "stalled jobs moved back to waiting");
            self.wake(channel);
        }
        Ok(recovered)
    }

    pub async fn ping(&self) -> Result<(), QueueError> {
        Ok(self.store.ping().await?)
    }

    pub async fn reconnect(&self) -> Result<(), QueueError> {
        Ok(self.store.reconnect().await?)
    }
}
