//! Per-channel worker pool.
//!
//! A pool runs `concurrency` independent executors. Each executor loops
//! dequeue → handler → ack/nack; a slow or failing handler only occupies its
//! own slot.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::jobs::{Channel, ChannelConfig, FailureOutcome, Job, JobQueue};

use super::handler::JobHandler;

/// Pool runtime statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub executors: usize,
    pub live_executors: usize,
    pub in_flight: usize,
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
}

/// How a pool shutdown went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Executors aborted with a handler still running past the grace deadline.
    pub abandoned: usize,
}

#[derive(Debug, Default)]
struct Counters {
    live: AtomicUsize,
    in_flight: AtomicUsize,
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
}

/// The part of [`ChannelConfig`] an executor acts on.
#[derive(Debug, Clone, Copy)]
struct ExecutorSettings {
    concurrency: usize,
    job_timeout: Duration,
    poll_interval: Duration,
}

impl From<ChannelConfig> for ExecutorSettings {
    fn from(config: ChannelConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            job_timeout: config.job_timeout,
            poll_interval: config.poll_interval,
        }
    }
}

struct Executor {
    queue: Arc<JobQueue>,
    channel: Channel,
    handler: Arc<dyn JobHandler>,
    config: ExecutorSettings,
    cancel: CancellationToken,
    counters: Arc<Counters>,
}

/// Decrements the live-executor count however the executor exits.
struct LiveGuard(Arc<Counters>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Running pool for one channel.
pub struct WorkerPool {
    channel: Channel,
    concurrency: usize,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("channel", &self.channel)
            .field("concurrency", &self.concurrency)
            .field("stats", &self.stats())
            .finish()
    }
}

impl WorkerPool {
    /// Spawn the pool's executors on the current runtime. Concurrency, job
    /// timeout and poll interval come from the queue's config for `channel`,
    /// the same config that resolves retry policy and retention.
    pub fn start(queue: Arc<JobQueue>, channel: Channel, handler: Arc<dyn JobHandler>) -> Self {
        let config = ExecutorSettings::from(queue.config(channel));
        let concurrency = config.concurrency;
        let cancel = CancellationToken::new();
        let counters = Arc::new(Counters::default());
        let executor = Arc::new(Executor {
            queue,
            channel,
            handler,
            config,
            cancel: cancel.clone(),
            counters: counters.clone(),
        });

        let mut tasks = JoinSet::new();
        for slot in 0..concurrency {
            counters.live.fetch_add(1, Ordering::SeqCst);
            let executor = executor.clone();
            tasks.spawn(async move { executor.run(slot).await });
        }

        info!(%channel, concurrency, "worker pool started");
        Self {
            channel,
            concurrency,
            cancel,
            tasks,
            counters,
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// True while every executor is alive and no shutdown was requested.
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && self.counters.live.load(Ordering::SeqCst) == self.concurrency
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.counters;
        PoolStats {
            executors: self.concurrency,
            live_executors: c.live.load(Ordering::SeqCst),
            in_flight: c.in_flight.load(Ordering::SeqCst),
            jobs_processed: c.processed.load(Ordering::SeqCst),
            jobs_succeeded: c.succeeded.load(Ordering::SeqCst),
            jobs_failed: c.failed.load(Ordering::SeqCst),
            jobs_dead_lettered: c.dead_lettered.load(Ordering::SeqCst),
        }
    }

    /// Stop claiming, let in-flight handlers finish within `grace`, then
    /// abort whatever is left.
    pub async fn shutdown(mut self, grace: Duration) -> ShutdownReport {
        self.cancel.cancel();
        let channel = self.channel;

        let drained = tokio::time::timeout(grace, async {
            while let Some(result) = self.tasks.join_next().await {
                if let Err(err) = result {
                    if err.is_panic() {
                        error!(%channel, "executor task panicked");
                    }
                }
            }
        })
        .await;

        let abandoned = if drained.is_err() {
            let remaining = self.tasks.len();
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
            warn!(%channel, abandoned = remaining, "grace deadline passed, handlers abandoned");
            remaining
        } else {
            0
        };

        info!(%channel, abandoned, "worker pool stopped");
        ShutdownReport { abandoned }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Executor {
    async fn run(self: Arc<Self>, slot: usize) {
        let _live = LiveGuard(self.counters.clone());
        let signal = self.queue.signal(self.channel);
        debug!(channel = %self.channel, slot, "executor started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.queue.dequeue(self.channel).await {
                Ok(Some(job)) => self.execute(job).await,
                Ok(None) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = signal.notified() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(err) if err.is_connectivity() => {
                    error!(channel = %self.channel, slot, error = %err, "queue unreachable, executor stopping");
                    break;
                }
                Err(err) => {
                    warn!(channel = %self.channel, slot, error = %err, "dequeue failed");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }

        debug!(channel = %self.channel, slot, "executor stopped");
    }

    async fn execute(&self, job: Job) {
        let c = &self.counters;
        c.in_flight.fetch_add(1, Ordering::SeqCst);

        let timeout = self.config.job_timeout;
        let invocation = AssertUnwindSafe(self.handler.handle(&job)).catch_unwind();
        let result = match tokio::time::timeout(timeout, invocation).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(err))) => Err(err.to_string()),
            Ok(Err(panic)) => Err(format!("handler panicked: {}", panic_message(&panic))),
            Err(_) => Err(format!("handler timed out after {}ms", timeout.as_millis())),
        };

        c.in_flight.fetch_sub(1, Ordering::SeqCst);
        c.processed.fetch_add(1, Ordering::SeqCst);

        let job_id = job.id;
        match result {
            Ok(()) => {
                c.succeeded.fetch_add(1, Ordering::SeqCst);
                if let Err(err) = self.queue.ack(job).await {
                    error!(channel = %self.channel, %job_id, error = %err, "failed to ack job");
                }
            }
            Err(message) => {
                c.failed.fetch_add(1, Ordering::SeqCst);
                match self.queue.nack(job, message).await {
                    Ok(FailureOutcome::DeadLettered) => {
                        c.dead_lettered.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(FailureOutcome::Retry { .. }) => {}
                    Err(err) => {
                        error!(channel = %self.channel, %job_id, error = %err, "failed to nack job");
                    }
                }
            }
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::jobs::{
        InMemoryJobStore, JobCounts, JobOptions, JobState, NotificationKind, RetryPolicy,
    };
    use crate::workers::handler::HandlerError;

    fn fast_config(concurrency: usize) -> ChannelConfig {
        ChannelConfig::email()
            .with_concurrency(concurrency)
            .with_retry(RetryPolicy::fixed(1, Duration::ZERO))
            .with_poll_interval(Duration::from_millis(10))
    }

    fn queue_with(store: Arc<InMemoryJobStore>, config: ChannelConfig) -> Arc<JobQueue> {
        Arc::new(JobQueue::new(store).with_channel_config(Channel::Email, config))
    }

    async fn enqueue(queue: &JobQueue, n: usize) {
        for i in 0..n {
            queue
                .enqueue(
                    Channel::Email,
                    NotificationKind::WelcomeEmail,
                    &serde_json::json!({"to": format!("user{i}@x.com")}),
                    JobOptions::default(),
                )
                .await
                .unwrap();
        }
    }

    async fn wait_for_counts(queue: &JobQueue, check: impl Fn(JobCounts) -> bool) -> JobCounts {
        for _ in 0..500 {
            let counts = queue.stats(Channel::Email).await.unwrap();
            if check(counts) {
                return counts;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("queue did not reach expected counts in time");
    }

    struct Tracking {
        current: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl JobHandler for Tracking {
        async fn handle(&self, _job: &Job) -> Result<(), HandlerError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Panicking;

    #[async_trait]
    impl JobHandler for Panicking {
        async fn handle(&self, _job: &Job) -> Result<(), HandlerError> {
            panic!("template exploded");
        }
    }

    struct Rejecting;

    #[async_trait]
    impl JobHandler for Rejecting {
        async fn handle(&self, _job: &Job) -> Result<(), HandlerError> {
            Err(HandlerError::Failed("mailbox unavailable".to_string()))
        }
    }

    struct Hanging;

    #[async_trait]
    impl JobHandler for Hanging {
        async fn handle(&self, _job: &Job) -> Result<(), HandlerError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn pool_follows_queue_channel_config() {
        let config = fast_config(3).with_retry(RetryPolicy::fixed(2, Duration::ZERO));
        let queue = queue_with(InMemoryJobStore::arc(), config);
        enqueue(&queue, 1).await;

        let pool = WorkerPool::start(queue.clone(), Channel::Email, Arc::new(Rejecting));
        assert_eq!(pool.stats().executors, 3);
        wait_for_counts(&queue, |c| c.failed == 1).await;

        let failed = queue.list(Channel::Email, JobState::Failed, 1).await.unwrap();
        assert_eq!(failed[0].attempts, 2);
        assert_eq!(pool.stats().jobs_failed, 2);

        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_exceeds_configured_concurrency() {
        let queue = queue_with(InMemoryJobStore::arc(), fast_config(5));
        enqueue(&queue, 50).await;

        let handler = Arc::new(Tracking {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            delay: Duration::from_millis(20),
        });
        let pool = WorkerPool::start(queue.clone(), Channel::Email, handler.clone());

        wait_for_counts(&queue, |c| c.waiting == 0 && c.active == 0 && c.completed == 10).await;

        let stats = pool.stats();
        assert_eq!(stats.jobs_succeeded, 50);
        assert!(handler.peak.load(Ordering::SeqCst) <= 5);
        assert!(handler.peak.load(Ordering::SeqCst) >= 2);

        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn panicking_handler_is_nacked_and_pool_survives() {
        let queue = queue_with(InMemoryJobStore::arc(), fast_config(1));
        enqueue(&queue, 2).await;

        let pool = WorkerPool::start(queue.clone(), Channel::Email, Arc::new(Panicking));
        wait_for_counts(&queue, |c| c.failed == 2).await;

        assert!(pool.is_running());
        let failed = queue.list(Channel::Email, JobState::Failed, 10).await.unwrap();
        assert!(failed[0].last_error.as_deref().unwrap().contains("template exploded"));

        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn slow_handler_times_out_into_nack() {
        let config = fast_config(1).with_job_timeout(Duration::from_millis(50));
        let queue = queue_with(InMemoryJobStore::arc(), config);
        enqueue(&queue, 1).await;

        let pool = WorkerPool::start(queue.clone(), Channel::Email, Arc::new(Hanging));
        wait_for_counts(&queue, |c| c.failed == 1).await;

        let failed = queue.list(Channel::Email, JobState::Failed, 1).await.unwrap();
        assert!(failed[0].last_error.as_deref().unwrap().contains("timed out"));

        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn shutdown_abandons_handlers_past_grace_deadline() {
        let queue = queue_with(InMemoryJobStore::arc(), fast_config(2));
        enqueue(&queue, 1).await;

        let pool = WorkerPool::start(queue.clone(), Channel::Email, Arc::new(Hanging));
        wait_for_counts(&queue, |c| c.active == 1).await;

        let report = pool.shutdown(Duration::from_millis(50)).await;
        assert_eq!(report.abandoned, 1);

        // The abandoned job is still active until the next pool start recovers it.
        assert_eq!(queue.recover_stalled(Channel::Email).await.unwrap(), 1);
        assert_eq!(queue.stats(Channel::Email).await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn executors_stop_when_store_is_unreachable() {
        let store = InMemoryJobStore::arc();
        let queue = queue_with(store.clone(), fast_config(2));

        let handler = Arc::new(Tracking {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            delay: Duration::ZERO,
        });
        let pool = WorkerPool::start(queue.clone(), Channel::Email, handler);
        assert!(pool.is_running());

        store.set_reachable(false);
        for _ in 0..200 {
            if !pool.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!pool.is_running());
        assert_eq!(pool.stats().live_executors, 0);
    }
}
