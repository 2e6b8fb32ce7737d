//! Test doubles shared by unit and integration tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::jobs::{
    Channel, InMemoryJobStore, Job, JobCounts, JobId, JobState, JobStore, StoreError,
};
use crate::notifications::{DeliveryId, MailError, Mailer, OutboundEmail};

/// Records every message; optionally fails the first `n` sends.
#[derive(Debug, Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<OutboundEmail>>,
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
}

impl RecordingMailer {
    pub fn failing(times: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(times),
            ..Self::default()
        }
    }

    /// Always fails.
    pub fn broken() -> Self {
        Self::failing(usize::MAX)
    }

    pub fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<DeliveryId, MailError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(MailError::Transport("connection reset".to_string()));
        }

        self.sent.lock().unwrap().push(email.clone());
        Ok(DeliveryId(format!("msg_{attempt}")))
    }
}

/// In-memory store whose `ping` can hang forever (a black-holed backend) and
/// whose stalled-job recovery can be held until released.
#[derive(Debug, Default)]
pub struct StallingStore {
    inner: InMemoryJobStore,
    hang_ping: AtomicBool,
    hold_recovery: AtomicBool,
    released: Notify,
}

impl StallingStore {
    pub fn hang_ping(&self, hang: bool) {
        self.hang_ping.store(hang, Ordering::SeqCst);
    }

    pub fn hold_recovery(&self, hold: bool) {
        self.hold_recovery.store(hold, Ordering::SeqCst);
        if !hold {
            self.released.notify_waiters();
        }
    }
}

#[async_trait]
impl JobStore for StallingStore {
    async fn push(&self, job: Job) -> Result<(), StoreError> {
        self.inner.push(job).await
    }

    async fn claim_next(
        &self,
        channel: Channel,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        self.inner.claim_next(channel, now).await
    }

    async fn complete(&self, job: &Job, keep: usize) -> Result<(), StoreError> {
        self.inner.complete(job, keep).await
    }

    async fn reschedule(&self, job: &Job) -> Result<(), StoreError> {
        self.inner.reschedule(job).await
    }

    async fn fail(&self, job: &Job, keep: usize) -> Result<(), StoreError> {
        self.inner.fail(job, keep).await
    }

    async fn get(&self, channel: Channel, id: JobId) -> Result<Option<Job>, StoreError> {
        self.inner.get(channel, id).await
    }

    async fn counts(&self, channel: Channel) -> Result<JobCounts, StoreError> {
        self.inner.counts(channel).await
    }

    async fn list(
        &self,
        channel: Channel,
        state: JobState,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        self.inner.list(channel, state, limit).await
    }

    async fn requeue_active(
        &self,
        channel: Channel,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        loop {
            let released = self.released.notified();
            if !self.hold_recovery.load(Ordering::SeqCst) {
                break;
            }
            released.await;
        }
        self.inner.requeue_active(channel, now).await
    }

    async fn retry_failed(
        &self,
        channel: Channel,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        self.inner.retry_failed(channel, id, now).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        if self.hang_ping.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.inner.ping().await
    }

    async fn reconnect(&self) -> Result<(), StoreError> {
        self.inner.reconnect().await
    }
}
