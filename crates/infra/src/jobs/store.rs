//! Job storage implementations.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::types::{Channel, Job, JobCounts, JobId, JobState};

/// Durable job store abstraction.
///
/// Every transition out of the active state requires the job to be active in
/// the store; this is what keeps a job owned by exactly one worker.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job in its initial (waiting or delayed) state.
    async fn push(&self, job: Job) -> Result<(), StoreError>;

    /// Atomically claim the oldest claimable job on a channel.
    /// Due delayed jobs are promoted first.
    async fn claim_next(
        &self,
        channel: Channel,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError>;

    /// Move an active job to completed, keeping at most `keep` completed jobs.
    async fn complete(&self, job: &Job, keep: usize) -> Result<(), StoreError>;

    /// Move an active job back to delayed until its `ready_at`.
    async fn reschedule(&self, job: &Job) -> Result<(), StoreError>;

    /// Move an active job to failed, keeping at most `keep` failed jobs.
    async fn fail(&self, job: &Job, keep: usize) -> Result<(), StoreError>;

    /// Get a job by ID.
    async fn get(&self, channel: Channel, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Per-state counts.
    async fn counts(&self, channel: Channel) -> Result<JobCounts, StoreError>;

    /// List jobs in a given state, newest first for terminal states.
    async fn list(
        &self,
        channel: Channel,
        state: JobState,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError>;

    /// Return every active job on the channel to waiting. Used before a
    /// worker pool starts, when no claim can legitimately be in flight.
    async fn requeue_active(&self, channel: Channel, now: DateTime<Utc>)
    -> Result<usize, StoreError>;

    /// Move a failed job back to waiting with a fresh attempt budget.
    async fn retry_failed(
        &self,
        channel: Channel,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError>;

    /// Cheap connectivity probe.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Drop and re-establish the backend connection.
    async fn reconnect(&self) -> Result<(), StoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job is not active: {0}")]
    NotActive(JobId),
    #[error("job is not failed: {0}")]
    NotFailed(JobId),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    /// Errors that indicate the backend itself is unreachable.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[derive(Debug, Default)]
struct ChannelState {
    jobs: HashMap<JobId, Job>,
    waiting: VecDeque<JobId>,
    delayed: Vec<JobId>,
    active: HashSet<JobId>,
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,
}

impl ChannelState {
    fn promote_due(&mut self, now: DateTime<Utc>) {
        let mut due: Vec<(DateTime<Utc>, JobId)> = Vec::new();
        let jobs = &self.jobs;
        self.delayed.retain(|id| match jobs.get(id) {
            Some(job) if job.is_ready(now) => {
                due.push((job.ready_at.unwrap_or(now), *id));
                false
            }
            Some(_) => true,
            None => false,
        });

        due.sort();
        for (_, id) in due {
            if let Some(job) = self.jobs.get_mut(&id) {
                job.state = JobState::Waiting;
                job.ready_at = None;
            }
            self.waiting.push_back(id);
        }
    }

    fn take_active(&mut self, id: JobId) -> Result<(), StoreError> {
        if self.active.remove(&id) {
            Ok(())
        } else {
            Err(StoreError::NotActive(id))
        }
    }

    fn trim(jobs: &mut HashMap<JobId, Job>, list: &mut VecDeque<JobId>, keep: usize) {
        while list.len() > keep {
            if let Some(evicted) = list.pop_front() {
                jobs.remove(&evicted);
            }
        }
    }

    fn ids_for(&self, state: JobState) -> Vec<JobId> {
        match state {
            JobState::Waiting => self.waiting.iter().copied().collect(),
            JobState::Delayed => self.delayed.clone(),
            JobState::Active => self.active.iter().copied().collect(),
            JobState::Completed => self.completed.iter().rev().copied().collect(),
            JobState::Failed => self.failed.iter().rev().copied().collect(),
        }
    }
}

/// In-memory job store for tests/dev.
///
/// Can be switched into an unreachable mode to exercise outage handling.
#[derive(Debug)]
pub struct InMemoryJobStore {
    channels: Mutex<HashMap<Channel, ChannelState>>,
    reachable: AtomicBool,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            reachable: AtomicBool::new(true),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate the backend going away (`false`) or coming back (`true`).
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<Channel, ChannelState>>, StoreError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        self.channels
            .lock()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn push(&self, job: Job) -> Result<(), StoreError> {
        let mut channels = self.lock()?;
        let state = channels.entry(job.channel).or_default();
        match job.state {
            JobState::Delayed => state.delayed.push(job.id),
            _ => state.waiting.push_back(job.id),
        }
        state.jobs.insert(job.id, job);
        Ok(())
    }

    async fn claim_next(
        &self,
        channel: Channel,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let mut channels = self.lock()?;
        let state = channels.entry(channel).or_default();
        state.promote_due(now);

        while let Some(id) = state.waiting.pop_front() {
            if let Some(job) = state.jobs.get_mut(&id) {
                job.mark_active(now);
                state.active.insert(id);
                return Ok(Some(job.clone()));
            }
        }

        Ok(None)
    }

    async fn complete(&self, job: &Job, keep: usize) -> Result<(), StoreError> {
        let mut channels = self.lock()?;
        let state = channels.entry(job.channel).or_default();
        state.take_active(job.id)?;

        state.jobs.insert(job.id, job.clone());
        state.completed.push_back(job.id);
        ChannelState::trim(&mut state.jobs, &mut state.completed, keep);
        Ok(())
    }

    async fn reschedule(&self, job: &Job) -> Result<(), StoreError> {
        let mut channels = self.lock()?;
        let state = channels.entry(job.channel).or_default();
        state.take_active(job.id)?;

        state.jobs.insert(job.id, job.clone());
        state.delayed.push(job.id);
        Ok(())
    }

    async fn fail(&self, job: &Job, keep: usize) -> Result<(), StoreError> {
        let mut channels = self.lock()?;
        let state = channels.entry(job.channel).or_default();
        state.take_active(job.id)?;

        state.jobs.insert(job.id, job.clone());
        state.failed.push_back(job.id);
        ChannelState::trim(&mut state.jobs, &mut state.failed, keep);
        Ok(())
    }

    async fn get(&self, channel: Channel, id: JobId) -> Result<Option<Job>, StoreError> {
        let channels = self.lock()?;
        Ok(channels
            .get(&channel)
            .and_then(|state| state.jobs.get(&id))
            .cloned())
    }

    async fn counts(&self, channel: Channel) -> Result<JobCounts, StoreError> {
        let channels = self.lock()?;
        Ok(channels
            .get(&channel)
            .map(|state| JobCounts {
                waiting: state.waiting.len(),
                active: state.active.len(),
                completed: state.completed.len(),
                failed: state.failed.len(),
                delayed: state.delayed.len(),
            })
            .unwrap_or_default())
    }

    async fn list(
        &self,
        channel: Channel,
        state: JobState,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let channels = self.lock()?;
        let Some(channel_state) = channels.get(&channel) else {
            return Ok(Vec::new());
        };

        Ok(channel_state
            .ids_for(state)
            .into_iter()
            .filter_map(|id| channel_state.jobs.get(&id).cloned())
            .take(limit)
            .collect())
    }

    async fn requeue_active(
        &self,
        channel: Channel,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut channels = self.lock()?;
        let state = channels.entry(channel).or_default();

        let mut stalled: Vec<JobId> = state.active.drain().collect();
        stalled.sort();
        for id in &stalled {
            if let Some(job) = state.jobs.get_mut(id) {
                job.mark_stalled(now);
            }
        }
        // Stalled jobs were claimed before anything still waiting.
        for id in stalled.iter().rev() {
            state.waiting.push_front(*id);
        }
        Ok(stalled.len())
    }

    async fn retry_failed(
        &self,
        channel: Channel,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let mut channels = self.lock()?;
        let state = channels.entry(channel).or_default();

        let Some(position) = state.failed.iter().position(|failed| *failed == id) else {
            return Err(if state.jobs.contains_key(&id) {
                StoreError::NotFailed(id)
            } else {
                StoreError::NotFound(id)
            });
        };
        state.failed.remove(position);

        let job = state.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        job.reset_for_replay(now);
        let job = job.clone();
        state.waiting.push_back(id);
        Ok(job)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.lock().map(|_| ())
    }

    async fn reconnect(&self) -> Result<(), StoreError> {
        self.ping().await
    }
}
