//! Owns the worker pools of every channel and rebuilds them on reconnect.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::jobs::{Channel, JobQueue, QueueError};

use super::handler::HandlerRegistry;
use super::pool::{PoolStats, WorkerPool};

/// Supervisor timing settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// How long in-flight handlers get to finish on stop.
    pub shutdown_grace: Duration,
    /// Pause between stopping the pools and reconnecting the transport.
    pub reconnect_cooldown: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(30),
            reconnect_cooldown: Duration::from_secs(2),
        }
    }
}

/// Result of a reconnect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectOutcome {
    /// Pools were stopped and rebuilt.
    Rebuilt,
    /// Another reconnect was already running.
    AlreadyInProgress,
}

/// Starts, stops and rebuilds worker pools with a fixed set of handler
/// bindings and channel configurations.
pub struct WorkerSupervisor {
    queue: Arc<JobQueue>,
    handlers: HandlerRegistry,
    settings: SupervisorSettings,
    pools: Mutex<HashMap<Channel, WorkerPool>>,
    starting: Mutex<()>,
    reconnecting: Mutex<()>,
}

impl std::fmt::Debug for WorkerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSupervisor")
            .field("handlers", &self.handlers)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl WorkerSupervisor {
    pub fn new(queue: Arc<JobQueue>, handlers: HandlerRegistry, settings: SupervisorSettings) -> Self {
        Self {
            queue,
            handlers,
            settings,
            pools: Mutex::new(HashMap::new()),
            starting: Mutex::new(()),
            reconnecting: Mutex::new(()),
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Start a pool for every bound channel that has none. Jobs left active
    /// by a previous pool are recovered first, outside the pool lock so
    /// `workers_running` stays answerable while the store is slow.
    pub async fn start(&self) -> Result<(), QueueError> {
        // Serialize starts: recovery must not requeue jobs a pool started
        // by a concurrent call has already claimed.
        let _starting = self.starting.lock().await;
        let missing: Vec<Channel> = {
            let pools = self.pools.lock().await;
            self.handlers
                .channels()
                .into_iter()
                .filter(|channel| !pools.contains_key(channel))
                .collect()
        };

        for &channel in &missing {
            self.queue.recover_stalled(channel).await?;
        }

        let mut pools = self.pools.lock().await;
        for channel in missing {
            if pools.contains_key(&channel) {
                continue;
            }
            let Some(handler) = self.handlers.get(channel) else {
                continue;
            };
            pools.insert(
                channel,
                WorkerPool::start(self.queue.clone(), channel, handler),
            );
        }

        Ok(())
    }

    /// Stop every pool, letting in-flight handlers finish up to the grace
    /// deadline.
    pub async fn stop(&self) {
        let pools: Vec<WorkerPool> = {
            let mut pools = self.pools.lock().await;
            pools.drain().map(|(_, pool)| pool).collect()
        };

        let grace = self.settings.shutdown_grace;
        let reports =
            futures::future::join_all(pools.into_iter().map(|pool| pool.shutdown(grace))).await;
        let abandoned: usize = reports.iter().map(|r| r.abandoned).sum();
        if abandoned > 0 {
            warn!(abandoned, "handlers abandoned during stop; their jobs are recovered on next start");
        }
    }

    /// Per-channel running flag. Channels without a live pool report false.
    pub async fn workers_running(&self) -> BTreeMap<Channel, bool> {
        let pools = self.pools.lock().await;
        self.handlers
            .channels()
            .into_iter()
            .map(|channel| {
                let running = pools.get(&channel).is_some_and(WorkerPool::is_running);
                (channel, running)
            })
            .collect()
    }

    pub async fn pool_stats(&self) -> BTreeMap<Channel, PoolStats> {
        let pools = self.pools.lock().await;
        pools
            .iter()
            .map(|(channel, pool)| (*channel, pool.stats()))
            .collect()
    }

    /// Stop all pools, wait for the cooldown, re-establish the transport and
    /// rebuild the pools. Single-flight: a concurrent call returns at once.
    ///
    /// On error the pools stay stopped; the next call retries.
    pub async fn reconnect(&self) -> Result<ReconnectOutcome, QueueError> {
        let Ok(_guard) = self.reconnecting.try_lock() else {
            return Ok(ReconnectOutcome::AlreadyInProgress);
        };

        warn!("reconnecting queue transport and rebuilding worker pools");
        self.stop().await;
        tokio::time::sleep(self.settings.reconnect_cooldown).await;

        if let Err(err) = self.queue.reconnect().await {
            error!(error = %err, "transport reconnect failed");
            return Err(err);
        }
        if let Err(err) = self.start().await {
            error!(error = %err, "worker pool rebuild failed");
            return Err(err);
        }

        info!("worker pools rebuilt");
        Ok(ReconnectOutcome::Rebuilt)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::jobs::{InMemoryJobStore, Job, JobOptions, JobStore, NotificationKind};
    use crate::testing::StallingStore;
    use crate::workers::handler::{HandlerError, JobHandler};

    struct Noop;

    #[async_trait]
    impl JobHandler for Noop {
        async fn handle(&self, _job: &Job) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn supervisor(store: Arc<dyn JobStore>) -> Arc<WorkerSupervisor> {
        let queue = Arc::new(JobQueue::new(store));
        let handlers = HandlerRegistry::new()
            .register(Channel::Email, Arc::new(Noop))
            .register(Channel::Scheduled, Arc::new(Noop));
        Arc::new(WorkerSupervisor::new(
            queue,
            handlers,
            SupervisorSettings {
                shutdown_grace: Duration::from_millis(200),
                reconnect_cooldown: Duration::from_millis(10),
            },
        ))
    }

    #[tokio::test]
    async fn start_and_stop_toggle_running_flags() {
        let supervisor = supervisor(InMemoryJobStore::arc());
        assert!(supervisor.workers_running().await.values().all(|r| !r));

        supervisor.start().await.unwrap();
        let running = supervisor.workers_running().await;
        assert_eq!(running.len(), 2);
        assert!(running.values().all(|r| *r));

        supervisor.stop().await;
        assert!(supervisor.workers_running().await.values().all(|r| !r));
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let supervisor = supervisor(InMemoryJobStore::arc());
        supervisor.start().await.unwrap();
        supervisor.start().await.unwrap();

        let stats = supervisor.pool_stats().await;
        assert_eq!(stats[&Channel::Email].executors, 5);
        assert_eq!(stats[&Channel::Scheduled].executors, 2);
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn reconnect_is_single_flight() {
        let supervisor = supervisor(InMemoryJobStore::arc());
        supervisor.start().await.unwrap();

        let (first, second) = tokio::join!(supervisor.reconnect(), supervisor.reconnect());
        let outcomes = [first.unwrap(), second.unwrap()];
        assert!(outcomes.contains(&ReconnectOutcome::Rebuilt));
        assert!(outcomes.contains(&ReconnectOutcome::AlreadyInProgress));
        assert!(supervisor.workers_running().await.values().all(|r| *r));
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn failed_reconnect_leaves_pools_stopped_until_retry() {
        let store = InMemoryJobStore::arc();
        let supervisor = supervisor(store.clone());
        supervisor.start().await.unwrap();

        store.set_reachable(false);
        assert!(supervisor.reconnect().await.is_err());
        assert!(supervisor.workers_running().await.values().all(|r| !r));

        store.set_reachable(true);
        supervisor
            .queue()
            .enqueue(
                Channel::Email,
                NotificationKind::WelcomeEmail,
                &serde_json::json!({"to": "a@x.com"}),
                JobOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(supervisor.reconnect().await.unwrap(), ReconnectOutcome::Rebuilt);
        assert!(supervisor.workers_running().await.values().all(|r| *r));
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn running_flags_stay_readable_while_recovery_is_slow() {
        let store = Arc::new(StallingStore::default());
        let supervisor = supervisor(store.clone());
        store.hold_recovery(true);

        let starting = tokio::spawn({
            let supervisor = supervisor.clone();
            async move { supervisor.start().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!starting.is_finished());

        let running = tokio::time::timeout(Duration::from_millis(200), supervisor.workers_running())
            .await
            .expect("workers_running blocked behind start");
        assert!(running.values().all(|r| !r));

        store.hold_recovery(false);
        starting.await.unwrap().unwrap();
        assert!(supervisor.workers_running().await.values().all(|r| *r));
        supervisor.stop().await;
    }
}
