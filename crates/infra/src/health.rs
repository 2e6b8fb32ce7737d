//! Connection health monitor.
//!
//! The monitor is the only writer of [`HealthState`]; everything else reads it
//! through [`HealthMonitor::state`] or a `watch` subscription.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::jobs::{Channel, QueueError};
use crate::workers::{ReconnectOutcome, WorkerSupervisor};

/// Monitor settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthMonitorConfig {
    /// Time between probe ticks.
    pub interval: Duration,
    /// Bound on each transport probe.
    pub probe_timeout: Duration,
    /// Consecutive failing ticks that force a reconnect.
    pub failure_threshold: u32,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            failure_threshold: 3,
        }
    }
}

/// Latest health snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthState {
    pub connected: bool,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub workers_running: BTreeMap<Channel, bool>,
    pub last_error: Option<String>,
    pub reconnects: u64,
}

impl HealthState {
    pub fn all_workers_running(&self) -> bool {
        !self.workers_running.is_empty() && self.workers_running.values().all(|r| *r)
    }
}

enum Probe {
    Healthy,
    /// The transport answered with a connection error or not at all.
    Disconnected(String),
    /// The transport answered but a stats query errored or hung.
    Degraded(String),
}

/// Periodic liveness probe plus reconnect trigger.
pub struct HealthMonitor {
    supervisor: Arc<WorkerSupervisor>,
    config: HealthMonitorConfig,
    state: watch::Sender<HealthState>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl HealthMonitor {
    pub fn new(supervisor: Arc<WorkerSupervisor>, config: HealthMonitorConfig) -> Self {
        let (state, _) = watch::channel(HealthState::default());
        Self {
            supervisor,
            config,
            state,
        }
    }

    pub fn state(&self) -> HealthState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthState> {
        self.state.subscribe()
    }

    /// Run ticks until cancelled.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; pools were just started.
        interval.tick().await;

        info!(interval_secs = self.config.interval.as_secs(), "health monitor started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
        info!("health monitor stopped");
    }

    /// One probe cycle: probe, decide, reconnect if needed, publish.
    pub async fn tick(&self) -> HealthState {
        let previous = self.state();
        let probe = self.probe().await;
        let workers = self.supervisor.workers_running().await;
        let workers_down = workers.values().any(|r| !r);

        let (connected, failures, last_error) = match probe {
            Probe::Healthy => (true, 0, None),
            Probe::Disconnected(err) => (false, previous.consecutive_failures + 1, Some(err)),
            Probe::Degraded(err) => (true, previous.consecutive_failures + 1, Some(err)),
        };

        let reason = if !connected {
            Some("transport disconnected")
        } else if failures >= self.config.failure_threshold {
            Some("consecutive probe failures")
        } else if workers_down {
            Some("workers not running")
        } else {
            None
        };

        let mut next = HealthState {
            connected,
            last_probe_at: Some(Utc::now()),
            consecutive_failures: failures,
            workers_running: workers,
            last_error,
            reconnects: previous.reconnects,
        };

        match reason {
            Some(reason) => {
                warn!(
                    reason,
                    consecutive_failures = failures,
                    error = next.last_error.as_deref().unwrap_or(""),
                    "queue degraded, reconnecting"
                );
                match self.supervisor.reconnect().await {
                    Ok(ReconnectOutcome::Rebuilt) => {
                        next.reconnects += 1;
                        match self.ping().await {
                            Probe::Healthy => {
                                next.connected = true;
                                next.consecutive_failures = 0;
                            }
                            Probe::Disconnected(err) => {
                                warn!(error = %err, "transport still unresponsive after rebuild");
                                next.connected = false;
                                next.last_error = Some(err);
                            }
                            Probe::Degraded(err) => {
                                next.connected = true;
                                next.last_error = Some(err);
                            }
                        }
                    }
                    Ok(ReconnectOutcome::AlreadyInProgress) => {
                        debug!("reconnect already in progress");
                    }
                    Err(err) => {
                        error!(error = %err, "reconnect failed, retrying next tick");
                        next.connected = !err.is_connectivity() && next.connected;
                        next.last_error = Some(err.to_string());
                    }
                }
                next.workers_running = self.supervisor.workers_running().await;
            }
            None => debug!("queue healthy"),
        }

        self.state.send_replace(next.clone());
        next
    }

    /// A ping that never answers counts as a lost connection.
    async fn ping(&self) -> Probe {
        let timeout = self.config.probe_timeout;
        match tokio::time::timeout(timeout, self.supervisor.queue().ping()).await {
            Ok(Ok(())) => Probe::Healthy,
            Ok(Err(err)) if err.is_connectivity() => Probe::Disconnected(err.to_string()),
            Ok(Err(err)) => Probe::Degraded(err.to_string()),
            Err(_) => Probe::Disconnected(format!("ping timed out after {}ms", timeout.as_millis())),
        }
    }

    async fn probe(&self) -> Probe {
        let queue = self.supervisor.queue();
        let timeout = self.config.probe_timeout;

        let ping = self.ping().await;
        if !matches!(ping, Probe::Healthy) {
            return ping;
        }

        for channel in Channel::ALL {
            match tokio::time::timeout(timeout, queue.stats(channel)).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => return Probe::Degraded(stats_error(channel, &err)),
                Err(_) => {
                    return Probe::Degraded(format!("{channel} stats timed out after {}ms", timeout.as_millis()));
                }
            }
        }

        Probe::Healthy
    }
}

fn stats_error(channel: Channel, err: &QueueError) -> String {
    format!("{channel} stats failed: {err}")
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::jobs::{InMemoryJobStore, Job, JobQueue, JobStore};
    use crate::testing::StallingStore;
    use crate::workers::{HandlerError, HandlerRegistry, JobHandler, SupervisorSettings};

    struct Noop;

    #[async_trait]
    impl JobHandler for Noop {
        async fn handle(&self, _job: &Job) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn monitor(store: Arc<dyn JobStore>) -> HealthMonitor {
        let queue = Arc::new(JobQueue::new(store));
        let handlers = HandlerRegistry::new().register(Channel::Email, Arc::new(Noop));
        let supervisor = Arc::new(WorkerSupervisor::new(
            queue,
            handlers,
            SupervisorSettings {
                shutdown_grace: Duration::from_millis(100),
                reconnect_cooldown: Duration::from_millis(5),
            },
        ));
        HealthMonitor::new(
            supervisor,
            HealthMonitorConfig {
                interval: Duration::from_millis(20),
                probe_timeout: Duration::from_millis(100),
                failure_threshold: 3,
            },
        )
    }

    #[tokio::test]
    async fn healthy_tick_reports_connected() {
        let monitor = monitor(InMemoryJobStore::arc());
        monitor.supervisor.start().await.unwrap();

        let state = monitor.tick().await;
        assert!(state.connected);
        assert!(state.all_workers_running());
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.reconnects, 0);
        assert!(state.last_probe_at.is_some());
        assert_eq!(monitor.state(), state);
    }

    #[tokio::test]
    async fn stopped_workers_trigger_rebuild() {
        let monitor = monitor(InMemoryJobStore::arc());

        let state = monitor.tick().await;
        assert_eq!(state.reconnects, 1);
        assert!(state.all_workers_running());
        monitor.supervisor.stop().await;
    }

    #[tokio::test]
    async fn outage_then_recovery() {
        let store = InMemoryJobStore::arc();
        let monitor = monitor(store.clone());
        monitor.supervisor.start().await.unwrap();
        let mut updates = monitor.subscribe();

        store.set_reachable(false);
        let down = monitor.tick().await;
        assert!(!down.connected);
        assert_eq!(down.consecutive_failures, 1);
        assert!(!down.all_workers_running());
        assert!(down.last_error.is_some());
        assert!(updates.has_changed().unwrap());
        assert!(!updates.borrow_and_update().connected);

        let still_down = monitor.tick().await;
        assert_eq!(still_down.consecutive_failures, 2);

        store.set_reachable(true);
        let up = monitor.tick().await;
        assert!(up.connected);
        assert!(up.all_workers_running());
        assert_eq!(up.consecutive_failures, 0);
        assert_eq!(up.reconnects, 1);
        monitor.supervisor.stop().await;
    }

    #[tokio::test]
    async fn unanswered_ping_counts_as_disconnected() {
        let store = Arc::new(StallingStore::default());
        let monitor = monitor(store.clone());
        monitor.supervisor.start().await.unwrap();

        store.hang_ping(true);
        let down = monitor.tick().await;
        assert!(!down.connected);
        assert_eq!(down.consecutive_failures, 1);
        assert_eq!(down.reconnects, 1);
        assert!(down.last_error.as_deref().unwrap().contains("timed out"));
        assert!(!monitor.state().connected);

        store.hang_ping(false);
        let up = monitor.tick().await;
        assert!(up.connected);
        assert_eq!(up.consecutive_failures, 0);
        assert!(up.all_workers_running());
        monitor.supervisor.stop().await;
    }

    #[tokio::test]
    async fn run_loop_stops_on_cancel() {
        let monitor = Arc::new(monitor(InMemoryJobStore::arc()));
        let cancel = CancellationToken::new();
        let handle = monitor.clone().spawn(cancel.clone());

        let mut updates = monitor.subscribe();
        tokio::time::timeout(Duration::from_secs(2), updates.changed())
            .await
            .unwrap()
            .unwrap();

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        monitor.supervisor.stop().await;
    }
}
