//! Worker pools and their supervisor.
//!
//! - `JobHandler`: per-channel execution contract
//! - `WorkerPool`: `concurrency` executors draining one channel
//! - `WorkerSupervisor`: start/stop/rebuild of all pools (single-flight reconnect)

pub mod handler;
pub mod pool;
pub mod supervisor;

pub use handler::{HandlerError, HandlerRegistry, JobHandler};
pub use pool::{PoolStats, ShutdownReport, WorkerPool};
pub use supervisor::{ReconnectOutcome, SupervisorSettings, WorkerSupervisor};
