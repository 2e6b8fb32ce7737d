//! Durable job queue with retry, backoff, and dead-letter handling.
//!
//! ## Design
//!
//! - Jobs live on a named channel (`email`, `scheduled`) and are typed by a
//!   closed `JobKind`
//! - Claims are atomic in the store: a job is owned by one worker until it is
//!   acked or nacked
//! - Failed attempts are re-delayed per the job's backoff until `max_attempts`,
//!   then dead-lettered
//! - Completed and failed lists are bounded per channel
//!
//! ## Components
//!
//! - `Job`: core job abstraction with payload and retry state
//! - `JobStore`: persistence (in-memory, or Redis with the `redis` feature)
//! - `JobQueue`: enqueue/dequeue/ack/nack facade with channel defaults

pub mod queue;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod store;
pub mod types;

pub use queue::{ChannelConfig, JobQueue, QueueError};
#[cfg(feature = "redis")]
pub use redis_store::{RedisJobStore, RedisSettings};
pub use store::{InMemoryJobStore, JobStore, StoreError};
pub use types::{
    Backoff, BackoffKind, Channel, FailureOutcome, Job, JobAttemptRecord, JobCounts, JobId,
    JobKind, JobOptions, JobState, MaintenanceTask, NotificationKind, RetryPolicy,
};
