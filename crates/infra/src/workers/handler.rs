//! Handler contract for worker pools.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::jobs::{Channel, Job, QueueError};
use crate::notifications::MailError;

/// Handler failure. Always converted into a `nack` by the executor.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("job kind {0} is not handled by this channel")]
    UnsupportedKind(&'static str),
    #[error(transparent)]
    Mail(#[from] MailError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("{0}")]
    Failed(String),
}

/// Executes one attempt of a job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError>;
}

/// Handler bound to each channel. Reused verbatim on every pool rebuild.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<Channel, Arc<dyn JobHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("channels", &self.channels())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for a channel, replacing any previous binding.
    pub fn register(mut self, channel: Channel, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(channel, handler);
        self
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&channel).cloned()
    }

    /// Bound channels in a stable order.
    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<_> = self.handlers.keys().copied().collect();
        channels.sort();
        channels
    }
}
