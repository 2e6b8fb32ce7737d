//! Guarded feedback status updates with notification production.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use echoboard_core::FeedbackId;
use echoboard_feedback::{
    FeedbackRecord, FeedbackRepository, FeedbackStatus, RepositoryError, TransitionDecision,
    TransitionError, can_transition,
};

use crate::jobs::JobId;
use crate::notifications::NotificationProducer;

/// Status update error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UpdateError {
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// What an allowed update did.
#[derive(Debug)]
pub enum StatusUpdate {
    /// Requested status equals the current one; nothing written or produced.
    Unchanged,
    Applied {
        record: FeedbackRecord,
        /// Pending enqueue of the status notification, if the new status has one.
        notification: Option<JoinHandle<Option<JobId>>>,
    },
}

/// Runs the lifecycle guard, persists, then produces notifications.
#[derive(Clone)]
pub struct FeedbackStatusUpdater {
    repository: Arc<dyn FeedbackRepository>,
    producer: NotificationProducer,
}

impl FeedbackStatusUpdater {
    pub fn new(repository: Arc<dyn FeedbackRepository>, producer: NotificationProducer) -> Self {
        Self {
            repository,
            producer,
        }
    }

    pub async fn update_status(
        &self,
        id: FeedbackId,
        requested: FeedbackStatus,
    ) -> Result<StatusUpdate, UpdateError> {
        let current = self.repository.get_status(id).await?;

        match can_transition(current, requested)? {
            TransitionDecision::NoOp => {
                debug!(feedback_id = %id, status = %current, "status unchanged");
                Ok(StatusUpdate::Unchanged)
            }
            TransitionDecision::Apply => {
                let record = self.repository.set_status(id, requested).await?;
                info!(feedback_id = %id, from = %current, to = %requested, "feedback status updated");

                let notification = match requested {
                    FeedbackStatus::Approved => Some(self.producer.feedback_approved(&record)),
                    FeedbackStatus::Rejected => Some(self.producer.feedback_rejected(&record)),
                    FeedbackStatus::Pending | FeedbackStatus::Archived => None,
                };
                Ok(StatusUpdate::Applied {
                    record,
                    notification,
                })
            }
        }
    }
}
