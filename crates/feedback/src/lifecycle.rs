//! Feedback status lifecycle guard.
//!
//! [`can_transition`] must run before any status write and before any
//! notification is produced, so a denied transition never reaches storage or
//! the job queue.

use thiserror::Error;

use crate::status::FeedbackStatus;

/// Outcome of an allowed transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionDecision {
    /// Persist the new status (and produce notifications).
    Apply,
    /// Requested status equals the current one; skip the write and produce nothing.
    NoOp,
}

/// A transition the lifecycle forbids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("rejected feedback cannot be approved; delete and resubmit")]
    RejectedCannotBeApproved,

    #[error("approved feedback cannot be rejected; delete instead")]
    ApprovedCannotBeRejected,
}

/// Decide whether feedback may move from `current` to `requested`.
///
/// Rules, in order:
/// 1. same status → [`TransitionDecision::NoOp`]
/// 2. rejected → approved → denied
/// 3. approved → rejected → denied
/// 4. anything else (including into/out of archived) → [`TransitionDecision::Apply`]
pub fn can_transition(
    current: FeedbackStatus,
    requested: FeedbackStatus,
) -> Result<TransitionDecision, TransitionError> {
    use FeedbackStatus::*;

    match (current, requested) {
        (c, r) if c == r => Ok(TransitionDecision::NoOp),
        (Rejected, Approved) => Err(TransitionError::RejectedCannotBeApproved),
        (Approved, Rejected) => Err(TransitionError::ApprovedCannotBeRejected),
        _ => Ok(TransitionDecision::Apply),
    }
}
