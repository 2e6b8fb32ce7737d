//! Feedback domain module.
//!
//! Contains the feedback record model, its status lifecycle rules and the
//! storage collaborator contract. The lifecycle guard is deterministic domain
//! logic (no IO); the repository trait is the only seam to storage.

pub mod lifecycle;
pub mod record;
pub mod repository;
pub mod status;

pub use lifecycle::{TransitionDecision, TransitionError, can_transition};
pub use record::{Author, FeedbackRecord, Rating};
pub use repository::{FeedbackRepository, InMemoryFeedbackRepository, RepositoryError};
pub use status::FeedbackStatus;
