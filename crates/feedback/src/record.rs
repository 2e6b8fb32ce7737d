use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use echoboard_core::{DomainError, DomainResult, FeedbackId, UserId};

use crate::status::FeedbackStatus;

/// Star rating between 1 and 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Rating(u8);

impl Rating {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 5;

    pub fn new(value: u8) -> DomainResult<Self> {
        if !(Self::MIN..=Self::MAX).contains(&value) {
            return Err(DomainError::validation(format!(
                "rating must be between {} and {}, got {value}",
                Self::MIN,
                Self::MAX
            )));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Rating {
    type Error = DomainError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Rating> for u8 {
    fn from(value: Rating) -> Self {
        value.0
    }
}

/// The user who owns a feedback record, as needed to address notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: UserId,
    pub name: String,
    pub email: String,
}

/// A feedback record as owned by the surrounding application.
///
/// The notification core only reads records and writes `status` through the
/// repository collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub id: FeedbackId,
    pub title: String,
    pub message: String,
    pub rating: Rating,
    pub status: FeedbackStatus,
    pub author: Author,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl FeedbackRecord {
    /// Build a new pending record.
    pub fn new(
        author: Author,
        title: impl Into<String>,
        message: impl Into<String>,
        rating: Rating,
    ) -> DomainResult<Self> {
        let title = title.into();
        let message = message.into();
        if title.trim().is_empty() {
            return Err(DomainError::validation("title must not be empty"));
        }
        if message.trim().is_empty() {
            return Err(DomainError::validation("message must not be empty"));
        }

        Ok(Self {
            id: FeedbackId::new(),
            title,
            message,
            rating,
            status: FeedbackStatus::Pending,
            author,
            created_at: Utc::now(),
            updated_at: None,
        })
    }
}
