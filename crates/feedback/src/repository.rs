//! Storage collaborator contract for feedback records.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use echoboard_core::FeedbackId;

use crate::record::FeedbackRecord;
use crate::status::FeedbackStatus;

/// Repository error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RepositoryError {
    #[error("feedback not found: {0}")]
    NotFound(FeedbackId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Read/update access to feedback records, implemented by the application's
/// storage layer.
#[async_trait]
pub trait FeedbackRepository: Send + Sync {
    async fn find(&self, id: FeedbackId) -> Result<Option<FeedbackRecord>, RepositoryError>;

    async fn get_status(&self, id: FeedbackId) -> Result<FeedbackStatus, RepositoryError> {
        self.find(id)
            .await?
            .map(|record| record.status)
            .ok_or(RepositoryError::NotFound(id))
    }

    /// Persist a new status and return the updated record.
    async fn set_status(
        &self,
        id: FeedbackId,
        status: FeedbackStatus,
    ) -> Result<FeedbackRecord, RepositoryError>;
}

/// In-memory repository for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryFeedbackRepository {
    records: Mutex<HashMap<FeedbackId, FeedbackRecord>>,
}

impl InMemoryFeedbackRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: FeedbackRecord) -> Result<(), RepositoryError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| RepositoryError::Storage("lock poisoned".to_string()))?;
        records.insert(record.id, record);
        Ok(())
    }
}

#[async_trait]
impl FeedbackRepository for InMemoryFeedbackRepository {
    async fn find(&self, id: FeedbackId) -> Result<Option<FeedbackRecord>, RepositoryError> {
        let records = self
            .records
            .lock()
            .map_err(|_| RepositoryError::Storage("lock poisoned".to_string()))?;
        Ok(records.get(&id).cloned())
    }

    async fn set_status(
        &self,
        id: FeedbackId,
        status: FeedbackStatus,
    ) -> Result<FeedbackRecord, RepositoryError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| RepositoryError::Storage("lock poisoned".to_string()))?;
        let record = records.get_mut(&id).ok_or(RepositoryError::NotFound(id))?;
        record.status = status;
        record.updated_at = Some(Utc::now());
        Ok(record.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Author, Rating};
    use echoboard_core::UserId;

    fn record() -> FeedbackRecord {
        let author = Author {
            id: UserId::new(),
            name: "Grace".to_string(),
            email: "grace@example.com".to_string(),
        };
        FeedbackRecord::new(author, "Search", "Add search", Rating::new(5).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn set_status_updates_record_and_timestamp() {
        let repo = InMemoryFeedbackRepository::new();
        let record = record();
        let id = record.id;
        repo.insert(record).unwrap();

        let updated = repo.set_status(id, FeedbackStatus::Approved).await.unwrap();
        assert_eq!(updated.status, FeedbackStatus::Approved);
        assert!(updated.updated_at.is_some());
        assert_eq!(repo.get_status(id).await.unwrap(), FeedbackStatus::Approved);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let repo = InMemoryFeedbackRepository::new();
        let id = FeedbackId::new();
        assert!(matches!(
            repo.get_status(id).await,
            Err(RepositoryError::NotFound(missing)) if missing == id
        ));
    }
}
