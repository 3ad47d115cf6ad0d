//! Attempt supervisor
//!
//! An attempt is one execution run of an import:
//! PENDING -> RUNNING -> {COMPLETED, FAILED, CANCELLED}. Terminal events are
//! accepted from PENDING as well, and an import has at most one unfinished
//! attempt at a time.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{IngestError, IngestResult};
use crate::models::{AttemptStatus, ImportAttempt};
use crate::shared::validation::normalize_message;
use crate::shared::{Page, PaginationParams};
use crate::state_machine::{AttemptChange, AttemptEvent};
use crate::store::{AttemptQuery, DeleteOutcome, IngestStore};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttemptFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import_id: Option<Uuid>,
    /// Numeric status code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<i16>,
}

impl AttemptFilter {
    pub fn to_query(&self) -> IngestResult<AttemptQuery> {
        Ok(AttemptQuery {
            import_id: self.import_id,
            status: self
                .status
                .map(AttemptStatus::from_code)
                .transpose()
                .map_err(|_| IngestError::validation("status", "unknown attempt status code"))?,
        })
    }
}

pub struct AttemptSupervisor {
    store: Arc<dyn IngestStore>,
}

impl AttemptSupervisor {
    pub fn new(store: Arc<dyn IngestStore>) -> Self {
        Self { store }
    }

    /// Opens a PENDING attempt for the import
    #[tracing::instrument(skip(self), fields(import_id = %import_id))]
    pub async fn begin(&self, import_id: Uuid) -> IngestResult<ImportAttempt> {
        let attempt = self.store.insert_attempt(import_id).await?;
        tracing::info!(attempt_id = attempt.id, "Attempt opened");
        Ok(attempt)
    }

    #[tracing::instrument(skip(self), fields(attempt_id = id))]
    pub async fn start(&self, id: i64) -> IngestResult<ImportAttempt> {
        self.apply(id, AttemptChange::new(AttemptEvent::Start)).await
    }

    #[tracing::instrument(skip(self), fields(attempt_id = id))]
    pub async fn mark_completed(&self, id: i64) -> IngestResult<ImportAttempt> {
        self.apply(id, AttemptChange::new(AttemptEvent::Complete)).await
    }

    #[tracing::instrument(skip(self, summary), fields(attempt_id = id))]
    pub async fn mark_failed(&self, id: i64, summary: &str) -> IngestResult<ImportAttempt> {
        let change = AttemptChange {
            event: AttemptEvent::Fail,
            error_summary: Some(normalize_message("error_summary", summary)?),
        };
        self.apply(id, change).await
    }

    #[tracing::instrument(skip(self), fields(attempt_id = id))]
    pub async fn mark_cancelled(&self, id: i64) -> IngestResult<ImportAttempt> {
        self.apply(id, AttemptChange::new(AttemptEvent::Cancel)).await
    }

    /// Deletes a finished attempt
    #[tracing::instrument(skip(self), fields(attempt_id = id))]
    pub async fn delete(&self, id: i64) -> IngestResult<()> {
        match self.store.delete_attempt(id).await? {
            DeleteOutcome::Deleted => Ok(()),
            DeleteOutcome::NotFound => Err(IngestError::not_found("attempt", id)),
            DeleteOutcome::Blocked(reason) => Err(IngestError::conflict(reason)),
        }
    }

    pub async fn get(&self, id: i64) -> IngestResult<ImportAttempt> {
        self.store
            .get_attempt(id)
            .await?
            .ok_or_else(|| IngestError::not_found("attempt", id))
    }

    pub async fn list(
        &self,
        filter: &AttemptFilter,
        page: &PaginationParams,
    ) -> IngestResult<Page<ImportAttempt>> {
        page.validate()?;
        let query = filter.to_query()?;
        let (items, total) = self.store.list_attempts(&query, page).await?;
        Ok(Page::new(items, page, total))
    }

    async fn apply(&self, id: i64, change: AttemptChange) -> IngestResult<ImportAttempt> {
        let current = self.get(id).await?;
        if let Err(rejected) = change.event.check(current.status) {
            return Err(IngestError::invalid_transition("attempt", id, rejected.from, rejected.to));
        }

        match self.store.apply_attempt_change(id, &change).await? {
            Some(updated) => {
                tracing::info!(
                    import_id = %updated.import_id,
                    from = %current.status,
                    to = %updated.status,
                    duration_ms = ?updated.duration().map(|d| d.num_milliseconds()),
                    "Attempt transitioned"
                );
                Ok(updated)
            },
            None => {
                let now = self.get(id).await?;
                Err(IngestError::invalid_transition(
                    "attempt",
                    id,
                    now.status.as_str(),
                    change.event.target().as_str(),
                ))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_rejects_unknown_status() {
        let filter = AttemptFilter {
            import_id: None,
            status: Some(9),
        };
        assert!(matches!(filter.to_query(), Err(IngestError::Validation { field: "status", .. })));

        let filter = AttemptFilter {
            import_id: None,
            status: Some(1),
        };
        assert_eq!(filter.to_query().unwrap().status, Some(AttemptStatus::Running));
    }
}
