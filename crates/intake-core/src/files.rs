//! File state machine service
//!
//! Each operation reads the file, checks the requested change against the
//! transition table and hands the store a conditional update keyed on the
//! expected source statuses. A file that changed in between is re-read and the
//! change re-judged against what is stored now, so callers never overwrite a
//! concurrent transition.
//!
//! Transitions into a terminal status (and failures) re-evaluate the status
//! of the owning batch.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::batches;
use crate::config::{DedupScope, IngestPolicy};
use crate::error::{IngestError, IngestResult};
use crate::models::{FileStatus, ImportFile, NewFileRecord};
use crate::shared::validation::{normalize_message, parse_sha256, validate_path, validate_size};
use crate::shared::{Page, PaginationParams};
use crate::state_machine::{FileChange, FileEvent, Step};
use crate::store::{DeleteOutcome, FileQuery, IngestStore};

/// Command to record a discovered file
///
/// # Examples
///
/// ```rust,ignore
/// let command = CreateFileCommand {
///     import_id,
///     path: "archive/2024/part-0001.tar".to_string(),
///     size_bytes: Some(1_048_576),
///     sha256: "AA".repeat(32),
/// };
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateFileCommand {
    pub import_id: Uuid,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<i64>,
    /// 64 hex characters, any case
    pub sha256: String,
}

impl CreateFileCommand {
    /// Validates the command and converts it into a store record
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the field:
    /// - `sha256` must be exactly 64 hex characters
    /// - `path` must be non-empty and at most 4096 bytes
    /// - `size_bytes` must not be negative
    pub fn validate(&self) -> IngestResult<NewFileRecord> {
        let sha256 = parse_sha256("sha256", &self.sha256)?;
        validate_path(&self.path)?;
        validate_size(self.size_bytes)?;

        Ok(NewFileRecord {
            import_id: self.import_id,
            path: self.path.clone(),
            size_bytes: self.size_bytes,
            sha256,
        })
    }
}

/// File list filter as received from collaborators
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import_id: Option<Uuid>,
    /// Numeric status code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<i16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl FileFilter {
    pub fn to_query(&self) -> IngestResult<FileQuery> {
        Ok(FileQuery {
            import_id: self.import_id,
            status: self
                .status
                .map(FileStatus::from_code)
                .transpose()
                .map_err(|_| IngestError::validation("status", "unknown file status code"))?,
            sha256: self
                .sha256
                .as_deref()
                .map(|hex| parse_sha256("sha256", hex))
                .transpose()?,
        })
    }
}

pub struct FileStateMachine {
    store: Arc<dyn IngestStore>,
    policy: IngestPolicy,
}

impl FileStateMachine {
    pub fn new(store: Arc<dyn IngestStore>, policy: IngestPolicy) -> Self {
        Self { store, policy }
    }

    /// Records a discovered file as PENDING and counts it in its batch
    #[tracing::instrument(skip(self, command), fields(import_id = %command.import_id, path = %command.path))]
    pub async fn create(&self, command: CreateFileCommand) -> IngestResult<ImportFile> {
        let record = command.validate()?;
        let file = self.store.insert_file(record).await?;
        tracing::debug!(file_id = file.id, sha256 = %file.sha256, "File discovered");
        Ok(file)
    }

    pub async fn get(&self, id: i64) -> IngestResult<ImportFile> {
        self.store
            .get_file(id)
            .await?
            .ok_or_else(|| IngestError::not_found("file", id))
    }

    pub async fn list(
        &self,
        filter: &FileFilter,
        page: &PaginationParams,
    ) -> IngestResult<Page<ImportFile>> {
        page.validate()?;
        let query = filter.to_query()?;
        let (items, total) = self.store.list_files(&query, page).await?;
        Ok(Page::new(items, page, total))
    }

    /// PENDING -> QUEUED
    #[tracing::instrument(skip(self), fields(file_id = id))]
    pub async fn mark_queued(&self, id: i64) -> IngestResult<ImportFile> {
        self.apply(id, FileChange::new(FileEvent::Enqueue)).await
    }

    /// PROCESSING -> INGESTED. Repeating it on an INGESTED file is a no-op.
    #[tracing::instrument(skip(self), fields(file_id = id))]
    pub async fn mark_ingested(&self, id: i64) -> IngestResult<ImportFile> {
        self.apply(id, FileChange::new(FileEvent::Ingest)).await
    }

    /// PROCESSING -> FAILED, recording the message and counting the attempt
    #[tracing::instrument(skip(self, message), fields(file_id = id))]
    pub async fn mark_failed(&self, id: i64, message: &str) -> IngestResult<ImportFile> {
        let message = normalize_message("message", message)?;
        self.apply(id, FileChange::with_message(FileEvent::Fail, message))
            .await
    }

    /// PROCESSING -> SKIPPED_DEDUP.
    ///
    /// Requires another INGESTED file with the same hash within the dedup
    /// scope.
    #[tracing::instrument(skip(self), fields(file_id = id))]
    pub async fn mark_skipped_dedup(&self, id: i64) -> IngestResult<ImportFile> {
        let file = self.get(id).await?;
        if let Err(rejected) = FileEvent::SkipDedup.check(file.status) {
            return Err(IngestError::invalid_transition("file", id, rejected.from, rejected.to));
        }

        let Some(original) = self.duplicate_of(&file).await? else {
            return Err(IngestError::conflict(format!(
                "file {id} has no ingested duplicate of {} in scope",
                file.sha256
            )));
        };
        tracing::debug!(duplicate_of = original.id, "Skipping duplicate content");

        self.apply(id, FileChange::new(FileEvent::SkipDedup)).await
    }

    /// PROCESSING -> QUARANTINED. Irreversible.
    #[tracing::instrument(skip(self, reason), fields(file_id = id))]
    pub async fn mark_quarantined(&self, id: i64, reason: &str) -> IngestResult<ImportFile> {
        let reason = normalize_message("reason", reason)?;
        self.apply(id, FileChange::with_message(FileEvent::Quarantine, reason))
            .await
    }

    /// FAILED -> PROCESSING; the attempt count moves again on the next failure
    #[tracing::instrument(skip(self), fields(file_id = id))]
    pub async fn retry(&self, id: i64) -> IngestResult<ImportFile> {
        let file = self.get(id).await?;
        if let Err(rejected) = FileEvent::Retry.check(file.status) {
            return Err(IngestError::invalid_transition("file", id, rejected.from, rejected.to));
        }
        if file.attempt_count >= self.policy.retry_ceiling {
            tracing::warn!(
                attempt_count = file.attempt_count,
                retry_ceiling = self.policy.retry_ceiling,
                "Retry ceiling reached"
            );
            return Err(IngestError::invalid_transition(
                "file",
                id,
                file.status.as_str(),
                FileEvent::Retry.target().as_str(),
            ));
        }

        let gate = self
            .store
            .claim_gate(file.import_id)
            .await?
            .ok_or_else(|| IngestError::not_found("import", file.import_id))?;
        if gate.is_closed() {
            return Err(IngestError::conflict(format!(
                "{}, file {id} cannot be retried",
                gate.closed_reason()
            )));
        }

        self.apply(id, FileChange::new(FileEvent::Retry)).await
    }

    /// Removes the file unless a worker holds it, then settles its batch
    #[tracing::instrument(skip(self), fields(file_id = id))]
    pub async fn delete(&self, id: i64) -> IngestResult<()> {
        let file = self.get(id).await?;
        match self.store.delete_file(id).await? {
            DeleteOutcome::Deleted => {
                tracing::debug!("File deleted");
                batches::settle_for_import(self.store.as_ref(), file.import_id, &self.policy)
                    .await?;
                Ok(())
            },
            DeleteOutcome::NotFound => Err(IngestError::not_found("file", id)),
            DeleteOutcome::Blocked(reason) => Err(IngestError::conflict(reason)),
        }
    }

    /// The INGESTED file this file duplicates, if any, under the dedup scope
    pub async fn find_duplicate(&self, id: i64) -> IngestResult<Option<ImportFile>> {
        let file = self.get(id).await?;
        self.duplicate_of(&file).await
    }

    async fn duplicate_of(&self, file: &ImportFile) -> IngestResult<Option<ImportFile>> {
        let scope = match self.policy.dedup_scope {
            DedupScope::Import => Some(file.import_id),
            DedupScope::Global => None,
        };
        self.store
            .find_ingested_by_hash(&file.sha256, scope, file.id)
            .await
    }

    async fn apply(&self, id: i64, change: FileChange) -> IngestResult<ImportFile> {
        let event = change.event;
        let current = self.get(id).await?;
        match event.check(current.status) {
            Ok(Step::Apply) => {},
            Ok(Step::AlreadyApplied) => return Ok(current),
            Err(rejected) => {
                return Err(IngestError::invalid_transition("file", id, rejected.from, rejected.to))
            },
        }

        let Some(updated) = self.store.apply_file_change(id, &change).await? else {
            // Lost a race; judge the change against the stored status.
            let now = self.get(id).await?;
            return match event.check(now.status) {
                Ok(Step::AlreadyApplied) => Ok(now),
                _ => Err(IngestError::invalid_transition(
                    "file",
                    id,
                    now.status.as_str(),
                    event.target().as_str(),
                )),
            };
        };

        tracing::info!(
            import_id = %updated.import_id,
            from = %current.status,
            to = %updated.status,
            attempt_count = updated.attempt_count,
            "File transitioned"
        );

        if updated.status.is_terminal() {
            batches::settle_for_import(self.store.as_ref(), updated.import_id, &self.policy)
                .await?;
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(sha256: &str, path: &str, size_bytes: Option<i64>) -> CreateFileCommand {
        CreateFileCommand {
            import_id: Uuid::nil(),
            path: path.to_string(),
            size_bytes,
            sha256: sha256.to_string(),
        }
    }

    #[test]
    fn test_validate_normalizes_hash() {
        let record = command(&"AB".repeat(32), "a/b.tar", Some(0)).validate().unwrap();
        assert_eq!(record.sha256.to_hex(), "ab".repeat(32));
    }

    #[test]
    fn test_validate_reports_field() {
        let cases = [
            (command("abc", "a", None), "sha256"),
            (command(&"g".repeat(64), "a", None), "sha256"),
            (command(&"a".repeat(64), "", None), "path"),
            (command(&"a".repeat(64), &"p".repeat(4097), None), "path"),
            (command(&"a".repeat(64), "a", Some(-1)), "size_bytes"),
        ];
        for (cmd, expected) in cases {
            match cmd.validate() {
                Err(IngestError::Validation { field, .. }) => assert_eq!(field, expected),
                other => panic!("expected validation error on {expected}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_filter_to_query() {
        let filter = FileFilter {
            import_id: None,
            status: Some(2),
            sha256: Some("CD".repeat(32)),
        };
        let query = filter.to_query().unwrap();
        assert_eq!(query.status, Some(FileStatus::Processing));
        assert_eq!(query.sha256.map(|d| d.to_hex()), Some("cd".repeat(32)));

        let bad = FileFilter {
            status: Some(42),
            ..Default::default()
        };
        assert!(matches!(bad.to_query(), Err(IngestError::Validation { field: "status", .. })));
    }
}
