//! Batch aggregator
//!
//! Keeps batch counters and status consistent with the files of the batch.
//! Counters move incrementally inside the store as files are discovered,
//! ingested and deleted; [`BatchAggregator::reconcile`] recomputes them from a
//! full scan and converges with the incremental path. Status follows
//! [`rollup_status`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::IngestPolicy;
use crate::error::{IngestError, IngestResult};
use crate::models::{Batch, BatchStatus, FileStatusCounts, NewBatch};
use crate::shared::validation::parse_sha256;
use crate::shared::{Page, PaginationParams};
use crate::store::{CountScope, IngestStore};

/// Status a batch should have given the statuses of its files.
///
/// - terminal statuses never change
/// - any FAILED file that exhausted its retries fails the batch
/// - while work remains (active or retryable files, or files still to be
///   discovered) the batch is RUNNING once any file left the claimable set
/// - once everything settled the batch COMPLETES if something was ingested
///   and quarantines stay within tolerance, and FAILS otherwise
pub fn rollup_status(
    current: BatchStatus,
    counts: &FileStatusCounts,
    expected: Option<i64>,
    policy: &IngestPolicy,
) -> BatchStatus {
    if current.is_terminal() {
        return current;
    }
    if counts.failed_exhausted > 0 {
        return BatchStatus::Failed;
    }

    let total = counts.total();
    let unsettled = counts.active() + counts.failed_retryable();
    let all_discovered = expected.map_or(true, |expected| total >= expected);

    if total == 0 || unsettled > 0 || !all_discovered {
        let started = total > counts.claimable();
        return if started { BatchStatus::Running } else { current };
    }

    if counts.ingested_total() > 0 && counts.quarantined <= policy.quarantine_tolerance {
        BatchStatus::Completed
    } else {
        BatchStatus::Failed
    }
}

/// Applies [`rollup_status`] to a batch, writing the new status if it changed
pub(crate) async fn settle(
    store: &dyn IngestStore,
    batch: Batch,
    policy: &IngestPolicy,
) -> IngestResult<Batch> {
    let counts = store
        .count_files(CountScope::Batch(batch.id), policy.retry_ceiling)
        .await?;
    let next = rollup_status(batch.status, &counts, batch.file_count_expected, policy);
    if next == batch.status || !batch.status.can_become(next) {
        return Ok(batch);
    }

    match store.update_batch_status(batch.id, &[batch.status], next).await? {
        Some(updated) => {
            tracing::info!(
                batch_id = %updated.id,
                from = %batch.status,
                to = %next,
                discovered = updated.file_count_discovered,
                ingested = updated.file_count_ingested,
                "Batch status rolled up"
            );
            Ok(updated)
        },
        None => {
            // Someone else moved the batch first; report what is stored now.
            store
                .get_batch(batch.id)
                .await?
                .ok_or_else(|| IngestError::not_found("batch", batch.id))
        },
    }
}

/// Settles the batch an import belongs to, if any
pub(crate) async fn settle_for_import(
    store: &dyn IngestStore,
    import_id: Uuid,
    policy: &IngestPolicy,
) -> IngestResult<Option<Batch>> {
    let Some(batch_id) = store.get_import(import_id).await?.and_then(|i| i.batch_id) else {
        return Ok(None);
    };
    match store.get_batch(batch_id).await? {
        Some(batch) => settle(store, batch, policy).await.map(Some),
        None => Ok(None),
    }
}

/// Command to register a batch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateBatchCommand {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    /// Lowercase or uppercase hex
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_count_expected: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl CreateBatchCommand {
    /// Validates the command and converts it into a store record
    pub fn validate(self) -> IngestResult<NewBatch> {
        if matches!(self.file_count_expected, Some(n) if n < 0) {
            return Err(IngestError::validation("file_count_expected", "must not be negative"));
        }
        let manifest_sha256 = self
            .manifest_sha256
            .as_deref()
            .map(|hex| parse_sha256("manifest_sha256", hex))
            .transpose()?;

        Ok(NewBatch {
            source_system: self.source_system,
            created_by: self.created_by,
            manifest_sha256,
            file_count_expected: self.file_count_expected,
            metadata: self.metadata,
        })
    }
}

pub struct BatchAggregator {
    store: Arc<dyn IngestStore>,
    policy: IngestPolicy,
}

impl BatchAggregator {
    pub fn new(store: Arc<dyn IngestStore>, policy: IngestPolicy) -> Self {
        Self { store, policy }
    }

    #[tracing::instrument(skip(self, command))]
    pub async fn create(&self, command: CreateBatchCommand) -> IngestResult<Batch> {
        let batch = self.store.insert_batch(command.validate()?).await?;
        tracing::info!(batch_id = %batch.id, expected = ?batch.file_count_expected, "Batch created");
        Ok(batch)
    }

    pub async fn get(&self, id: Uuid) -> IngestResult<Batch> {
        self.store
            .get_batch(id)
            .await?
            .ok_or_else(|| IngestError::not_found("batch", id))
    }

    /// Newest first
    pub async fn list(
        &self,
        status: Option<BatchStatus>,
        page: &PaginationParams,
    ) -> IngestResult<Page<Batch>> {
        page.validate()?;
        let (items, total) = self.store.list_batches(status, page).await?;
        Ok(Page::new(items, page, total))
    }

    /// Per-status file counts across all imports of the batch
    pub async fn file_counts(&self, id: Uuid) -> IngestResult<FileStatusCounts> {
        self.get(id).await?;
        self.store
            .count_files(CountScope::Batch(id), self.policy.retry_ceiling)
            .await
    }

    /// Records the expected file count once the manifest is known.
    ///
    /// Rejects values below the number of files already discovered.
    #[tracing::instrument(skip(self), fields(batch_id = %id))]
    pub async fn set_expected_count(&self, id: Uuid, expected: i64) -> IngestResult<Batch> {
        if expected < 0 {
            return Err(IngestError::validation("file_count_expected", "must not be negative"));
        }

        match self.store.set_expected_count(id, expected).await? {
            Some(batch) => settle(self.store.as_ref(), batch, &self.policy).await,
            None => {
                let batch = self.get(id).await?;
                Err(IngestError::conflict(format!(
                    "batch {id} already discovered {} files, cannot expect {expected}",
                    batch.file_count_discovered
                )))
            },
        }
    }

    /// Recomputes counters from file statuses, then rolls up the status
    #[tracing::instrument(skip(self), fields(batch_id = %id))]
    pub async fn reconcile(&self, id: Uuid) -> IngestResult<Batch> {
        let before = self.get(id).await?;
        let recounted = self
            .store
            .recount_batch(id)
            .await?
            .ok_or_else(|| IngestError::not_found("batch", id))?;

        if recounted.file_count_discovered != before.file_count_discovered
            || recounted.file_count_ingested != before.file_count_ingested
        {
            tracing::warn!(
                discovered_before = before.file_count_discovered,
                discovered = recounted.file_count_discovered,
                ingested_before = before.file_count_ingested,
                ingested = recounted.file_count_ingested,
                "Batch counters drifted and were corrected"
            );
        }

        settle(self.store.as_ref(), recounted, &self.policy).await
    }

    /// Cancels the batch; claims for all of its imports stop at once.
    ///
    /// Cancelling a cancelled batch is a no-op; other terminal batches are
    /// rejected.
    #[tracing::instrument(skip(self), fields(batch_id = %id))]
    pub async fn cancel(&self, id: Uuid) -> IngestResult<Batch> {
        let current = self.get(id).await?;
        if current.status == BatchStatus::Cancelled {
            return Ok(current);
        }
        if current.status.is_terminal() {
            return Err(IngestError::invalid_transition(
                "batch",
                id,
                current.status.as_str(),
                BatchStatus::Cancelled.as_str(),
            ));
        }

        let from = [BatchStatus::Pending, BatchStatus::Running];
        match self
            .store
            .update_batch_status(id, &from, BatchStatus::Cancelled)
            .await?
        {
            Some(batch) => {
                tracing::info!(from = %current.status, "Batch cancelled");
                Ok(batch)
            },
            None => {
                let now = self.get(id).await?;
                if now.status == BatchStatus::Cancelled {
                    Ok(now)
                } else {
                    Err(IngestError::invalid_transition(
                        "batch",
                        id,
                        now.status.as_str(),
                        BatchStatus::Cancelled.as_str(),
                    ))
                }
            },
        }
    }
}
