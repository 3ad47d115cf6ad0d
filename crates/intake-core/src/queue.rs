//! Work queue
//!
//! Claims move PENDING/QUEUED files to PROCESSING through a single
//! conditional store operation. A file is won by at most one claimant;
//! contention only shortens the result. Every query here is restricted to
//! PENDING, QUEUED and PROCESSING rows and never scans terminal files.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::batches;
use crate::config::{IngestPolicy, StallRecovery};
use crate::error::{IngestError, IngestResult};
use crate::models::{FileStatusCounts, ImportFile};
use crate::state_machine::{FileChange, FileEvent};
use crate::store::{CountScope, IngestStore};

/// Outcome of a stall scan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StallReport {
    pub recovery: StallRecovery,
    /// Files PROCESSING since before this instant were considered stalled
    pub cutoff: DateTime<Utc>,
    /// Stalled files as found (manual) or after failing them (fail)
    pub files: Vec<ImportFile>,
}

pub struct WorkQueue {
    store: Arc<dyn IngestStore>,
    policy: IngestPolicy,
}

impl WorkQueue {
    pub fn new(store: Arc<dyn IngestStore>, policy: IngestPolicy) -> Self {
        Self { store, policy }
    }

    /// Claims up to `limit` of the oldest claimable files of an import.
    ///
    /// `limit` is capped at the configured claim limit. Cancelled imports and
    /// imports of cancelled, completed or failed batches yield
    /// `ConflictingState`.
    #[tracing::instrument(skip(self), fields(import_id = %import_id))]
    pub async fn claim_next(&self, import_id: Uuid, limit: i64) -> IngestResult<Vec<ImportFile>> {
        if limit < 1 {
            return Err(IngestError::validation("limit", "must be at least 1"));
        }
        let limit = limit.min(self.policy.claim_limit_max);

        let gate = self
            .store
            .claim_gate(import_id)
            .await?
            .ok_or_else(|| IngestError::not_found("import", import_id))?;
        if gate.is_closed() {
            return Err(IngestError::conflict(format!(
                "{}, no further claims",
                gate.closed_reason()
            )));
        }

        let claimed = self.store.claim_files(import_id, limit).await?;
        if !claimed.is_empty() {
            tracing::debug!(
                requested = limit,
                claimed = claimed.len(),
                "Claimed files"
            );
        }
        Ok(claimed)
    }

    /// PENDING, QUEUED and PROCESSING files in creation order
    pub async fn list_queued(&self, import_id: Uuid) -> IngestResult<Vec<ImportFile>> {
        self.require_import(import_id).await?;
        self.store.active_files(import_id).await
    }

    pub async fn queue_stats(&self, import_id: Uuid) -> IngestResult<FileStatusCounts> {
        self.require_import(import_id).await?;
        self.store
            .count_files(CountScope::Import(import_id), self.policy.retry_ceiling)
            .await
    }

    /// Finds PROCESSING files untouched for longer than the stall threshold
    /// and handles them according to the stall recovery policy.
    #[tracing::instrument(skip(self))]
    pub async fn recover_stalled(&self, now: DateTime<Utc>, limit: i64) -> IngestResult<StallReport> {
        let cutoff = now - Duration::seconds(self.policy.stall_threshold_secs);
        let stalled = self.store.stalled_files(cutoff, limit.max(1)).await?;

        if stalled.is_empty() {
            return Ok(StallReport {
                recovery: self.policy.stall_recovery,
                cutoff,
                files: stalled,
            });
        }

        let files = match self.policy.stall_recovery {
            StallRecovery::Manual => {
                for file in &stalled {
                    tracing::warn!(
                        file_id = file.id,
                        import_id = %file.import_id,
                        since = %file.updated_at,
                        "File stalled in processing"
                    );
                }
                stalled
            },
            StallRecovery::Fail => self.fail_stalled(stalled).await?,
        };

        Ok(StallReport {
            recovery: self.policy.stall_recovery,
            cutoff,
            files,
        })
    }

    async fn fail_stalled(&self, stalled: Vec<ImportFile>) -> IngestResult<Vec<ImportFile>> {
        let mut failed = Vec::with_capacity(stalled.len());
        let mut imports = BTreeSet::new();

        for file in stalled {
            let change = FileChange::with_message(
                FileEvent::Fail,
                format!("stalled in processing since {}", file.updated_at.to_rfc3339()),
            );
            // A worker may have reported in the meantime; leave such files alone.
            if let Some(updated) = self.store.apply_file_change(file.id, &change).await? {
                tracing::warn!(
                    file_id = updated.id,
                    import_id = %updated.import_id,
                    attempt_count = updated.attempt_count,
                    "Stalled file failed"
                );
                imports.insert(updated.import_id);
                failed.push(updated);
            }
        }

        for import_id in imports {
            batches::settle_for_import(self.store.as_ref(), import_id, &self.policy).await?;
        }
        Ok(failed)
    }

    async fn require_import(&self, import_id: Uuid) -> IngestResult<()> {
        match self.store.get_import(import_id).await? {
            Some(_) => Ok(()),
            None => Err(IngestError::not_found("import", import_id)),
        }
    }
}
