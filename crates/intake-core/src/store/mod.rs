//! Entity store
//!
//! [`IngestStore`] is the only seam between the services and persistence.
//! Its mutating methods are conditional: every status change names the
//! statuses it expects to find (see [`crate::state_machine`]) and reports
//! `None` when the row no longer matches, so concurrent callers coordinate
//! through the store alone.
//!
//! Two implementations exist:
//! - [`PgStore`]: PostgreSQL, the durable store shared by distributed workers
//! - [`MemoryStore`]: a single-process store with the same semantics, used by
//!   tests and embedded tooling

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use intake_common::Sha256Digest;
use uuid::Uuid;

use crate::error::IngestResult;
use crate::models::{
    AttemptStatus, Batch, BatchStatus, FileStatus, FileStatusCounts, Import, ImportAttempt,
    ImportFile, NewBatch, NewFileRecord,
};
use crate::shared::PaginationParams;
use crate::state_machine::{AttemptChange, FileChange};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Result of a guarded delete
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    /// The row exists but its state forbids deletion
    Blocked(String),
}

/// Which files a count covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountScope {
    Import(Uuid),
    /// All files of all imports attached to the batch
    Batch(Uuid),
}

/// State `claim_next` has to check before claiming
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimGate {
    pub import: Import,
    pub batch_status: Option<BatchStatus>,
}

impl ClaimGate {
    /// No further claims: the import is cancelled or its batch has settled.
    /// Completion is final, so a COMPLETED or FAILED batch closes like a
    /// cancelled one.
    pub fn is_closed(&self) -> bool {
        self.import.is_cancelled() || self.batch_status.is_some_and(BatchStatus::is_terminal)
    }

    /// Why claims are refused, for error messages
    pub fn closed_reason(&self) -> String {
        match self.batch_status {
            Some(status) if status.is_terminal() && !self.import.is_cancelled() => {
                format!("batch of import {} is {}", self.import.id, status.as_str())
            },
            _ => format!("import {} is cancelled", self.import.id),
        }
    }
}

/// File list filter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileQuery {
    pub import_id: Option<Uuid>,
    pub status: Option<FileStatus>,
    pub sha256: Option<Sha256Digest>,
}

/// Attempt list filter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptQuery {
    pub import_id: Option<Uuid>,
    pub status: Option<AttemptStatus>,
}

#[async_trait]
pub trait IngestStore: Send + Sync {
    // ------------------------------------------------------------------
    // Batches
    // ------------------------------------------------------------------

    async fn insert_batch(&self, batch: NewBatch) -> IngestResult<Batch>;

    async fn get_batch(&self, id: Uuid) -> IngestResult<Option<Batch>>;

    async fn list_batches(
        &self,
        status: Option<BatchStatus>,
        page: &PaginationParams,
    ) -> IngestResult<(Vec<Batch>, i64)>;

    /// Sets the expected count unless it is below the discovered count.
    /// `None` when the batch does not exist or the guard failed.
    async fn set_expected_count(&self, id: Uuid, expected: i64) -> IngestResult<Option<Batch>>;

    /// Compare-and-set on the batch status.
    async fn update_batch_status(
        &self,
        id: Uuid,
        from: &[BatchStatus],
        to: BatchStatus,
    ) -> IngestResult<Option<Batch>>;

    /// Recomputes both counters from a single snapshot of file statuses.
    async fn recount_batch(&self, id: Uuid) -> IngestResult<Option<Batch>>;

    // ------------------------------------------------------------------
    // Imports
    // ------------------------------------------------------------------

    async fn insert_import(&self, batch_id: Option<Uuid>) -> IngestResult<Import>;

    async fn get_import(&self, id: Uuid) -> IngestResult<Option<Import>>;

    async fn cancel_import(&self, id: Uuid) -> IngestResult<Option<Import>>;

    /// Removes the import with its files and attempts, then recounts its batch.
    /// Blocked while any file is PROCESSING or any attempt is non-terminal.
    async fn delete_import(&self, id: Uuid) -> IngestResult<DeleteOutcome>;

    async fn claim_gate(&self, import_id: Uuid) -> IngestResult<Option<ClaimGate>>;

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    /// Inserts a PENDING file and counts it as discovered in its batch.
    /// Fails with `ConflictingState` when the batch already holds its
    /// expected number of files or has reached a terminal status, and
    /// `NotFound` when the import is missing.
    async fn insert_file(&self, file: NewFileRecord) -> IngestResult<ImportFile>;

    async fn get_file(&self, id: i64) -> IngestResult<Option<ImportFile>>;

    async fn list_files(
        &self,
        query: &FileQuery,
        page: &PaginationParams,
    ) -> IngestResult<(Vec<ImportFile>, i64)>;

    /// Applies `change` only if the file's status is one of the event's
    /// sources. Transitions into INGESTED/SKIPPED_DEDUP bump the batch's
    /// ingested counter in the same step.
    async fn apply_file_change(
        &self,
        id: i64,
        change: &FileChange,
    ) -> IngestResult<Option<ImportFile>>;

    /// Deletes the file unless it is PROCESSING and adjusts batch counters.
    async fn delete_file(&self, id: i64) -> IngestResult<DeleteOutcome>;

    /// Moves up to `limit` claimable files of an uncancelled import to
    /// PROCESSING, oldest first, skipping rows other claimants hold. Marks a
    /// PENDING batch RUNNING when anything was claimed.
    async fn claim_files(&self, import_id: Uuid, limit: i64) -> IngestResult<Vec<ImportFile>>;

    /// PENDING, QUEUED and PROCESSING files of an import in creation order.
    async fn active_files(&self, import_id: Uuid) -> IngestResult<Vec<ImportFile>>;

    async fn count_files(
        &self,
        scope: CountScope,
        retry_ceiling: i32,
    ) -> IngestResult<FileStatusCounts>;

    /// An INGESTED file with the given hash other than `exclude_id`,
    /// restricted to `import_id` when given.
    async fn find_ingested_by_hash(
        &self,
        sha256: &Sha256Digest,
        import_id: Option<Uuid>,
        exclude_id: i64,
    ) -> IngestResult<Option<ImportFile>>;

    /// PROCESSING files last updated before `older_than`, oldest first.
    async fn stalled_files(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> IngestResult<Vec<ImportFile>>;

    // ------------------------------------------------------------------
    // Attempts
    // ------------------------------------------------------------------

    /// Creates a PENDING attempt. `ConflictingState` when the import already
    /// has a non-terminal attempt, `NotFound` when the import is missing.
    async fn insert_attempt(&self, import_id: Uuid) -> IngestResult<ImportAttempt>;

    async fn get_attempt(&self, id: i64) -> IngestResult<Option<ImportAttempt>>;

    async fn list_attempts(
        &self,
        query: &AttemptQuery,
        page: &PaginationParams,
    ) -> IngestResult<(Vec<ImportAttempt>, i64)>;

    async fn apply_attempt_change(
        &self,
        id: i64,
        change: &AttemptChange,
    ) -> IngestResult<Option<ImportAttempt>>;

    /// Deletes the attempt unless it is PENDING or RUNNING.
    async fn delete_attempt(&self, id: i64) -> IngestResult<DeleteOutcome>;
}
