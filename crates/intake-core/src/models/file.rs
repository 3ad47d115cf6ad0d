//! Import file records

use chrono::{DateTime, Utc};
use intake_common::Sha256Digest;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{IngestError, IngestResult};

/// Per-file ingestion status, stored as a small integer code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum FileStatus {
    Pending = 0,
    Queued = 1,
    Processing = 2,
    Ingested = 3,
    Failed = 4,
    SkippedDedup = 5,
    Quarantined = 6,
}

impl FileStatus {
    pub const ALL: [FileStatus; 7] = [
        FileStatus::Pending,
        FileStatus::Queued,
        FileStatus::Processing,
        FileStatus::Ingested,
        FileStatus::Failed,
        FileStatus::SkippedDedup,
        FileStatus::Quarantined,
    ];

    /// Statuses that make up the work queue
    pub const ACTIVE: [FileStatus; 3] =
        [FileStatus::Pending, FileStatus::Queued, FileStatus::Processing];

    /// Statuses `claim_next` may pick up
    pub const CLAIMABLE: [FileStatus; 2] = [FileStatus::Pending, FileStatus::Queued];

    pub fn code(self) -> i16 {
        self as i16
    }

    pub fn from_code(code: i16) -> IngestResult<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.code() == code)
            .ok_or_else(|| {
                IngestError::validation("status", format!("unknown file status code {code}"))
            })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Queued => "queued",
            FileStatus::Processing => "processing",
            FileStatus::Ingested => "ingested",
            FileStatus::Failed => "failed",
            FileStatus::SkippedDedup => "skipped_dedup",
            FileStatus::Quarantined => "quarantined",
        }
    }

    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }

    pub fn is_claimable(self) -> bool {
        Self::CLAIMABLE.contains(&self)
    }

    /// INGESTED, SKIPPED_DEDUP and QUARANTINED. FAILED is excluded because a
    /// retry moves it back into the active set.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            FileStatus::Ingested | FileStatus::SkippedDedup | FileStatus::Quarantined
        )
    }

    /// Any processing outcome, including the retryable FAILED.
    pub fn is_terminal(self) -> bool {
        self.is_final() || self == FileStatus::Failed
    }

    /// Statuses that count towards `Batch::file_count_ingested` and carry `ingested_at`
    pub fn counts_as_ingested(self) -> bool {
        matches!(self, FileStatus::Ingested | FileStatus::SkippedDedup)
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One file's ingestion record (maps to import_files table)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportFile {
    pub id: i64,
    pub import_id: Uuid,
    pub path: String,
    pub size_bytes: Option<i64>,
    pub sha256: Sha256Digest,
    pub status: FileStatus,
    pub ingested_at: Option<DateTime<Utc>>,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImportFile {
    pub fn status_name(&self) -> &'static str {
        self.status.as_str()
    }

    pub fn in_queue(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Validated input for a new file row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFileRecord {
    pub import_id: Uuid,
    pub path: String,
    pub size_bytes: Option<i64>,
    pub sha256: Sha256Digest,
}

/// File counts per status for an import or a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStatusCounts {
    pub pending: i64,
    pub queued: i64,
    pub processing: i64,
    pub ingested: i64,
    pub failed: i64,
    pub skipped_dedup: i64,
    pub quarantined: i64,
    /// FAILED files whose attempt_count reached the retry ceiling
    pub failed_exhausted: i64,
}

impl FileStatusCounts {
    pub fn add(&mut self, status: FileStatus, count: i64) {
        let slot = match status {
            FileStatus::Pending => &mut self.pending,
            FileStatus::Queued => &mut self.queued,
            FileStatus::Processing => &mut self.processing,
            FileStatus::Ingested => &mut self.ingested,
            FileStatus::Failed => &mut self.failed,
            FileStatus::SkippedDedup => &mut self.skipped_dedup,
            FileStatus::Quarantined => &mut self.quarantined,
        };
        *slot += count;
    }

    pub fn get(&self, status: FileStatus) -> i64 {
        match status {
            FileStatus::Pending => self.pending,
            FileStatus::Queued => self.queued,
            FileStatus::Processing => self.processing,
            FileStatus::Ingested => self.ingested,
            FileStatus::Failed => self.failed,
            FileStatus::SkippedDedup => self.skipped_dedup,
            FileStatus::Quarantined => self.quarantined,
        }
    }

    pub fn total(&self) -> i64 {
        FileStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }

    /// Files still in the work queue
    pub fn active(&self) -> i64 {
        self.pending + self.queued + self.processing
    }

    pub fn claimable(&self) -> i64 {
        self.pending + self.queued
    }

    pub fn ingested_total(&self) -> i64 {
        self.ingested + self.skipped_dedup
    }

    pub fn failed_retryable(&self) -> i64 {
        self.failed - self.failed_exhausted
    }
}
