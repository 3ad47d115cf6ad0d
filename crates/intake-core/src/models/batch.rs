//! Batch records

use chrono::{DateTime, Utc};
use intake_common::Sha256Digest;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{IngestError, IngestResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum BatchStatus {
    Pending = 0,
    Running = 1,
    Completed = 2,
    Failed = 3,
    Cancelled = 4,
}

impl BatchStatus {
    pub const ALL: [BatchStatus; 5] = [
        BatchStatus::Pending,
        BatchStatus::Running,
        BatchStatus::Completed,
        BatchStatus::Failed,
        BatchStatus::Cancelled,
    ];

    pub fn code(self) -> i16 {
        self as i16
    }

    pub fn from_code(code: i16) -> IngestResult<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.code() == code)
            .ok_or_else(|| {
                IngestError::validation("status", format!("unknown batch status code {code}"))
            })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Cancelled
        )
    }

    /// Monotone progression: terminal values are sticky and RUNNING never
    /// falls back to PENDING.
    pub fn can_become(self, next: BatchStatus) -> bool {
        match (self, next) {
            (from, to) if from == to => false,
            (from, _) if from.is_terminal() => false,
            (BatchStatus::Running, BatchStatus::Pending) => false,
            _ => true,
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical grouping of files (maps to batches table)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub source_system: Option<String>,
    pub created_by: Option<String>,
    pub manifest_sha256: Option<Sha256Digest>,
    pub status: BatchStatus,
    /// Unknown until the manifest has been parsed
    pub file_count_expected: Option<i64>,
    pub file_count_discovered: i64,
    pub file_count_ingested: i64,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Batch {
    /// Counter invariants that must hold at every observed point
    pub fn counters_consistent(&self) -> bool {
        0 <= self.file_count_ingested
            && self.file_count_ingested <= self.file_count_discovered
            && self
                .file_count_expected
                .map_or(true, |expected| self.file_count_discovered <= expected)
    }
}

/// Input for registering a batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewBatch {
    pub source_system: Option<String>,
    pub created_by: Option<String>,
    pub manifest_sha256: Option<Sha256Digest>,
    pub file_count_expected: Option<i64>,
    pub metadata: Option<serde_json::Value>,
}
