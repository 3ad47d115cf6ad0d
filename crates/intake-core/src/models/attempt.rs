//! Import attempt records

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{IngestError, IngestResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum AttemptStatus {
    Pending = 0,
    Running = 1,
    Completed = 2,
    Failed = 3,
    Cancelled = 4,
}

impl AttemptStatus {
    pub const ALL: [AttemptStatus; 5] = [
        AttemptStatus::Pending,
        AttemptStatus::Running,
        AttemptStatus::Completed,
        AttemptStatus::Failed,
        AttemptStatus::Cancelled,
    ];

    pub const ACTIVE: [AttemptStatus; 2] = [AttemptStatus::Pending, AttemptStatus::Running];

    pub fn code(self) -> i16 {
        self as i16
    }

    pub fn from_code(code: i16) -> IngestResult<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.code() == code)
            .ok_or_else(|| {
                IngestError::validation("status", format!("unknown attempt status code {code}"))
            })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Running => "running",
            AttemptStatus::Completed => "completed",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        !Self::ACTIVE.contains(&self)
    }
}

impl std::fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution run of an import (maps to import_attempts table)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportAttempt {
    pub id: i64,
    pub import_id: Uuid,
    /// Set when the attempt moves to RUNNING
    pub started_at: Option<DateTime<Utc>>,
    /// Set exactly when the status is terminal
    pub ended_at: Option<DateTime<Utc>>,
    pub status: AttemptStatus,
    pub error_summary: Option<String>,
}

impl ImportAttempt {
    /// `None` while the attempt is in progress
    pub fn duration(&self) -> Option<Duration> {
        Some(self.ended_at? - self.started_at?)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(started: Option<i64>, ended: Option<i64>) -> ImportAttempt {
        let at = |secs| DateTime::<Utc>::from_timestamp(secs, 0);
        ImportAttempt {
            id: 1,
            import_id: Uuid::nil(),
            started_at: started.and_then(at),
            ended_at: ended.and_then(at),
            status: AttemptStatus::Completed,
            error_summary: None,
        }
    }

    #[test]
    fn test_duration_requires_both_ends() {
        assert_eq!(attempt(Some(100), Some(160)).duration(), Some(Duration::seconds(60)));
        assert_eq!(attempt(Some(100), None).duration(), None);
        assert_eq!(attempt(None, Some(160)).duration(), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!AttemptStatus::Pending.is_terminal());
        assert!(!AttemptStatus::Running.is_terminal());
        assert!(AttemptStatus::Cancelled.is_terminal());
    }
}
