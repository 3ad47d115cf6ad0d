//! Transition tables for files and attempts
//!
//! The tables are stateless values: they decide whether a status change is
//! allowed and what it implies, and nothing else. Services consult them
//! before touching the store, and stores use [`FileEvent::sources`] /
//! [`AttemptEvent::sources`] as the expected-previous-status condition of
//! their compare-and-set updates, so a row that changed underneath a caller is
//! never overwritten.
//!
//! ```text
//! PENDING -> QUEUED -> PROCESSING -> { INGESTED, FAILED, SKIPPED_DEDUP, QUARANTINED }
//! PENDING -> PROCESSING
//! FAILED  -> PROCESSING   (retry)
//! ```

use serde::{Deserialize, Serialize};

use crate::models::{AttemptStatus, FileStatus};

/// Outcome of checking an event against the current status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The event moves the record to its target status
    Apply,
    /// The record already is in the target status and the event is idempotent
    AlreadyApplied,
}

/// Rejected status change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected {
    pub from: &'static str,
    pub to: &'static str,
}

/// A requested change to an import file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileEvent {
    Enqueue,
    Claim,
    Retry,
    Ingest,
    Fail,
    SkipDedup,
    Quarantine,
}

impl FileEvent {
    pub fn target(self) -> FileStatus {
        match self {
            FileEvent::Enqueue => FileStatus::Queued,
            FileEvent::Claim | FileEvent::Retry => FileStatus::Processing,
            FileEvent::Ingest => FileStatus::Ingested,
            FileEvent::Fail => FileStatus::Failed,
            FileEvent::SkipDedup => FileStatus::SkippedDedup,
            FileEvent::Quarantine => FileStatus::Quarantined,
        }
    }

    /// Statuses the event may start from
    pub fn sources(self) -> &'static [FileStatus] {
        match self {
            FileEvent::Enqueue => &[FileStatus::Pending],
            FileEvent::Claim => &FileStatus::CLAIMABLE,
            FileEvent::Retry => &[FileStatus::Failed],
            FileEvent::Ingest | FileEvent::Fail | FileEvent::SkipDedup | FileEvent::Quarantine => {
                &[FileStatus::Processing]
            },
        }
    }

    /// Re-applying an ingest to an INGESTED file is a no-op rather than an error
    pub fn is_idempotent(self) -> bool {
        self == FileEvent::Ingest
    }

    pub fn sets_ingested_at(self) -> bool {
        self.target().counts_as_ingested()
    }

    pub fn increments_attempts(self) -> bool {
        self == FileEvent::Fail
    }

    /// Whether the event records `last_error`
    pub fn records_error(self) -> bool {
        matches!(self, FileEvent::Fail | FileEvent::Quarantine)
    }

    pub fn check(self, current: FileStatus) -> Result<Step, Rejected> {
        if self.sources().contains(&current) {
            Ok(Step::Apply)
        } else if self.is_idempotent() && current == self.target() {
            Ok(Step::AlreadyApplied)
        } else {
            Err(Rejected {
                from: current.as_str(),
                to: self.target().as_str(),
            })
        }
    }
}

/// Edge lookup independent of events
pub fn file_transition_allowed(from: FileStatus, to: FileStatus) -> bool {
    FILE_EVENTS
        .iter()
        .any(|event| event.target() == to && event.sources().contains(&from))
}

const FILE_EVENTS: [FileEvent; 7] = [
    FileEvent::Enqueue,
    FileEvent::Claim,
    FileEvent::Retry,
    FileEvent::Ingest,
    FileEvent::Fail,
    FileEvent::SkipDedup,
    FileEvent::Quarantine,
];

/// An event plus the text it records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub event: FileEvent,
    pub message: Option<String>,
}

impl FileChange {
    pub fn new(event: FileEvent) -> Self {
        Self { event, message: None }
    }

    pub fn with_message(event: FileEvent, message: impl Into<String>) -> Self {
        Self {
            event,
            message: Some(message.into()),
        }
    }

    /// Source status codes for conditional updates
    pub fn source_codes(&self) -> Vec<i16> {
        self.event.sources().iter().map(|s| s.code()).collect()
    }
}

/// A requested change to an import attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptEvent {
    Start,
    Complete,
    Fail,
    Cancel,
}

impl AttemptEvent {
    pub fn target(self) -> AttemptStatus {
        match self {
            AttemptEvent::Start => AttemptStatus::Running,
            AttemptEvent::Complete => AttemptStatus::Completed,
            AttemptEvent::Fail => AttemptStatus::Failed,
            AttemptEvent::Cancel => AttemptStatus::Cancelled,
        }
    }

    pub fn sources(self) -> &'static [AttemptStatus] {
        match self {
            AttemptEvent::Start => &[AttemptStatus::Pending],
            AttemptEvent::Complete | AttemptEvent::Fail | AttemptEvent::Cancel => {
                &AttemptStatus::ACTIVE
            },
        }
    }

    /// Terminal events stamp `ended_at`
    pub fn ends_attempt(self) -> bool {
        self.target().is_terminal()
    }

    pub fn check(self, current: AttemptStatus) -> Result<Step, Rejected> {
        if self.sources().contains(&current) {
            Ok(Step::Apply)
        } else {
            Err(Rejected {
                from: current.as_str(),
                to: self.target().as_str(),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptChange {
    pub event: AttemptEvent,
    pub error_summary: Option<String>,
}

impl AttemptChange {
    pub fn new(event: AttemptEvent) -> Self {
        Self {
            event,
            error_summary: None,
        }
    }

    pub fn source_codes(&self) -> Vec<i16> {
        self.event.sources().iter().map(|s| s.code()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use FileStatus::*;

    #[test]
    fn test_file_edges_match_diagram() {
        let allowed = [
            (Pending, Queued),
            (Pending, Processing),
            (Queued, Processing),
            (Failed, Processing),
            (Processing, Ingested),
            (Processing, Failed),
            (Processing, SkippedDedup),
            (Processing, Quarantined),
        ];

        for from in FileStatus::ALL {
            for to in FileStatus::ALL {
                assert_eq!(
                    file_transition_allowed(from, to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_no_edges_back_into_pending_or_queued() {
        for from in FileStatus::ALL {
            assert!(!file_transition_allowed(from, Pending));
            if from != Pending {
                assert!(!file_transition_allowed(from, Queued));
            }
        }
    }

    #[test]
    fn test_final_statuses_have_no_exit() {
        for from in [Ingested, SkippedDedup, Quarantined] {
            for to in FileStatus::ALL {
                assert!(!file_transition_allowed(from, to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_ingest_is_idempotent_only_for_ingested() {
        assert_eq!(FileEvent::Ingest.check(Processing), Ok(Step::Apply));
        assert_eq!(FileEvent::Ingest.check(Ingested), Ok(Step::AlreadyApplied));
        assert_eq!(
            FileEvent::Ingest.check(Pending),
            Err(Rejected { from: "pending", to: "ingested" })
        );
        assert!(FileEvent::Quarantine.check(Quarantined).is_err());
        assert!(FileEvent::Fail.check(Failed).is_err());
    }

    #[test]
    fn test_event_side_effects() {
        assert!(FileEvent::Ingest.sets_ingested_at());
        assert!(FileEvent::SkipDedup.sets_ingested_at());
        assert!(!FileEvent::Quarantine.sets_ingested_at());
        assert!(FileEvent::Fail.increments_attempts());
        assert!(!FileEvent::Retry.increments_attempts());
        assert!(FileEvent::Quarantine.records_error());
    }

    #[test]
    fn test_claim_source_codes() {
        assert_eq!(FileChange::new(FileEvent::Claim).source_codes(), vec![0, 1]);
        assert_eq!(FileChange::new(FileEvent::Retry).source_codes(), vec![4]);
    }

    #[test]
    fn test_attempt_table() {
        assert_eq!(AttemptEvent::Start.check(AttemptStatus::Pending), Ok(Step::Apply));
        assert!(AttemptEvent::Start.check(AttemptStatus::Running).is_err());
        for event in [AttemptEvent::Complete, AttemptEvent::Fail, AttemptEvent::Cancel] {
            assert!(event.ends_attempt());
            assert_eq!(event.check(AttemptStatus::Pending), Ok(Step::Apply));
            assert_eq!(event.check(AttemptStatus::Running), Ok(Step::Apply));
            for terminal in [
                AttemptStatus::Completed,
                AttemptStatus::Failed,
                AttemptStatus::Cancelled,
            ] {
                assert!(event.check(terminal).is_err());
            }
        }
        assert!(!AttemptEvent::Start.ends_attempt());
    }
}
