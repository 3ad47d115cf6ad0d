//! Import sessions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Logical processing session owning files and attempts (maps to imports table)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Import {
    pub id: Uuid,
    /// Batch whose counters this import's files feed, if any
    pub batch_id: Option<Uuid>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Import {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled_at.is_some()
    }
}
