//! Intake core library
//!
//! Tracks the ingestion of archive files through batched, multi-attempt
//! imports.
//!
//! # Overview
//!
//! - **Entities**: batches, imports, import files and import attempts
//!   ([`models`])
//! - **Transition tables**: stateless source/target rules for files and
//!   attempts ([`state_machine`])
//! - **Store**: conditional-update persistence behind [`store::IngestStore`],
//!   with a PostgreSQL and an in-memory implementation
//! - **Services**: the file state machine, the work queue, the attempt
//!   supervisor and the batch aggregator
//!
//! # Architecture
//!
//! Services never lock anything themselves. Every status change is sent to
//! the store as an update conditioned on the statuses the change may start
//! from, so independent workers (threads, processes or hosts) coordinate
//! through the store alone:
//!
//! - `claim_next` hands each claimable file to at most one worker
//! - batch counters move in the same step as the file transition that
//!   changes them, and `reconcile` recomputes them from a full scan
//! - cancellation stops new claims; in-flight files finish normally
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use intake_core::{config::IngestPolicy, store::MemoryStore, Intake};
//!
//! # async fn run() -> intake_core::IngestResult<()> {
//! let intake = Intake::new(Arc::new(MemoryStore::new()), IngestPolicy::default());
//! let import = intake.imports.create(None).await?;
//! for file in intake.queue.claim_next(import.id, 10).await? {
//!     intake.files.mark_ingested(file.id).await?;
//! }
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

use std::sync::Arc;

pub mod attempts;
pub mod batches;
pub mod config;
pub mod db;
pub mod error;
pub mod files;
pub mod imports;
pub mod models;
pub mod queue;
pub mod shared;
pub mod state_machine;
pub mod store;

// Re-export commonly used types
pub use attempts::{AttemptFilter, AttemptSupervisor};
pub use batches::{rollup_status, BatchAggregator, CreateBatchCommand};
pub use error::{ErrorKind, IngestError, IngestResult};
pub use files::{CreateFileCommand, FileFilter, FileStateMachine};
pub use imports::ImportRegistry;
pub use queue::{StallReport, WorkQueue};

/// All services wired to one store and one policy
pub struct Intake {
    pub batches: BatchAggregator,
    pub imports: ImportRegistry,
    pub files: FileStateMachine,
    pub queue: WorkQueue,
    pub attempts: AttemptSupervisor,
}

impl Intake {
    pub fn new(store: Arc<dyn store::IngestStore>, policy: config::IngestPolicy) -> Self {
        Self {
            batches: BatchAggregator::new(store.clone(), policy.clone()),
            imports: ImportRegistry::new(store.clone()),
            files: FileStateMachine::new(store.clone(), policy.clone()),
            queue: WorkQueue::new(store.clone(), policy),
            attempts: AttemptSupervisor::new(store),
        }
    }
}
