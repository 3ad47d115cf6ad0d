//! Entity records
//!
//! Records are plain data: they carry derived read-only helpers (status
//! names, queue membership, durations) but every mutation goes through the
//! services and the transition tables in [`crate::state_machine`].

pub mod attempt;
pub mod batch;
pub mod file;
pub mod import;

pub use attempt::{AttemptStatus, ImportAttempt};
pub use batch::{Batch, BatchStatus, NewBatch};
pub use file::{FileStatus, FileStatusCounts, ImportFile, NewFileRecord};
pub use import::Import;
