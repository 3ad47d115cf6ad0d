//! Error types for the ingestion core
//!
//! Every public operation returns [`IngestResult`]. The variants map one to
//! one onto the error kinds a collaborator (CRUD layer, worker, CLI) has to
//! tell apart; storage failures keep their `sqlx` source for diagnostics but
//! never leak it through [`IngestError::public_message`].

use std::fmt::Display;

use thiserror::Error;

/// Result type alias for core operations
pub type IngestResult<T> = std::result::Result<T, IngestError>;

/// Coarse classification of an [`IngestError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    InvalidTransition,
    ConflictingState,
    Storage,
}

#[derive(Error, Debug)]
pub enum IngestError {
    /// Malformed input, rejected before any state mutation
    #[error("Validation failed for '{field}': {message}")]
    Validation { field: &'static str, message: String },

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    /// Requested status change is not reachable; the record is unchanged
    #[error("Invalid {entity} transition for '{id}': {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: &'static str,
        to: &'static str,
    },

    /// Structural operation against a record in an incompatible state
    #[error("Conflicting state: {0}")]
    ConflictingState(String),

    #[error("Storage failure")]
    Storage(#[from] sqlx::Error),
}

impl IngestError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invalid_transition(
        entity: &'static str,
        id: impl Display,
        from: &'static str,
        to: &'static str,
    ) -> Self {
        Self::InvalidTransition {
            entity,
            id: id.to_string(),
            from,
            to,
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::ConflictingState(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::Validation { .. } => ErrorKind::Validation,
            IngestError::NotFound { .. } => ErrorKind::NotFound,
            IngestError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            IngestError::ConflictingState(_) => ErrorKind::ConflictingState,
            IngestError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Message safe to hand to an untrusted caller.
    ///
    /// Storage detail is logged here and replaced by an opaque message.
    pub fn public_message(&self) -> String {
        match self {
            IngestError::Storage(e) => {
                tracing::error!(error = ?e, "Storage error");
                "A storage error occurred".to_string()
            },
            other => other.to_string(),
        }
    }
}
