//! Error types shared across intake crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommonError {
    #[error("Invalid digest: expected {expected} hex characters, got {actual}")]
    DigestLength { expected: usize, actual: usize },

    #[error("Invalid digest: expected {expected} bytes, got {actual}")]
    DigestBytes { expected: usize, actual: usize },

    #[error("Invalid digest: '{0}' is not a hexadecimal character")]
    DigestCharacter(char),
}
