//! Input validation for collaborator-facing operations
//!
//! All checks run before any state is touched and report the offending field.

use intake_common::Sha256Digest;

use crate::error::{IngestError, IngestResult};

/// Maximum accepted file path length in bytes
pub const MAX_PATH_BYTES: usize = 4096;

/// Maximum stored length of error messages and summaries in bytes
pub const MAX_MESSAGE_BYTES: usize = 8192;

pub fn parse_sha256(field: &'static str, input: &str) -> IngestResult<Sha256Digest> {
    input
        .trim()
        .parse()
        .map_err(|e: intake_common::CommonError| IngestError::validation(field, e.to_string()))
}

pub fn validate_path(path: &str) -> IngestResult<()> {
    if path.trim().is_empty() {
        return Err(IngestError::validation("path", "is required and cannot be empty"));
    }
    if path.len() > MAX_PATH_BYTES {
        return Err(IngestError::validation(
            "path",
            format!("must not exceed {MAX_PATH_BYTES} bytes"),
        ));
    }
    if path.contains('\0') {
        return Err(IngestError::validation("path", "must not contain NUL bytes"));
    }
    Ok(())
}

pub fn validate_size(size_bytes: Option<i64>) -> IngestResult<()> {
    match size_bytes {
        Some(size) if size < 0 => Err(IngestError::validation("size_bytes", "must not be negative")),
        _ => Ok(()),
    }
}

/// Non-empty message, truncated to [`MAX_MESSAGE_BYTES`] on a char boundary
pub fn normalize_message(field: &'static str, message: &str) -> IngestResult<String> {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return Err(IngestError::validation(field, "is required and cannot be empty"));
    }
    if trimmed.len() <= MAX_MESSAGE_BYTES {
        return Ok(trimmed.to_string());
    }
    let mut end = MAX_MESSAGE_BYTES;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    Ok(trimmed[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn field_of(err: IngestError) -> &'static str {
        match err {
            IngestError::Validation { field, .. } => field,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_sha256_ignores_case() {
        let lower = parse_sha256("sha256", &"ab".repeat(32)).unwrap();
        let upper = parse_sha256("sha256", &"AB".repeat(32)).unwrap();
        assert_eq!(lower, upper);
        assert_eq!(field_of(parse_sha256("sha256", "abc").unwrap_err()), "sha256");
    }

    #[test]
    fn test_path_rules() {
        assert!(validate_path("incoming/a.tif").is_ok());
        assert_eq!(field_of(validate_path("   ").unwrap_err()), "path");
        assert!(validate_path(&"x".repeat(MAX_PATH_BYTES)).is_ok());
        assert!(validate_path(&"x".repeat(MAX_PATH_BYTES + 1)).is_err());
        assert!(validate_path("a\0b").is_err());
    }

    #[test]
    fn test_size_rules() {
        assert!(validate_size(None).is_ok());
        assert!(validate_size(Some(0)).is_ok());
        assert_eq!(validate_size(Some(-1)).unwrap_err().kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_message_normalization() {
        assert_eq!(normalize_message("message", "  timeout ").unwrap(), "timeout");
        assert!(normalize_message("message", "").is_err());
        let long = "é".repeat(MAX_MESSAGE_BYTES);
        let normalized = normalize_message("message", &long).unwrap();
        assert!(normalized.len() <= MAX_MESSAGE_BYTES);
    }
}
