//! Intake Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]
//!
//! Shared types and utilities for the intake workspace.
//!
//! # Overview
//!
//! - **Digests**: [`Sha256Digest`], the content identity of every tracked file,
//!   exchanged as hexadecimal text and stored as raw bytes
//! - **Logging**: centralized `tracing` setup shared by every binary
//! - **Errors**: the small error type for the above
//!
//! # Example
//!
//! ```
//! use intake_common::Sha256Digest;
//!
//! let digest: Sha256Digest = "AA".repeat(32).parse().unwrap();
//! assert_eq!(digest.to_hex(), "aa".repeat(32));
//! ```

pub mod digest;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use digest::Sha256Digest;
pub use error::{CommonError, Result};
