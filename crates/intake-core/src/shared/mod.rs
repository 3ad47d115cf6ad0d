//! Shared helpers for list queries and input validation

pub mod pagination;
pub mod validation;

pub use pagination::{Page, PaginationParams};
