//! Utility functions for string formatting and id number handling.

pub mod format;
pub mod id_number;

// Re-export commonly used functions at module level
pub use format::{cmp_ignore_case, contains_ignore_case, format_percent, truncate_string};
pub use id_number::{normalize_id_number, validate_id_number, IdNumberError};
