//! National id number normalization and validation.
//!
//! Barcode scanners and manual entry both introduce noise (spaces, dashes,
//! dots), so every id number is normalized before it is compared or stored.

use thiserror::Error;

/// Default length of a national id number.
pub const DEFAULT_ID_NUMBER_LENGTH: usize = 11;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdNumberError {
    #[error("Id number is empty")]
    Empty,

    #[error("Id number must contain only digits")]
    NonDigit,

    #[error("Id number must be {expected} digits, got {actual}")]
    WrongLength { expected: usize, actual: usize },

    #[error("Id number must not start with 0")]
    LeadingZero,
}

/// Strip whitespace and common separators.
pub fn normalize_id_number(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != '.')
        .collect()
}

/// Normalize and validate an id number, returning the normalized form.
pub fn validate_id_number(raw: &str, expected_len: usize) -> Result<String, IdNumberError> {
    let normalized = normalize_id_number(raw);
    if normalized.is_empty() {
        return Err(IdNumberError::Empty);
    }
    if !normalized.chars().all(|c| c.is_ascii_digit()) {
        return Err(IdNumberError::NonDigit);
    }
    if normalized.len() != expected_len {
        return Err(IdNumberError::WrongLength {
            expected: expected_len,
            actual: normalized.len(),
        });
    }
    if normalized.starts_with('0') {
        return Err(IdNumberError::LeadingZero);
    }
    Ok(normalized)
}
