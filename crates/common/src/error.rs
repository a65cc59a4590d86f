//! Common error types for SFU components.

use thiserror::Error;

/// Errors produced while validating externally supplied identifiers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    /// Identifier was empty.
    #[error("identifier is empty")]
    Empty,

    /// Identifier exceeded the maximum length.
    #[error("identifier is longer than {max} characters")]
    TooLong {
        /// Maximum accepted length.
        max: usize,
    },

    /// Identifier contained a character outside `[A-Za-z0-9_-]`.
    #[error("identifier contains invalid character {0:?}")]
    InvalidCharacter(char),
}
