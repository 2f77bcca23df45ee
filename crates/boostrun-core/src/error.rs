//! Core domain errors.

use thiserror::Error;

/// A job description that cannot be supervised as given.
///
/// Raised by [`crate::JobSpec::validate`] before any file is written or any
/// process is started, so it is always safe to fix the spec and retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A required field is missing or empty.
    #[error("{field} must not be empty")]
    MissingField { field: &'static str },

    /// A field is present but its value is unusable.
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn missing(field: &'static str) -> Self {
        Self::MissingField { field }
    }

    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}
