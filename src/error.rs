//! Error types for node image distribution.
//!
//! Every failure a reconciliation pass can hit maps onto one of a small set
//! of [`ErrorKind`]s. The kind decides how the caller reacts:
//!
//! | Kind            | Visible as      | Retried by                          |
//! |-----------------|-----------------|-------------------------------------|
//! | `Configuration` | `Error` state   | standard requeue only               |
//! | `Transient`     | `Error` state   | framework backoff (hard error)      |
//! | `Conflict`      | not surfaced    | re-read and recompute               |
//! | `Cancelled`     | unchanged state | next invocation                     |
//! | `NotFound`      | -               | nothing to do                       |
//! | `Internal`      | hard error      | framework backoff                   |

use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for image distribution operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Needs operator intervention (bad config, unknown provider, malformed URL).
    Configuration,
    /// Network or backend failure; the next pass starts over.
    Transient,
    /// Optimistic-concurrency write rejected.
    Conflict,
    /// Caller cancelled the operation.
    Cancelled,
    /// The record does not exist.
    NotFound,
    /// Bug or corrupted state.
    Internal,
}

/// Errors that can occur while distributing node images.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Image Record Errors
    // =========================================================================
    /// Node image record not found.
    #[error("node image not found: {0}")]
    ImageNotFound(String),

    /// Image name failed validation.
    #[error("invalid image name '{name}': {reason}")]
    InvalidImageName { name: String, reason: String },

    /// Consumer identifier failed validation.
    #[error("invalid consumer id '{id}': {reason}")]
    InvalidConsumerId { id: String, reason: String },

    /// An existing record is owned by a different provider.
    #[error("node image '{image}' belongs to provider '{existing}', not '{requested}'")]
    ProviderMismatch {
        image: String,
        existing: String,
        requested: String,
    },

    // =========================================================================
    // Provider Errors
    // =========================================================================
    /// No provider registered under the tag.
    #[error("provider '{0}' is not configured")]
    ProviderNotConfigured(String),

    /// A provider call failed.
    #[error("provider '{provider}' failed to {operation} '{image}' at '{location}': {reason}")]
    ProviderFailed {
        provider: String,
        operation: String,
        image: String,
        location: String,
        reason: String,
    },

    /// The deletion sweep left images behind at some locations.
    #[error("failed to delete '{image}' at {} location(s): {}", failed.len(), failed.join(", "))]
    DeletionIncomplete { image: String, failed: Vec<String> },

    // =========================================================================
    // Source Artifact Errors
    // =========================================================================
    /// Source URL is not well-formed for the object-store backend.
    #[error("invalid source URL '{url}': {reason}")]
    InvalidSourceUrl { url: String, reason: String },

    /// HEAD request against the source artifact could not be completed.
    #[error("failed to probe source '{url}': {reason}")]
    SourceProbeFailed { url: String, reason: String },

    // =========================================================================
    // Release Errors
    // =========================================================================
    /// Release descriptor cannot be turned into an image request.
    #[error("invalid release '{release}': {reason}")]
    InvalidRelease { release: String, reason: String },

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    /// Record already exists.
    #[error("node image already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic-concurrency write rejected.
    #[error("conflicting write to '{name}': expected version {expected}, found {actual}")]
    Conflict {
        name: String,
        expected: u64,
        actual: u64,
    },

    /// Conflicts kept recurring.
    #[error("gave up updating '{name}' after {attempts} conflicting writes")]
    ConflictRetriesExhausted { name: String, attempts: u32 },

    /// Store backend failure.
    #[error("store failure at {path}: {reason}")]
    StoreFailed { path: PathBuf, reason: String },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Duration string could not be parsed.
    #[error("invalid duration '{value}': {reason}")]
    InvalidDuration { value: String, reason: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Timeout / Cancellation
    // =========================================================================
    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// Operation was cancelled by the caller.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the taxonomy bucket for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidImageName { .. }
            | Self::InvalidConsumerId { .. }
            | Self::ProviderMismatch { .. }
            | Self::ProviderNotConfigured(_)
            | Self::InvalidSourceUrl { .. }
            | Self::InvalidRelease { .. }
            | Self::InvalidConfig(_)
            | Self::InvalidDuration { .. } => ErrorKind::Configuration,

            Self::ProviderFailed { .. }
            | Self::DeletionIncomplete { .. }
            | Self::SourceProbeFailed { .. }
            | Self::ConflictRetriesExhausted { .. }
            | Self::StoreFailed { .. }
            | Self::Io(_)
            | Self::Timeout { .. } => ErrorKind::Transient,

            Self::AlreadyExists(_) | Self::Conflict { .. } => ErrorKind::Conflict,

            Self::Cancelled(_) => ErrorKind::Cancelled,

            Self::ImageNotFound(_) => ErrorKind::NotFound,

            Self::Serialization(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if re-running the operation may succeed without
    /// operator intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transient | ErrorKind::Conflict | ErrorKind::Cancelled
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::InvalidConfig(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_errors_not_retryable() {
        let err = Error::ProviderNotConfigured("capv".to_string());
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_provider_failure_is_transient() {
        let err = Error::ProviderFailed {
            provider: "capv".to_string(),
            operation: "create".to_string(),
            image: "flatcar".to_string(),
            location: "dc1".to_string(),
            reason: "connection reset".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_deletion_incomplete_lists_locations() {
        let err = Error::DeletionIncomplete {
            image: "flatcar".to_string(),
            failed: vec!["dc1".to_string(), "dc2".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 location(s)"));
        assert!(msg.contains("dc1, dc2"));
    }
}
