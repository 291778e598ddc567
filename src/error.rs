//! Error types for loregraph.
//!
//! All errors are strongly typed using thiserror. This enables pattern
//! matching on specific error conditions and keeps the batch drivers able
//! to distinguish "reject before write" cases from upstream failures.

use thiserror::Error;

use crate::extract::ExtractError;
use crate::storage::StorageError;

/// Validation errors that are rejected before any write happens.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A validity interval whose end does not lie strictly after its start.
    #[error("invalid chapter span: end ({end}) must be greater than start ({start})")]
    InvalidSpan {
        /// First chapter of the span.
        start: u32,
        /// Offending end chapter.
        end: u32,
    },

    /// A chapter range where the start lies beyond the end.
    #[error("invalid chapter range: start ({start}) must not exceed end ({end})")]
    InvalidRange {
        /// Range start.
        start: u32,
        /// Range end.
        end: u32,
    },

    /// Batch extraction target lies at or below the watermark.
    #[error("chapters up to {watermark} are already extracted; target {target} adds nothing")]
    RangeCovered {
        /// Requested target chapter.
        target: u32,
        /// Highest chapter with anchored facts.
        watermark: u32,
    },

    /// Settings deletion starting past the last extracted chapter.
    #[error("start chapter {start} lies beyond the extraction watermark {watermark}")]
    StartBeyondWatermark {
        /// Requested start chapter.
        start: u32,
        /// Highest chapter with anchored facts.
        watermark: u32,
    },

    /// Entity names are the reconciliation key and may not be blank.
    #[error("entity name cannot be empty")]
    EmptyEntityName,

    /// A relationship without a label cannot be versioned.
    #[error("relation label cannot be empty")]
    EmptyRelation,

    /// A credential pool must hold at least one credential.
    #[error("credential pool cannot be empty")]
    EmptyCredentialPool,
}

/// Top-level error type for loregraph.
#[derive(Debug, Error)]
pub enum LoreError {
    /// Input rejected before any write.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Storage backend failure or missing record.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The extraction collaborator failed or returned garbage.
    #[error("extraction error: {0}")]
    Extraction(#[from] ExtractError),

    /// A named entity could not be resolved in the requested world.
    #[error("entity not found: {name}")]
    EntityNotFound {
        /// The name that failed to resolve.
        name: String,
    },

    /// Invariant breakage inside the library itself.
    #[error("internal error: {message}")]
    Internal {
        /// Human-readable description.
        message: String,
    },
}

impl LoreError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this error was rejected before any write.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this error came from the extraction collaborator.
    #[must_use]
    pub const fn is_extraction(&self) -> bool {
        matches!(self, Self::Extraction(_))
    }
}

/// Result type alias for loregraph operations.
pub type LoreResult<T> = Result<T, LoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_span_display() {
        let err = ValidationError::InvalidSpan { start: 7, end: 7 };
        let msg = format!("{err}");
        assert!(msg.contains('7'));
        assert!(msg.contains("greater than start"));
    }

    #[test]
    fn test_range_covered_display() {
        let err = ValidationError::RangeCovered {
            target: 3,
            watermark: 5,
        };
        let msg = format!("{err}");
        assert!(msg.contains('3'));
        assert!(msg.contains('5'));
    }

    #[test]
    fn test_lore_error_from_validation() {
        let err: LoreError = ValidationError::EmptyEntityName.into();
        assert!(err.is_validation());
        assert!(!err.is_extraction());
    }

    #[test]
    fn test_lore_error_from_extraction() {
        let err: LoreError = ExtractError::RateLimited {
            message: "429".to_string(),
        }
        .into();
        assert!(err.is_extraction());
    }

    #[test]
    fn test_lore_error_internal() {
        let err = LoreError::internal("unexpected state");
        let msg = format!("{err}");
        assert!(msg.contains("unexpected state"));
    }
}
