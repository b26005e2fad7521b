//! Error types shared by every lifecycle operation.

use thiserror::Error;

/// Errors returned by lifecycle operations.
///
/// Telemetry failures never appear here; they are absorbed by the
/// [`Telemetry`](crate::telemetry::Telemetry) adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// A referenced entity does not exist in its registry
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Entity kind, e.g. `Badge`
        kind: &'static str,
        /// The missing ID
        id: String,
    },

    /// The entity's current status does not allow the requested transition
    #[error("{kind} {id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Entity kind
        kind: &'static str,
        /// Entity ID
        id: String,
        /// Current status
        from: &'static str,
        /// Requested status
        to: &'static str,
    },

    /// A balance-style check failed (points, shares, stock)
    #[error("insufficient {what}: required {required}, available {available}")]
    Insufficient {
        /// What ran short
        what: &'static str,
        /// Amount requested
        required: u64,
        /// Amount on hand
        available: u64,
    },

    /// Input was rejected
    #[error("validation failed: {0}")]
    Validation(String),

    /// A downstream collaborator refused the call (open breaker, exhausted retries)
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl LifecycleError {
    /// Shorthand for [`LifecycleError::NotFound`]
    #[must_use]
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Shorthand for [`LifecycleError::Validation`]
    #[must_use]
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }

    /// Whether this is a not-found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Convenience alias used across the feature crates
pub type Result<T> = std::result::Result<T, LifecycleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message_names_the_id() {
        let err = LifecycleError::not_found("Badge", "b42");
        assert_eq!(err.to_string(), "Badge not found: b42");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_insufficient_message() {
        let err = LifecycleError::Insufficient {
            what: "points",
            required: 500,
            available: 120,
        };
        assert_eq!(
            err.to_string(),
            "insufficient points: required 500, available 120"
        );
        assert!(!err.is_not_found());
    }
}
