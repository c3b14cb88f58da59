//! Error types for Tidestore operations
//!
//! Store-level failures are represented by the StoreError enum. Errors raised
//! by a mutation closure are never wrapped: they propagate to the caller of
//! `try_commit` unchanged and leave the state untouched.

use thiserror::Error;

/// Tidestore error types with detailed context
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store was torn down; it accepts no more commits or subscriptions
    #[error("store `{store}` has been invalidated")]
    Invalidated {
        /// Name of the invalidated store
        store: String,
    },

    /// A commit was issued from inside a mutation closure of the same store
    /// on the same thread. Running it would deadlock the exclusive section.
    #[error("store `{store}` received a commit from inside its own mutation")]
    ReentrantMutation {
        /// Name of the store
        store: String,
    },

    /// Configuration rejected by `StoreConfig::validate`
    #[error("invalid store configuration: {reason}")]
    InvalidConfig {
        /// Which constraint failed
        reason: String,
    },

    /// A background executor thread could not be started
    #[error("failed to spawn executor thread `{name}`: {message}")]
    Spawn {
        /// Requested thread name
        name: String,
        /// OS error text
        message: String,
    },
}

/// Result type alias for Tidestore operations
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::Invalidated { store: "session".into() };
        assert_eq!(format!("{}", err), "store `session` has been invalidated");

        let err = StoreError::ReentrantMutation { store: "session".into() };
        assert!(format!("{}", err).contains("inside its own mutation"));
    }

    #[test]
    fn test_invalid_config_display() {
        let err = StoreError::InvalidConfig { reason: "name must not be empty".into() };
        assert!(format!("{}", err).contains("name must not be empty"));
    }
}
