//! Error types for batch updates
//!
//! Lookups never fail: a missing entity is `None`. Errors are reserved for a
//! batch that has to unwind, and for store failures surfacing through
//! `StoreOrmExt`.

use thiserror::Error;

use tidestore_core::StoreError;

/// Batch update error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    /// Raised by `BatchUpdateContext::abort`; nothing staged is applied
    #[error("batch update aborted")]
    Aborted,

    /// `update_exists` on an id that is neither staged nor stored
    #[error("no stored `{entity_type}` entity with the requested id")]
    StoredEntityNotFound {
        /// Entity type name
        entity_type: &'static str,
    },

    /// An update closure changed the identifier of the entity it was given
    #[error("update changed the identifier of a `{entity_type}` entity")]
    IdentifierChanged {
        /// Entity type name
        entity_type: &'static str,
    },

    /// The underlying store refused the commit
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type alias for batch operations
pub type BatchResult<T> = Result<T, BatchError>;
