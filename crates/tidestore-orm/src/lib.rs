//! Tidestore ORM: Normalized Entities for a Versioned Store
//!
//! Stores application entities in per-type tables plus user-defined
//! indexes, inside a `Database` value that lives in a tidestore-core
//! `Store` state.
//!
//! # Architecture
//!
//! - **Table**: entities of one type keyed by `EntityId`, shared on clone
//! - **Indexes**: ordered, grouped and set indexes keyed by an `IndexKey`
//!   type, reconciled automatically when entities are deleted
//! - **Batch updates**: all-or-nothing, with middlewares that may stage
//!   more edits before the batch is applied
//! - **Markers**: per-database and per-table stamps that let projections
//!   skip commits that could not have touched their entity
//!
//! # Reads Are Total
//!
//! Reading a table or index that was never written returns an empty value
//! rather than an error.

pub mod batch;
pub mod comparisons;
pub mod database;
pub mod derived;
pub mod entity;
pub mod error;
pub mod grouped_index;
pub mod index;
pub mod marker;
pub mod ordered_index;
pub mod set_index;
pub mod table;

// Re-export key types for convenience
pub use batch::{BatchEdits, BatchUpdateContext, EntityModifier};
pub use comparisons::DatabaseComparisons;
pub use database::{Database, DatabaseMiddleware, UpdatesResult};
pub use derived::{
    DatabaseEmbedding, EntityPipeline, EntityWrapper, NonNullEntityPipeline, NonNullEntityWrapper,
    QueriedEntitiesPipeline, StoreOrmExt,
};
pub use entity::{Entity, EntityId, EntityTypeTag, IdSets, RemovedIds};
pub use error::{BatchError, BatchResult};
pub use grouped_index::GroupedIndex;
pub use index::{Index, IndexKey, Indexes};
pub use marker::UpdateMarker;
pub use ordered_index::OrderedIndex;
pub use set_index::SetIndex;
pub use table::Table;
