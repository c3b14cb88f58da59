//! Drop policies for projections over a `Database`
//!
//! Each comparer answers "is there provably nothing new here?" for two
//! database snapshots, without reading any entity. They are listed cheapest
//! first; entity projections combine them with `Comparer::any_of`.

use tidestore_core::Comparer;

use crate::database::Database;
use crate::entity::{Entity, EntityId};

/// Comparers over two database snapshots.
pub struct DatabaseComparisons;

impl DatabaseComparisons {
    /// Equal when no batch was applied in between.
    pub fn database_no_updates() -> Comparer<Database> {
        Comparer::new(|lhs: &Database, rhs: &Database| {
            lhs.entity_marker() == rhs.entity_marker() && lhs.index_marker() == rhs.index_marker()
        })
    }

    /// Equal when the indexes were not rewritten.
    pub fn index_no_updates() -> Comparer<Database> {
        Comparer::new(|lhs: &Database, rhs: &Database| lhs.index_marker() == rhs.index_marker())
    }

    /// Equal when the table of `E` was not rewritten.
    pub fn table_no_updates<E: Entity>() -> Comparer<Database> {
        Comparer::new(|lhs: &Database, rhs: &Database| lhs.table_marker::<E>() == rhs.table_marker::<E>())
    }

    /// Equal when `rhs` is exactly one batch after `lhs` and that batch
    /// neither updated nor deleted `id`.
    pub fn changes_no_contains<E: Entity>(id: EntityId<E>) -> Comparer<Database> {
        Comparer::new(move |lhs: &Database, rhs: &Database| {
            let Some(updates) = rhs.last_updates() else { return false };
            updates.base_marker() == lhs.entity_marker() && !updates.was_updated(&id) && !updates.was_deleted(&id)
        })
    }

    /// The drop policy of a single-entity projection.
    pub fn entity_no_updates<E: Entity>(id: EntityId<E>) -> Comparer<Database> {
        Comparer::any_of(vec![
            Self::database_no_updates(),
            Self::table_no_updates::<E>(),
            Self::changes_no_contains(id),
        ])
    }
}
