//! Normalized entity database
//!
//! A `Database` is an immutable value: tables keyed by entity type and
//! indexes keyed by `IndexKey` type. The only way to change it is a batch
//! update, which either applies every staged edit or none of them.
//!
//! # Markers
//!
//! Every applied batch stamps fresh markers on the database and on each
//! table it rewrote. Projections compare markers to decide, without looking
//! at any entity, whether a commit could have touched what they read.

use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use hashbrown::HashMap;

use crate::batch::{BatchEdits, BatchUpdateContext};
use crate::entity::{Entity, EntityId, EntityTypeTag, IdSets};
use crate::error::BatchResult;
use crate::index::{IndexKey, Indexes};
use crate::marker::UpdateMarker;
use crate::table::Table;

/// Hook run on every batch that staged something, before it is applied.
/// It may stage further edits.
pub trait DatabaseMiddleware: Send + Sync + 'static {
    /// Inspect or extend the staged edits.
    fn after_updates(&self, context: &mut BatchUpdateContext<'_>);
}

impl<F> DatabaseMiddleware for F
where
    F: for<'a> Fn(&mut BatchUpdateContext<'a>) + Send + Sync + 'static,
{
    fn after_updates(&self, context: &mut BatchUpdateContext<'_>) {
        self(context)
    }
}

/// What the last applied batch touched.
#[derive(Clone, Debug)]
pub struct UpdatesResult {
    base: UpdateMarker,
    updated: IdSets,
    deleted: IdSets,
}

impl UpdatesResult {
    /// Entity marker of the database the batch was applied to.
    pub fn base_marker(&self) -> UpdateMarker {
        self.base
    }

    /// Inserted or updated ids.
    pub fn updated(&self) -> &IdSets {
        &self.updated
    }

    /// Deleted ids.
    pub fn deleted(&self) -> &IdSets {
        &self.deleted
    }

    /// True when `id` was inserted or updated.
    pub fn was_updated<E: Entity>(&self, id: &EntityId<E>) -> bool {
        self.updated.contains(id)
    }

    /// True when `id` was deleted.
    pub fn was_deleted<E: Entity>(&self, id: &EntityId<E>) -> bool {
        self.deleted.contains(id)
    }

    /// True when any `E` was inserted or updated.
    pub fn contains_updates_of<E: Entity>(&self) -> bool {
        self.updated.contains_type::<E>()
    }

    /// True when any `E` was deleted.
    pub fn contains_deletes_of<E: Entity>(&self) -> bool {
        self.deleted.contains_type::<E>()
    }
}

/// Tables and indexes of normalized entities.
#[derive(Clone, Default)]
pub struct Database {
    tables: HashMap<EntityTypeTag, Arc<dyn Any + Send + Sync>>,
    indexes: Indexes,
    entity_marker: UpdateMarker,
    index_marker: UpdateMarker,
    last_updates: Option<Arc<UpdatesResult>>,
    middlewares: Arc<Vec<Arc<dyn DatabaseMiddleware>>>,
}

impl Database {
    /// Create an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style `add_middleware`.
    pub fn with_middleware(mut self, middleware: impl DatabaseMiddleware) -> Self {
        self.add_middleware(middleware);
        self
    }

    /// Register a middleware. Middlewares run in registration order.
    pub fn add_middleware(&mut self, middleware: impl DatabaseMiddleware) {
        Arc::make_mut(&mut self.middlewares).push(Arc::new(middleware));
    }

    pub(crate) fn middlewares(&self) -> Arc<Vec<Arc<dyn DatabaseMiddleware>>> {
        Arc::clone(&self.middlewares)
    }

    /// The table of `E`. Empty when nothing of type `E` was ever stored.
    pub fn table<E: Entity>(&self) -> Cow<'_, Table<E>> {
        match self
            .tables
            .get(&EntityTypeTag::of::<E>())
            .and_then(|table| table.downcast_ref::<Table<E>>())
        {
            Some(table) => Cow::Borrowed(table),
            None => Cow::Owned(Table::new()),
        }
    }

    /// The index under `K`. Empty when never written.
    pub fn index<K: IndexKey>(&self) -> Cow<'_, K::Index> {
        self.indexes.get::<K>()
    }

    /// Every index.
    pub fn indexes(&self) -> &Indexes {
        &self.indexes
    }

    /// Number of tables ever written.
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Marker bumped by every applied batch.
    pub fn entity_marker(&self) -> UpdateMarker {
        self.entity_marker
    }

    /// Marker bumped whenever indexes may have changed.
    pub fn index_marker(&self) -> UpdateMarker {
        self.index_marker
    }

    /// Marker of the table of `E`.
    pub fn table_marker<E: Entity>(&self) -> UpdateMarker {
        self.table::<E>().marker()
    }

    /// Summary of the last applied batch.
    pub fn last_updates(&self) -> Option<&UpdatesResult> {
        self.last_updates.as_deref()
    }

    /// Open a batch against this snapshot.
    pub fn begin_batch_update(&self) -> BatchUpdateContext<'_> {
        BatchUpdateContext::new(self)
    }

    /// Apply edits produced by `BatchUpdateContext::finish`.
    pub fn commit_batch_update(&mut self, edits: BatchEdits) {
        let base = self.entity_marker;
        let (editing, indexes) = edits.into_parts();

        let mut updated = IdSets::new();
        let mut deleted = IdSets::new();
        let tables = editing.len();
        for staged in editing {
            staged.apply(self, &mut updated, &mut deleted);
        }

        self.indexes = indexes;
        let reconciled = self.indexes.apply_removing(&deleted);

        self.entity_marker.mark_updated();
        self.index_marker.mark_updated();
        self.last_updates = Some(Arc::new(UpdatesResult { base, updated, deleted }));

        tracing::debug!(
            tables,
            reconciled_indexes = reconciled,
            marker = self.entity_marker.get(),
            "batch applied"
        );
    }

    /// Run `update` against a fresh batch and apply what it staged.
    ///
    /// When `update` fails (including `abort`) nothing is applied. When it
    /// stages nothing, the database is left as it was, markers included.
    pub fn perform_batch_update<R>(
        &mut self,
        update: impl FnOnce(&mut BatchUpdateContext<'_>) -> BatchResult<R>,
    ) -> BatchResult<R> {
        let (result, edits) = {
            let mut context = BatchUpdateContext::new(self);
            let result = update(&mut context)?;
            (result, context.finish())
        };
        if let Some(edits) = edits {
            self.commit_batch_update(edits);
        }
        Ok(result)
    }

    pub(crate) fn set_table<E: Entity>(&mut self, table: Table<E>) {
        self.tables.insert(EntityTypeTag::of::<E>(), Arc::new(table));
    }
}

/// Write identity, not content equality: two databases are equal when they
/// carry the same entity and index markers, i.e. when one is a copy of the
/// other with no batch applied since. Identical contents written by separate
/// batches compare unequal. Never-written databases are all equal.
impl PartialEq for Database {
    fn eq(&self, other: &Self) -> bool {
        self.entity_marker == other.entity_marker && self.index_marker == other.index_marker
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("tables", &self.tables.keys().collect::<Vec<_>>())
            .field("indexes", &self.indexes)
            .field("entity_marker", &self.entity_marker.get())
            .field("index_marker", &self.index_marker.get())
            .finish()
    }
}
