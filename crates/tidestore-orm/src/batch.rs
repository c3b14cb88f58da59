//! Batch updates
//!
//! A `BatchUpdateContext` stages edits against one database snapshot. Per
//! entity type it hands out an `EntityModifier` that records inserts,
//! updates and deletes without touching the snapshot; index edits go to a
//! private copy of the indexes. Nothing becomes visible until the context is
//! finished and its edits are committed, so an aborted batch leaves no trace.

use std::any::Any;
use std::borrow::Cow;
use std::fmt;

use hashbrown::HashSet;
use indexmap::IndexMap;

use crate::database::Database;
use crate::entity::{Entity, EntityId, EntityTypeTag, IdSets};
use crate::error::{BatchError, BatchResult};
use crate::index::{IndexKey, Indexes};
use crate::table::Table;

/// Staged edits of one entity type.
pub struct EntityModifier<E: Entity> {
    current: Table<E>,
    staged: Table<E>,
    deletes: HashSet<EntityId<E>>,
}

impl<E: Entity> EntityModifier<E> {
    fn new(current: Table<E>) -> Self {
        Self { current, staged: Table::new(), deletes: HashSet::new() }
    }

    /// The table as it was when the batch opened.
    pub fn current(&self) -> &Table<E> {
        &self.current
    }

    /// Staged inserts and updates.
    pub fn staged(&self) -> &Table<E> {
        &self.staged
    }

    /// Staged deletes.
    pub fn deletes(&self) -> &HashSet<EntityId<E>> {
        &self.deletes
    }

    /// True when anything is staged.
    pub fn has_edits(&self) -> bool {
        !self.staged.is_empty() || !self.deletes.is_empty()
    }

    /// Staged value of `id`, falling back to the stored one. `None` once a
    /// delete of `id` is staged.
    pub fn find(&self, id: &EntityId<E>) -> Option<&E> {
        if self.deletes.contains(id) {
            return None;
        }
        self.staged.find(id).or_else(|| self.current.find(id))
    }

    /// `find` for each id, in the order of `ids`, skipping absent ones.
    pub fn find_in<'a, I>(&self, ids: I) -> Vec<E>
    where
        I: IntoIterator<Item = &'a EntityId<E>>,
    {
        ids.into_iter().filter_map(|id| self.find(id).cloned()).collect()
    }

    /// Every entity as it will be once the batch applies.
    pub fn all(&self) -> Vec<E> {
        let mut out: Vec<E> = self.staged.iter().map(|(_, e)| e.clone()).collect();
        out.extend(
            self.current
                .iter()
                .filter(|(id, _)| !self.staged.contains(id))
                .map(|(_, e)| e.clone()),
        );
        out.retain(|e| !self.deletes.contains(&e.id()));
        out
    }

    /// Stage an insert or replacement.
    pub fn insert(&mut self, entity: E) -> EntityId<E> {
        self.staged.insert(entity)
    }

    /// Stage several inserts. Returned ids follow input order.
    pub fn insert_many<I>(&mut self, entities: I) -> Vec<EntityId<E>>
    where
        I: IntoIterator<Item = E>,
    {
        self.staged.insert_many(entities)
    }

    /// Stage a delete. Deletes win over inserts of the same id.
    pub fn delete(&mut self, id: EntityId<E>) {
        self.deletes.insert(id);
    }

    /// Stage several deletes.
    pub fn delete_many<I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = EntityId<E>>,
    {
        self.deletes.extend(ids);
    }

    /// Stage a delete of every stored and staged entity.
    pub fn delete_all(&mut self) {
        let stored = self.current.all_ids();
        let staged = self.staged.all_ids();
        self.deletes.extend(stored);
        self.deletes.extend(staged);
    }

    /// Update the entity under `id` and stage the result.
    ///
    /// Reads the staged value first, then the stored one. Fails with
    /// `StoredEntityNotFound` when neither exists or a delete is staged.
    pub fn update_exists(&mut self, id: &EntityId<E>, update: impl FnOnce(&mut E)) -> BatchResult<E> {
        if self.deletes.contains(id) {
            return Err(BatchError::StoredEntityNotFound { entity_type: E::entity_name() });
        }
        if self.staged.contains(id) {
            return self.staged.update_exists(id, update);
        }
        let Some(stored) = self.current.find(id) else {
            return Err(BatchError::StoredEntityNotFound { entity_type: E::entity_name() });
        };
        let mut updated = stored.clone();
        update(&mut updated);
        if updated.id() != *id {
            return Err(BatchError::IdentifierChanged { entity_type: E::entity_name() });
        }
        self.staged.insert(updated.clone());
        Ok(updated)
    }

    /// `update_exists`, returning `None` when there is nothing to update.
    pub fn update_if_exists(&mut self, id: &EntityId<E>, update: impl FnOnce(&mut E)) -> Option<E> {
        self.update_exists(id, update).ok()
    }
}

impl<E: Entity> fmt::Debug for EntityModifier<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityModifier")
            .field("entity", &E::entity_name())
            .field("staged", &self.staged.len())
            .field("deletes", &self.deletes.len())
            .finish()
    }
}

pub(crate) trait StagedEdits: Send {
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn has_edits(&self) -> bool;
    fn apply(self: Box<Self>, database: &mut Database, updated: &mut IdSets, deleted: &mut IdSets);
}

impl<E: Entity> StagedEdits for EntityModifier<E> {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn has_edits(&self) -> bool {
        EntityModifier::has_edits(self)
    }

    fn apply(self: Box<Self>, database: &mut Database, updated: &mut IdSets, deleted: &mut IdSets) {
        let this = *self;
        if !this.has_edits() {
            return;
        }
        let mut table = database.table::<E>().into_owned();
        table.apply(&this.staged, &this.deletes);
        database.set_table(table);

        updated.insert::<E>(this.staged.all_ids().into_iter().collect());
        deleted.insert::<E>(this.deletes);
    }
}

/// Finished batch, ready for `Database::commit_batch_update`.
pub struct BatchEdits {
    editing: Vec<Box<dyn StagedEdits>>,
    indexes: Indexes,
}

impl BatchEdits {
    pub(crate) fn into_parts(self) -> (Vec<Box<dyn StagedEdits>>, Indexes) {
        (self.editing, self.indexes)
    }
}

impl fmt::Debug for BatchEdits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchEdits")
            .field("tables", &self.editing.len())
            .field("indexes", &self.indexes)
            .finish()
    }
}

/// A batch in progress.
pub struct BatchUpdateContext<'db> {
    database: &'db Database,
    editing: IndexMap<EntityTypeTag, Box<dyn StagedEdits>>,
    indexes: Indexes,
    indexes_touched: bool,
}

impl<'db> BatchUpdateContext<'db> {
    pub(crate) fn new(database: &'db Database) -> Self {
        Self {
            database,
            editing: IndexMap::new(),
            indexes: database.indexes().clone(),
            indexes_touched: false,
        }
    }

    /// The snapshot this batch started from.
    pub fn database(&self) -> &'db Database {
        self.database
    }

    /// Modifier for entities of type `E`.
    pub fn table<E: Entity>(&mut self) -> &mut EntityModifier<E> {
        let database = self.database;
        let staged = self
            .editing
            .entry(EntityTypeTag::of::<E>())
            .or_insert_with(|| {
                Box::new(EntityModifier::new(database.table::<E>().into_owned())) as Box<dyn StagedEdits>
            });
        match staged.as_any_mut().downcast_mut::<EntityModifier<E>>() {
            Some(modifier) => modifier,
            None => unreachable!("modifiers are keyed by their entity type"),
        }
    }

    /// Staged view of the index under `K`.
    pub fn index<K: IndexKey>(&self) -> Cow<'_, K::Index> {
        self.indexes.get::<K>()
    }

    /// Edit the index under `K`.
    pub fn index_mut<K: IndexKey>(&mut self) -> &mut K::Index {
        self.indexes_touched = true;
        self.indexes.get_mut::<K>()
    }

    /// Staged view of every index.
    pub fn indexes(&self) -> &Indexes {
        &self.indexes
    }

    /// Cancel the whole batch. Return it from the batch closure, or use `?`.
    pub fn abort<T>(&self) -> BatchResult<T> {
        Err(BatchError::Aborted)
    }

    /// True when any entity or index edit is staged.
    pub fn has_edits(&self) -> bool {
        self.indexes_touched || self.editing.values().any(|staged| staged.has_edits())
    }

    /// Run the database middlewares and seal the batch. `None` when nothing
    /// was staged.
    pub fn finish(mut self) -> Option<BatchEdits> {
        if !self.has_edits() {
            return None;
        }
        let middlewares = self.database.middlewares();
        for middleware in middlewares.iter() {
            middleware.after_updates(&mut self);
        }
        Some(BatchEdits {
            editing: self.editing.into_values().collect(),
            indexes: self.indexes,
        })
    }
}

impl fmt::Debug for BatchUpdateContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchUpdateContext")
            .field("tables", &self.editing.keys().collect::<Vec<_>>())
            .field("indexes_touched", &self.indexes_touched)
            .finish()
    }
}
