//! Entity tables
//!
//! A `Table<E>` maps `EntityId<E>` to `E`. The map sits behind an `Arc`, so
//! cloning a table is cheap and the first write after a clone copies it.
//! Reading a table out of a `Database` never copies anything.

use std::fmt;
use std::sync::Arc;

use hashbrown::HashMap;

use crate::entity::{Entity, EntityId};
use crate::error::{BatchError, BatchResult};
use crate::marker::UpdateMarker;

/// Copy-on-write mapping from id to entity.
pub struct Table<E: Entity> {
    entities: Arc<HashMap<EntityId<E>, E>>,
    marker: UpdateMarker,
}

impl<E: Entity> Table<E> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            entities: Arc::new(HashMap::new()),
            marker: UpdateMarker::INITIAL,
        }
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// True when the table holds no entity.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Marker of the last batch that rewrote this table.
    pub fn marker(&self) -> UpdateMarker {
        self.marker
    }

    /// Entity stored under `id`.
    pub fn find(&self, id: &EntityId<E>) -> Option<&E> {
        self.entities.get(id)
    }

    /// True when `id` is stored.
    pub fn contains(&self, id: &EntityId<E>) -> bool {
        self.entities.contains_key(id)
    }

    /// Entities for `ids`, in the order of `ids`. Absent ids are skipped and
    /// repeated ids yield repeated entities.
    pub fn find_in<'a, I>(&self, ids: I) -> Vec<E>
    where
        I: IntoIterator<Item = &'a EntityId<E>>,
    {
        ids.into_iter().filter_map(|id| self.entities.get(id).cloned()).collect()
    }

    /// Every stored id, in no particular order.
    pub fn all_ids(&self) -> Vec<EntityId<E>> {
        self.entities.keys().cloned().collect()
    }

    /// Iterate over stored entities, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&EntityId<E>, &E)> {
        self.entities.iter()
    }

    /// Insert or replace `entity`.
    pub fn insert(&mut self, entity: E) -> EntityId<E> {
        let id = entity.id();
        Arc::make_mut(&mut self.entities).insert(id.clone(), entity);
        id
    }

    /// Insert or replace each entity. Returned ids follow input order.
    pub fn insert_many<I>(&mut self, entities: I) -> Vec<EntityId<E>>
    where
        I: IntoIterator<Item = E>,
    {
        let map = Arc::make_mut(&mut self.entities);
        entities
            .into_iter()
            .map(|entity| {
                let id = entity.id();
                map.insert(id.clone(), entity);
                id
            })
            .collect()
    }

    /// Remove the entity stored under `id`.
    pub fn remove(&mut self, id: &EntityId<E>) -> Option<E> {
        if !self.entities.contains_key(id) {
            return None;
        }
        Arc::make_mut(&mut self.entities).remove(id)
    }

    /// Remove every entity.
    pub fn remove_all(&mut self) {
        if !self.entities.is_empty() {
            self.entities = Arc::new(HashMap::new());
        }
    }

    /// Update the stored entity in place and return the new value.
    ///
    /// Fails with `StoredEntityNotFound` when absent, and with
    /// `IdentifierChanged` when `update` rewrites the id (the table is left
    /// untouched in both cases).
    pub fn update_exists(&mut self, id: &EntityId<E>, update: impl FnOnce(&mut E)) -> BatchResult<E> {
        let Some(current) = self.entities.get(id) else {
            return Err(BatchError::StoredEntityNotFound { entity_type: E::entity_name() });
        };
        let mut updated = current.clone();
        update(&mut updated);
        if updated.id() != *id {
            return Err(BatchError::IdentifierChanged { entity_type: E::entity_name() });
        }
        Arc::make_mut(&mut self.entities).insert(id.clone(), updated.clone());
        Ok(updated)
    }

    /// `update_exists`, returning `None` instead of an error.
    pub fn update_if_exists(&mut self, id: &EntityId<E>, update: impl FnOnce(&mut E)) -> Option<E> {
        self.update_exists(id, update).ok()
    }

    /// True when both tables share the same storage.
    pub fn ptr_eq(&self, other: &Table<E>) -> bool {
        Arc::ptr_eq(&self.entities, &other.entities)
    }

    /// Overwrite with `staged`, then drop `deletes`, and stamp a fresh marker.
    pub(crate) fn apply<'a, I>(&mut self, staged: &Table<E>, deletes: I)
    where
        I: IntoIterator<Item = &'a EntityId<E>>,
    {
        let map = Arc::make_mut(&mut self.entities);
        for (id, entity) in staged.entities.iter() {
            map.insert(id.clone(), entity.clone());
        }
        for id in deletes {
            map.remove(id);
        }
        self.marker.mark_updated();
    }
}

impl<E: Entity> Clone for Table<E> {
    fn clone(&self) -> Self {
        Self {
            entities: Arc::clone(&self.entities),
            marker: self.marker,
        }
    }
}

impl<E: Entity> Default for Table<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity + PartialEq> PartialEq for Table<E> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || *self.entities == *other.entities
    }
}

impl<E: Entity> fmt::Debug for Table<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("entity", &E::entity_name())
            .field("len", &self.len())
            .field("marker", &self.marker.get())
            .finish()
    }
}
