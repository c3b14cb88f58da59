//! Ordered id index

use std::fmt;
use std::ops::Deref;

use crate::entity::{Entity, EntityId, RemovedIds};
use crate::index::Index;

/// Ids in caller-defined order. Duplicates are allowed.
pub struct OrderedIndex<E: Entity> {
    ids: Vec<EntityId<E>>,
}

impl<E: Entity> OrderedIndex<E> {
    /// Create an empty index.
    pub fn new() -> Self {
        Self { ids: Vec::new() }
    }

    /// The ids, in order.
    pub fn ids(&self) -> &[EntityId<E>] {
        &self.ids
    }

    /// Append an id.
    pub fn push(&mut self, id: EntityId<E>) {
        self.ids.push(id);
    }

    /// Insert `id` at `position`, shifting later ids.
    pub fn insert(&mut self, position: usize, id: EntityId<E>) {
        self.ids.insert(position, id);
    }

    /// Remove and return the id at `position`.
    pub fn remove_at(&mut self, position: usize) -> EntityId<E> {
        self.ids.remove(position)
    }

    /// Remove every occurrence of `id`.
    pub fn remove(&mut self, id: &EntityId<E>) {
        self.ids.retain(|existing| existing != id);
    }

    /// Keep only ids matching `keep`.
    pub fn retain(&mut self, keep: impl FnMut(&EntityId<E>) -> bool) {
        self.ids.retain(keep);
    }

    /// Remove every id.
    pub fn clear(&mut self) {
        self.ids.clear();
    }

    /// Reorder with `compare`.
    pub fn sort_by(&mut self, compare: impl FnMut(&EntityId<E>, &EntityId<E>) -> std::cmp::Ordering) {
        self.ids.sort_by(compare);
    }
}

impl<E: Entity> Extend<EntityId<E>> for OrderedIndex<E> {
    fn extend<I: IntoIterator<Item = EntityId<E>>>(&mut self, iter: I) {
        self.ids.extend(iter);
    }
}

impl<E: Entity> FromIterator<EntityId<E>> for OrderedIndex<E> {
    fn from_iter<I: IntoIterator<Item = EntityId<E>>>(iter: I) -> Self {
        Self { ids: iter.into_iter().collect() }
    }
}

impl<E: Entity> Deref for OrderedIndex<E> {
    type Target = [EntityId<E>];

    fn deref(&self) -> &[EntityId<E>] {
        &self.ids
    }
}

impl<'a, E: Entity> IntoIterator for &'a OrderedIndex<E> {
    type Item = &'a EntityId<E>;
    type IntoIter = std::slice::Iter<'a, EntityId<E>>;

    fn into_iter(self) -> Self::IntoIter {
        self.ids.iter()
    }
}

impl<E: Entity> Index for OrderedIndex<E> {
    fn apply_removing(&mut self, removed: &RemovedIds) -> bool {
        let Some(removed) = removed.of::<E>() else { return false };
        let before = self.ids.len();
        self.ids.retain(|id| !removed.contains(id));
        self.ids.len() != before
    }
}

impl<E: Entity> Clone for OrderedIndex<E> {
    fn clone(&self) -> Self {
        Self { ids: self.ids.clone() }
    }
}

impl<E: Entity> Default for OrderedIndex<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> PartialEq for OrderedIndex<E> {
    fn eq(&self, other: &Self) -> bool {
        self.ids == other.ids
    }
}

impl<E: Entity> Eq for OrderedIndex<E> {}

impl<E: Entity> fmt::Debug for OrderedIndex<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.ids).finish()
    }
}
