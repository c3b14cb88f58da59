//! Unordered id index

use std::fmt;

use hashbrown::HashSet;

use crate::entity::{Entity, EntityId, RemovedIds};
use crate::index::Index;

/// A set of ids.
pub struct SetIndex<E: Entity> {
    ids: HashSet<EntityId<E>>,
}

impl<E: Entity> SetIndex<E> {
    /// Create an empty index.
    pub fn new() -> Self {
        Self { ids: HashSet::new() }
    }

    /// Number of ids.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// True when `id` is a member.
    pub fn contains(&self, id: &EntityId<E>) -> bool {
        self.ids.contains(id)
    }

    /// Add `id`. Returns false when already present.
    pub fn insert(&mut self, id: EntityId<E>) -> bool {
        self.ids.insert(id)
    }

    /// Remove `id`. Returns false when absent.
    pub fn remove(&mut self, id: &EntityId<E>) -> bool {
        self.ids.remove(id)
    }

    /// Remove every id in `other`.
    pub fn subtract<'a>(&mut self, other: impl IntoIterator<Item = &'a EntityId<E>>) {
        for id in other {
            self.ids.remove(id);
        }
    }

    /// Remove every id.
    pub fn clear(&mut self) {
        self.ids.clear();
    }

    /// Iterate in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &EntityId<E>> {
        self.ids.iter()
    }

    /// Ids sorted by `compare`.
    pub fn sorted_by(&self, mut compare: impl FnMut(&EntityId<E>, &EntityId<E>) -> std::cmp::Ordering) -> Vec<EntityId<E>> {
        let mut ids: Vec<EntityId<E>> = self.ids.iter().cloned().collect();
        ids.sort_by(|a, b| compare(a, b));
        ids
    }
}

impl<E: Entity> Extend<EntityId<E>> for SetIndex<E> {
    fn extend<I: IntoIterator<Item = EntityId<E>>>(&mut self, iter: I) {
        self.ids.extend(iter);
    }
}

impl<E: Entity> Index for SetIndex<E> {
    fn apply_removing(&mut self, removed: &RemovedIds) -> bool {
        let Some(removed) = removed.of::<E>() else { return false };
        let before = self.ids.len();
        self.ids.retain(|id| !removed.contains(id));
        self.ids.len() != before
    }
}

impl<E: Entity> Clone for SetIndex<E> {
    fn clone(&self) -> Self {
        Self { ids: self.ids.clone() }
    }
}

impl<E: Entity> Default for SetIndex<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> PartialEq for SetIndex<E> {
    fn eq(&self, other: &Self) -> bool {
        self.ids == other.ids
    }
}

impl<E: Entity> fmt::Debug for SetIndex<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(&self.ids).finish()
    }
}
