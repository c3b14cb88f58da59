//! Parent-to-children index

use std::fmt;

use hashbrown::HashMap;

use crate::entity::{Entity, EntityId, RemovedIds};
use crate::index::Index;
use crate::ordered_index::OrderedIndex;

/// Ordered child ids grouped under a parent id.
///
/// Deleting a parent drops its group. Deleting a child drops it from every
/// group, and a group left empty is dropped too.
pub struct GroupedIndex<P: Entity, C: Entity> {
    groups: HashMap<EntityId<P>, OrderedIndex<C>>,
}

impl<P: Entity, C: Entity> GroupedIndex<P, C> {
    /// Create an empty index.
    pub fn new() -> Self {
        Self { groups: HashMap::new() }
    }

    /// Number of groups.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Parent ids that have a group, in no particular order.
    pub fn groups(&self) -> impl Iterator<Item = &EntityId<P>> {
        self.groups.keys()
    }

    /// Children of `parent`, in order. Empty when there is no group.
    pub fn children(&self, parent: &EntityId<P>) -> &[EntityId<C>] {
        self.groups.get(parent).map(|group| group.ids()).unwrap_or(&[])
    }

    /// Edit the group of `parent`, creating it when missing.
    pub fn update<R>(&mut self, parent: EntityId<P>, update: impl FnOnce(&mut OrderedIndex<C>) -> R) -> R {
        update(self.groups.entry(parent).or_default())
    }

    /// Append `child` to the group of `parent`.
    pub fn push(&mut self, parent: EntityId<P>, child: EntityId<C>) {
        self.groups.entry(parent).or_default().push(child);
    }

    /// Drop the group of `parent`.
    pub fn remove_group(&mut self, parent: &EntityId<P>) -> Option<OrderedIndex<C>> {
        self.groups.remove(parent)
    }
}

impl<P: Entity, C: Entity> Index for GroupedIndex<P, C> {
    fn apply_removing(&mut self, removed: &RemovedIds) -> bool {
        let mut changed = false;
        if let Some(parents) = removed.of::<P>() {
            let before = self.groups.len();
            self.groups.retain(|parent, _| !parents.contains(parent));
            changed |= self.groups.len() != before;
        }
        if removed.contains_type::<C>() {
            for group in self.groups.values_mut() {
                changed |= group.apply_removing(removed);
            }
            self.groups.retain(|_, group| !group.is_empty());
        }
        changed
    }
}

impl<P: Entity, C: Entity> Clone for GroupedIndex<P, C> {
    fn clone(&self) -> Self {
        Self { groups: self.groups.clone() }
    }
}

impl<P: Entity, C: Entity> Default for GroupedIndex<P, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Entity, C: Entity> PartialEq for GroupedIndex<P, C> {
    fn eq(&self, other: &Self) -> bool {
        self.groups == other.groups
    }
}

impl<P: Entity, C: Entity> fmt::Debug for GroupedIndex<P, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.groups.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::IdSets;

    #[derive(Clone, Debug)]
    struct Album {
        id: u32,
    }

    impl Entity for Album {
        type RawId = u32;
        fn raw_id(&self) -> u32 {
            self.id
        }
    }

    #[derive(Clone, Debug)]
    struct Photo {
        id: u32,
    }

    impl Entity for Photo {
        type RawId = u32;
        fn raw_id(&self) -> u32 {
            self.id
        }
    }

    fn album(raw: u32) -> EntityId<Album> {
        EntityId::new(raw)
    }

    fn photo(raw: u32) -> EntityId<Photo> {
        EntityId::new(raw)
    }

    fn sample() -> GroupedIndex<Album, Photo> {
        let mut index = GroupedIndex::new();
        index.push(album(1), photo(10));
        index.push(album(1), photo(11));
        index.update(album(2), |group| group.push(photo(20)));
        index
    }

    #[test]
    fn test_children() {
        let index = sample();
        assert_eq!(index.group_count(), 2);
        assert_eq!(index.children(&album(1)), &[photo(10), photo(11)]);
        assert!(index.children(&album(9)).is_empty());
    }

    #[test]
    fn test_removing_parent_drops_group() {
        let mut index = sample();
        let mut removed = IdSets::new();
        removed.insert::<Album>([album(1)].into_iter().collect());
        assert!(index.apply_removing(&removed));
        assert_eq!(index.group_count(), 1);
        assert!(index.children(&album(1)).is_empty());
    }

    #[test]
    fn test_removing_child_cleans_empty_groups() {
        let mut index = sample();
        let mut removed = IdSets::new();
        removed.insert::<Photo>([photo(20), photo(10)].into_iter().collect());
        assert!(index.apply_removing(&removed));
        assert_eq!(index.children(&album(1)), &[photo(11)]);
        assert_eq!(index.group_count(), 1);
    }
}
