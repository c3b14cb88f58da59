//! Index contract and type-keyed index storage
//!
//! An index holds ids, never entities. After every batch each index is
//! handed the ids the batch deleted and drops them, so no index outlives
//! the entities it points at.
//!
//! Indexes are named by a key type:
//!
//! ```
//! use tidestore_orm::{Entity, IndexKey, OrderedIndex};
//!
//! #[derive(Clone)]
//! struct Track { id: u64 }
//!
//! impl Entity for Track {
//!     type RawId = u64;
//!     fn raw_id(&self) -> u64 { self.id }
//! }
//!
//! enum Playlist {}
//!
//! impl IndexKey for Playlist {
//!     type Index = OrderedIndex<Track>;
//! }
//! ```

use std::any::{type_name, Any, TypeId};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use hashbrown::HashMap;

use crate::entity::RemovedIds;

/// A secondary structure over entity ids.
pub trait Index: Clone + Default + Send + Sync + 'static {
    /// Drop every id in `removed`. Returns true when anything changed.
    fn apply_removing(&mut self, removed: &RemovedIds) -> bool;
}

/// Names one index of a database.
pub trait IndexKey: 'static {
    /// Index stored under this key
    type Index: Index;

    /// Name used in diagnostics.
    fn name() -> &'static str {
        type_name::<Self>()
    }
}

trait AnyIndex: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn boxed_clone(&self) -> Arc<dyn AnyIndex>;
    fn reconciled(&self, removed: &RemovedIds) -> Option<Arc<dyn AnyIndex>>;
}

impl<I: Index> AnyIndex for I {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn boxed_clone(&self) -> Arc<dyn AnyIndex> {
        Arc::new(self.clone())
    }

    fn reconciled(&self, removed: &RemovedIds) -> Option<Arc<dyn AnyIndex>> {
        let mut next = self.clone();
        next.apply_removing(removed).then(|| Arc::new(next) as Arc<dyn AnyIndex>)
    }
}

struct IndexSlot {
    name: &'static str,
    index: Arc<dyn AnyIndex>,
}

impl Clone for IndexSlot {
    fn clone(&self) -> Self {
        Self { name: self.name, index: Arc::clone(&self.index) }
    }
}

/// Every index of a database, keyed by `IndexKey` type.
///
/// Cloning shares each index; the first mutable access to an index copies
/// that index alone.
#[derive(Clone, Default)]
pub struct Indexes {
    slots: HashMap<TypeId, IndexSlot>,
}

impl Indexes {
    /// Empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// The index under `K`, or an empty one.
    pub fn get<K: IndexKey>(&self) -> Cow<'_, K::Index> {
        match self.lookup::<K>() {
            Some(index) => Cow::Borrowed(index),
            None => Cow::Owned(K::Index::default()),
        }
    }

    /// The index under `K`, if it was ever written.
    pub fn lookup<K: IndexKey>(&self) -> Option<&K::Index> {
        self.slots
            .get(&TypeId::of::<K>())
            .and_then(|slot| slot.index.as_any().downcast_ref::<K::Index>())
    }

    /// Mutable access to the index under `K`, created empty when missing.
    pub fn get_mut<K: IndexKey>(&mut self) -> &mut K::Index {
        let slot = self.slots.entry(TypeId::of::<K>()).or_insert_with(|| IndexSlot {
            name: K::name(),
            index: Arc::new(K::Index::default()),
        });
        if Arc::get_mut(&mut slot.index).is_none() {
            slot.index = slot.index.boxed_clone();
        }
        match Arc::get_mut(&mut slot.index).and_then(|index| index.as_any_mut().downcast_mut::<K::Index>()) {
            Some(index) => index,
            None => unreachable!("index slots are keyed by their IndexKey type"),
        }
    }

    /// Replace the index under `K`.
    pub fn set<K: IndexKey>(&mut self, index: K::Index) {
        self.slots.insert(TypeId::of::<K>(), IndexSlot { name: K::name(), index: Arc::new(index) });
    }

    /// Number of stored indexes.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when no index was ever written.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drop `removed` from every index. Returns how many indexes changed.
    pub(crate) fn apply_removing(&mut self, removed: &RemovedIds) -> usize {
        if removed.is_empty() {
            return 0;
        }
        let mut changed = 0;
        for slot in self.slots.values_mut() {
            if let Some(next) = slot.index.reconciled(removed) {
                tracing::trace!(index = slot.name, "index reconciled");
                slot.index = next;
                changed += 1;
            }
        }
        changed
    }
}

impl fmt::Debug for Indexes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.slots.values().map(|slot| slot.name)).finish()
    }
}
