//! Entities and their identifiers
//!
//! An entity is a plain value with a stable id. `EntityId<E>` carries the
//! entity type in its type, so ids of different entity types never compare
//! equal even when their raw values do.

use std::any::{type_name, Any, TypeId};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use hashbrown::{HashMap, HashSet};

/// A record stored in a `Table`.
///
/// ```
/// use tidestore_orm::{Entity, EntityId};
///
/// #[derive(Clone, Debug, PartialEq)]
/// struct Book { isbn: String, title: String }
///
/// impl Entity for Book {
///     type RawId = String;
///     fn raw_id(&self) -> String { self.isbn.clone() }
/// }
///
/// let book = Book { isbn: "978-0".into(), title: "Tides".into() };
/// assert_eq!(book.id(), EntityId::<Book>::new("978-0".to_string()));
/// ```
pub trait Entity: Clone + Send + Sync + 'static {
    /// Raw identifier value
    type RawId: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// The raw id. Must not change for the lifetime of the entity.
    fn raw_id(&self) -> Self::RawId;

    /// Typed id.
    fn id(&self) -> EntityId<Self> {
        EntityId::new(self.raw_id())
    }

    /// Name used in diagnostics and errors.
    fn entity_name() -> &'static str {
        short_type_name::<Self>()
    }
}

fn short_type_name<T: ?Sized>() -> &'static str {
    let full = type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    match base.rfind("::") {
        Some(at) => &full[at + 2..],
        None => full,
    }
}

/// Typed identifier of an entity.
pub struct EntityId<E: Entity> {
    raw: E::RawId,
}

impl<E: Entity> EntityId<E> {
    /// Wrap a raw id.
    pub fn new(raw: E::RawId) -> Self {
        Self { raw }
    }

    /// The raw value.
    pub fn raw(&self) -> &E::RawId {
        &self.raw
    }

    /// Unwrap into the raw value.
    pub fn into_raw(self) -> E::RawId {
        self.raw
    }

    /// Tag of the entity type this id belongs to.
    pub fn type_tag(&self) -> EntityTypeTag {
        EntityTypeTag::of::<E>()
    }
}

impl<E: Entity> Clone for EntityId<E> {
    fn clone(&self) -> Self {
        Self { raw: self.raw.clone() }
    }
}

impl<E: Entity> PartialEq for EntityId<E> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<E: Entity> Eq for EntityId<E> {}

impl<E: Entity> Hash for EntityId<E> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<E: Entity> PartialOrd for EntityId<E>
where
    E::RawId: Ord,
{
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E: Entity> Ord for EntityId<E>
where
    E::RawId: Ord,
{
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw.cmp(&other.raw)
    }
}

impl<E: Entity> fmt::Debug for EntityId<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", E::entity_name(), self.raw)
    }
}

/// Runtime tag of an entity type, used to key tables.
#[derive(Clone, Copy)]
pub struct EntityTypeTag {
    type_id: TypeId,
    name: &'static str,
}

impl EntityTypeTag {
    /// Tag for `E`.
    pub fn of<E: Entity>() -> Self {
        Self { type_id: TypeId::of::<E>(), name: E::entity_name() }
    }

    /// Entity type name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for EntityTypeTag {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for EntityTypeTag {}

impl Hash for EntityTypeTag {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
    }
}

impl fmt::Debug for EntityTypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Sets of ids grouped by entity type.
///
/// Used both for the ids a batch deleted (handed to every index) and for the
/// per-table summary recorded in `UpdatesResult`.
#[derive(Clone, Default)]
pub struct IdSets {
    sets: HashMap<EntityTypeTag, Arc<dyn Any + Send + Sync>>,
}

/// Ids removed by a batch, keyed by entity type.
pub type RemovedIds = IdSets;

impl IdSets {
    /// Empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids recorded for `E`, if any.
    pub fn of<E: Entity>(&self) -> Option<&HashSet<EntityId<E>>> {
        self.sets
            .get(&EntityTypeTag::of::<E>())
            .and_then(|set| set.downcast_ref::<HashSet<EntityId<E>>>())
    }

    /// True when `id` is recorded.
    pub fn contains<E: Entity>(&self, id: &EntityId<E>) -> bool {
        self.of::<E>().is_some_and(|set| set.contains(id))
    }

    /// True when any id of type `E` is recorded.
    pub fn contains_type<E: Entity>(&self) -> bool {
        self.sets.contains_key(&EntityTypeTag::of::<E>())
    }

    /// Entity types with at least one id.
    pub fn types(&self) -> impl Iterator<Item = EntityTypeTag> + '_ {
        self.sets.keys().copied()
    }

    /// True when nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Record `ids` for `E`. Empty sets are not recorded.
    pub(crate) fn insert<E: Entity>(&mut self, ids: HashSet<EntityId<E>>) {
        if ids.is_empty() {
            return;
        }
        self.sets.insert(EntityTypeTag::of::<E>(), Arc::new(ids));
    }
}

impl fmt::Debug for IdSets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.sets.keys()).finish()
    }
}
