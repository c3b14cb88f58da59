//! Entity projections and store integration
//!
//! `StoreOrmExt` adds batch updates and entity projections to any
//! `Store<S>` whose state embeds a `Database`. Projections skip a commit
//! when the database markers prove the entity they read was not touched:
//!
//! 1. no batch was applied at all
//! 2. the entity's table was not rewritten
//! 3. the batch that was applied did not update or delete this id

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;

use tidestore_core::{
    Changes, Comparer, ContinuousResult, Derived, InstancePool, MutationTrace, Pipeline, PipelineKey, Store,
    StoreResult, TargetQueue, WeakStore,
};

use crate::batch::BatchUpdateContext;
use crate::comparisons::DatabaseComparisons;
use crate::database::Database;
use crate::entity::{Entity, EntityId};
use crate::error::{BatchError, BatchResult};

/// State types that hold a `Database`.
pub trait DatabaseEmbedding: Clone + Send + Sync + 'static {
    /// The embedded database.
    fn database(&self) -> &Database;

    /// Mutable access to the embedded database.
    fn database_mut(&mut self) -> &mut Database;
}

impl DatabaseEmbedding for Database {
    fn database(&self) -> &Database {
        self
    }

    fn database_mut(&mut self) -> &mut Database {
        self
    }
}

/// Result of looking an entity up.
#[derive(Clone, Debug, PartialEq)]
pub struct EntityWrapper<E: Entity> {
    /// Requested id
    pub id: EntityId<E>,
    /// The entity, or `None` when it is not stored
    pub entity: Option<E>,
}

impl<E: Entity> EntityWrapper<E> {
    /// True when the entity is stored.
    pub fn is_live(&self) -> bool {
        self.entity.is_some()
    }
}

/// An entity that stays readable after deletion.
#[derive(Clone, Debug, PartialEq)]
pub struct NonNullEntityWrapper<E: Entity> {
    entity: E,
    is_fallback: bool,
}

impl<E: Entity> NonNullEntityWrapper<E> {
    /// Wrap `entity`.
    pub fn new(entity: E, is_fallback: bool) -> Self {
        Self { entity, is_fallback }
    }

    /// The entity, or its last known value once deleted.
    pub fn entity(&self) -> &E {
        &self.entity
    }

    /// Entity id.
    pub fn id(&self) -> EntityId<E> {
        self.entity.id()
    }

    /// True when the entity was deleted and this is its last value.
    pub fn is_fallback(&self) -> bool {
        self.is_fallback
    }
}

impl<E: Entity> Deref for NonNullEntityWrapper<E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.entity
    }
}

fn database_changed<S: DatabaseEmbedding>(changes: &Changes<S>, no_updates: &Comparer<Database>) -> bool {
    match changes.previous_value() {
        Some(previous) => !no_updates.equals(previous.database(), changes.current().database()),
        None => true,
    }
}

/// Projects one entity by id.
pub struct EntityPipeline<S, E: Entity> {
    id: EntityId<E>,
    no_updates: Comparer<Database>,
    _marker: PhantomData<fn(&S)>,
}

impl<S, E: Entity> EntityPipeline<S, E> {
    /// Pipeline for the entity under `id`.
    pub fn new(id: EntityId<E>) -> Self {
        let no_updates = DatabaseComparisons::entity_no_updates(id.clone());
        Self { id, no_updates, _marker: PhantomData }
    }

    fn lookup(&self, database: &Database) -> EntityWrapper<E> {
        EntityWrapper {
            id: self.id.clone(),
            entity: database.table::<E>().find(&self.id).cloned(),
        }
    }
}

impl<S: DatabaseEmbedding, E: Entity> Pipeline for EntityPipeline<S, E> {
    type Input = Changes<S>;
    type Output = EntityWrapper<E>;
    type Storage = ();

    fn make_storage(&self) {}

    fn yield_initial(&self, input: &Changes<S>, _: &mut ()) -> EntityWrapper<E> {
        self.lookup(input.current().database())
    }

    fn yield_continuously(&self, input: &Changes<S>, _: &mut ()) -> ContinuousResult<EntityWrapper<E>> {
        if !database_changed(input, &self.no_updates) {
            return ContinuousResult::NoUpdate;
        }
        ContinuousResult::New(self.lookup(input.current().database()))
    }

    fn key(&self) -> Option<PipelineKey> {
        Some(PipelineKey::with::<Self, _>(&self.id))
    }
}

/// Projects one entity and keeps its last value after deletion.
pub struct NonNullEntityPipeline<S, E: Entity> {
    seed: E,
    no_updates: Comparer<Database>,
    _marker: PhantomData<fn(&S)>,
}

impl<S, E: Entity> NonNullEntityPipeline<S, E> {
    /// Pipeline for `seed`'s id. `seed` is the fallback until a stored value
    /// is seen.
    pub fn new(seed: E) -> Self {
        let no_updates = DatabaseComparisons::entity_no_updates(seed.id());
        Self { seed, no_updates, _marker: PhantomData }
    }
}

impl<S: DatabaseEmbedding, E: Entity> Pipeline for NonNullEntityPipeline<S, E> {
    type Input = Changes<S>;
    type Output = NonNullEntityWrapper<E>;
    type Storage = NonNullEntityWrapper<E>;

    fn make_storage(&self) -> NonNullEntityWrapper<E> {
        NonNullEntityWrapper::new(self.seed.clone(), true)
    }

    fn yield_initial(&self, input: &Changes<S>, last: &mut NonNullEntityWrapper<E>) -> NonNullEntityWrapper<E> {
        if let Some(entity) = input.current().database().table::<E>().find(&last.id()) {
            *last = NonNullEntityWrapper::new(entity.clone(), false);
        }
        last.clone()
    }

    fn yield_continuously(
        &self,
        input: &Changes<S>,
        last: &mut NonNullEntityWrapper<E>,
    ) -> ContinuousResult<NonNullEntityWrapper<E>> {
        if !database_changed(input, &self.no_updates) {
            return ContinuousResult::NoUpdate;
        }
        match input.current().database().table::<E>().find(&last.id()) {
            Some(entity) => *last = NonNullEntityWrapper::new(entity.clone(), false),
            None if last.is_fallback => return ContinuousResult::NoUpdate,
            None => last.is_fallback = true,
        }
        ContinuousResult::New(last.clone())
    }

    fn key(&self) -> Option<PipelineKey> {
        Some(PipelineKey::with::<Self, _>(&self.seed.id()))
    }
}

type EntityPool<E> = InstancePool<EntityId<E>, Derived<EntityWrapper<E>>>;

/// Projects a list of ids, computed from the database, into one entity
/// projection per id. Projections for ids seen before are reused.
pub struct QueriedEntitiesPipeline<S, E: Entity, F> {
    query: F,
    store: WeakStore<S>,
    queue: TargetQueue,
    pool: Arc<EntityPool<E>>,
    no_updates: Comparer<Database>,
}

impl<S, E, F> QueriedEntitiesPipeline<S, E, F>
where
    S: DatabaseEmbedding,
    E: Entity,
    F: Fn(&Database) -> Vec<EntityId<E>>,
{
    fn children(&self, ids: &[EntityId<E>], database: &Database) -> Vec<Derived<EntityWrapper<E>>> {
        let store = self.store.upgrade();
        self.pool.map(ids.iter().cloned(), true, |id| {
            let live = store
                .as_ref()
                .and_then(|store| store.derived_entity(id.clone(), self.queue.clone()).ok());
            live.unwrap_or_else(|| {
                Derived::constant(EntityWrapper {
                    id: id.clone(),
                    entity: database.table::<E>().find(id).cloned(),
                })
            })
        })
    }

    /// Number of pooled child projections.
    pub fn pooled(&self) -> usize {
        self.pool.len()
    }
}

impl<S, E, F> Pipeline for QueriedEntitiesPipeline<S, E, F>
where
    S: DatabaseEmbedding,
    E: Entity,
    F: Fn(&Database) -> Vec<EntityId<E>> + Send + Sync + 'static,
{
    type Input = Changes<S>;
    type Output = Vec<Derived<EntityWrapper<E>>>;
    type Storage = Vec<EntityId<E>>;

    fn make_storage(&self) -> Vec<EntityId<E>> {
        Vec::new()
    }

    fn yield_initial(&self, input: &Changes<S>, last: &mut Vec<EntityId<E>>) -> Vec<Derived<EntityWrapper<E>>> {
        let database = input.current().database();
        *last = (self.query)(database);
        self.children(last.as_slice(), database)
    }

    fn yield_continuously(
        &self,
        input: &Changes<S>,
        last: &mut Vec<EntityId<E>>,
    ) -> ContinuousResult<Vec<Derived<EntityWrapper<E>>>> {
        if !database_changed(input, &self.no_updates) {
            return ContinuousResult::NoUpdate;
        }
        let database = input.current().database();
        let ids = (self.query)(database);
        if ids == *last {
            return ContinuousResult::NoUpdate;
        }
        *last = ids;
        ContinuousResult::New(self.children(last.as_slice(), database))
    }
}

impl<S, E: Entity, F> fmt::Debug for QueriedEntitiesPipeline<S, E, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueriedEntitiesPipeline")
            .field("entity", &E::entity_name())
            .field("queue", &self.queue)
            .field("pooled", &self.pool.len())
            .finish()
    }
}

/// Entity operations on a store whose state embeds a `Database`.
pub trait StoreOrmExt<S: DatabaseEmbedding> {
    /// Run a batch update inside one commit.
    ///
    /// A batch that stages nothing does not advance the store version and
    /// notifies no one. A failed batch leaves the store untouched.
    fn batch_update<R>(
        &self,
        update: impl FnOnce(&mut BatchUpdateContext<'_>) -> BatchResult<R>,
    ) -> BatchResult<R>;

    /// Shared projection of the entity under `id`.
    fn derived_entity<E: Entity>(&self, id: EntityId<E>, queue: TargetQueue) -> StoreResult<Derived<EntityWrapper<E>>>;

    /// Shared projection of a stored entity that keeps its last value after
    /// deletion. Fails with `StoredEntityNotFound` when `id` is not stored.
    fn derived_entity_non_null<E: Entity>(
        &self,
        id: EntityId<E>,
        queue: TargetQueue,
    ) -> BatchResult<Derived<NonNullEntityWrapper<E>>>;

    /// Projection of the ids returned by `query`, one child projection per
    /// id. Recomputed only when indexes or the table of `E` changed, and
    /// published only when the id list changed.
    fn derived_queried_entities<E, F>(
        &self,
        query: F,
        queue: TargetQueue,
    ) -> StoreResult<Derived<Vec<Derived<EntityWrapper<E>>>>>
    where
        E: Entity,
        F: Fn(&Database) -> Vec<EntityId<E>> + Send + Sync + 'static;
}

impl<S: DatabaseEmbedding> StoreOrmExt<S> for Store<S> {
    #[track_caller]
    fn batch_update<R>(
        &self,
        update: impl FnOnce(&mut BatchUpdateContext<'_>) -> BatchResult<R>,
    ) -> BatchResult<R> {
        let trace = MutationTrace::here("batch_update");
        self.commit_traced(trace, |state| {
            let (result, edits) = {
                let mut context = BatchUpdateContext::new(state.database());
                let result = update(&mut context)?;
                (result, context.finish())
            };
            if let Some(edits) = edits {
                state.database_mut().commit_batch_update(edits);
            }
            Ok(result)
        })
    }

    fn derived_entity<E: Entity>(&self, id: EntityId<E>, queue: TargetQueue) -> StoreResult<Derived<EntityWrapper<E>>> {
        self.derived(EntityPipeline::new(id), queue)
    }

    fn derived_entity_non_null<E: Entity>(
        &self,
        id: EntityId<E>,
        queue: TargetQueue,
    ) -> BatchResult<Derived<NonNullEntityWrapper<E>>> {
        let state = self.state();
        let Some(seed) = state.current().database().table::<E>().find(&id).cloned() else {
            return Err(BatchError::StoredEntityNotFound { entity_type: E::entity_name() });
        };
        Ok(self.derived(NonNullEntityPipeline::new(seed), queue)?)
    }

    fn derived_queried_entities<E, F>(
        &self,
        query: F,
        queue: TargetQueue,
    ) -> StoreResult<Derived<Vec<Derived<EntityWrapper<E>>>>>
    where
        E: Entity,
        F: Fn(&Database) -> Vec<EntityId<E>> + Send + Sync + 'static,
    {
        let pipeline = QueriedEntitiesPipeline {
            query,
            store: self.downgrade(),
            queue: queue.clone(),
            pool: Arc::new(InstancePool::new()),
            no_updates: Comparer::all_of(vec![
                DatabaseComparisons::index_no_updates(),
                DatabaseComparisons::table_no_updates::<E>(),
            ]),
        };
        self.derived_uncached(pipeline, queue)
    }
}
