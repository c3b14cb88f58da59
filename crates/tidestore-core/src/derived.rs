//! Derived: subscribable memoized projections
//!
//! A `Derived<T>` owns a private store holding the projected value and one
//! subscription to its upstream. Upstream changes run through the pipeline;
//! only `ContinuousResult::New` values are committed to the private store,
//! so downstream subscribers see a change only when the projection changed.
//!
//! `Store::derived` caches instances by `(PipelineKey, QueueId)` in a weak
//! map owned by the upstream store. The map never keeps a derived alive;
//! dead entries are swept on the next insert.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::changes::Changes;
use crate::emitter::Subscription;
use crate::error::{StoreError, StoreResult};
use crate::modifying::Modifying;
use crate::pipeline::{ContinuousResult, Pipeline};
use crate::queue::TargetQueue;
use crate::store::Store;
use crate::transaction::{BindingOrigin, DerivedFromUpstream};

static NEXT_DERIVED_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct DerivedInner<T> {
    id: u64,
    store: Store<T>,
    upstream: Mutex<Vec<Subscription>>,
    retained: Mutex<Vec<Arc<dyn Any + Send + Sync>>>,
}

impl<T: Clone + Send + Sync + 'static> DerivedInner<T> {
    fn new(id: u64, store: Store<T>) -> Arc<Self> {
        Arc::new(Self {
            id,
            store,
            upstream: Mutex::new(Vec::new()),
            retained: Mutex::new(Vec::new()),
        })
    }

    fn publish(&self, value: T, origin: Option<u64>) {
        let result = self.store.commit_named("derived", |m| {
            m.replace(value);
            m.set_transaction::<DerivedFromUpstream>(true);
            if origin.is_some() {
                m.set_transaction::<BindingOrigin>(origin);
            }
        });
        if let Err(e) = result {
            tracing::debug!(derived = self.id, error = %e, "derived value dropped");
        }
    }

    fn retain_arc(&self, object: Arc<dyn Any + Send + Sync>) {
        let mut retained = self.retained.lock();
        let ptr = Arc::as_ptr(&object) as *const ();
        if retained.iter().any(|r| Arc::as_ptr(r) as *const () == ptr) {
            return;
        }
        retained.push(object);
    }
}

/// Upstream bookkeeping for one derived.
struct Memo<St> {
    storage: St,
    last_version: u64,
}

/// A memoized projection of a store.
///
/// Cloning is O(1); clones share the same instance.
pub struct Derived<T> {
    inner: Arc<DerivedInner<T>>,
}

impl<T> Clone for Derived<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Clone + Send + Sync + 'static> Derived<T> {
    fn from_pipeline<S, P>(upstream: &Store<S>, pipeline: P, queue: TargetQueue) -> StoreResult<Self>
    where
        S: Clone + Send + Sync + 'static,
        P: Pipeline<Input = Changes<S>, Output = T>,
    {
        let id = NEXT_DERIVED_ID.fetch_add(1, Ordering::Relaxed);
        let current = upstream.state();
        let mut storage = pipeline.make_storage();
        let initial = pipeline.yield_initial(&current, &mut storage);

        let store = Store::silent(initial, format!("{}/derived-{}", upstream.name(), id));
        let inner = DerivedInner::new(id, store);

        let weak = Arc::downgrade(&inner);
        let memo = Mutex::new(Memo { storage, last_version: current.version() });
        let subscription = upstream.subscribe(queue, false, move |changes: Changes<S>| {
            let Some(inner) = weak.upgrade() else { return };
            let mut memo = memo.lock();
            if changes.version() <= memo.last_version {
                return;
            }
            memo.last_version = changes.version();

            let origin = changes.transaction().get::<BindingOrigin>().filter(|o| *o == inner.id);
            if let ContinuousResult::New(value) = pipeline.yield_continuously(&changes, &mut memo.storage) {
                inner.publish(value, origin);
            }
        })?;
        inner.upstream.lock().push(subscription);

        tracing::trace!(derived = id, upstream = %upstream.name(), "derived created");
        Ok(Self { inner })
    }

    /// A derived that never changes.
    pub fn constant(value: T) -> Self {
        let id = NEXT_DERIVED_ID.fetch_add(1, Ordering::Relaxed);
        let store = Store::silent(value, format!("constant-{}", id));
        Self { inner: DerivedInner::new(id, store) }
    }

    /// Latest projected snapshot.
    pub fn state(&self) -> Changes<T> {
        self.inner.store.state()
    }

    /// Latest projected value.
    pub fn value(&self) -> T {
        self.inner.store.state().current().clone()
    }

    /// Number of values published so far.
    pub fn version(&self) -> u64 {
        self.inner.store.version()
    }

    /// Unique instance id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// True if both handles are the same instance.
    pub fn ptr_eq(&self, other: &Derived<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Subscribe to projected values. The subscription keeps this derived
    /// alive.
    pub fn subscribe(
        &self,
        queue: TargetQueue,
        drops_first: bool,
        callback: impl Fn(Changes<T>) + Send + Sync + 'static,
    ) -> StoreResult<Subscription> {
        let subscription = self.inner.store.subscribe(queue, drops_first, callback)?;
        Ok(subscription.retaining(self.inner.clone()))
    }

    /// Keep `object` alive for as long as this derived lives.
    pub fn associate(&self, object: impl Any + Send + Sync) {
        self.inner.retain_arc(Arc::new(object));
    }

    /// Derive again from this derived. The child keeps its parent alive.
    pub fn derived<P>(&self, pipeline: P, queue: TargetQueue) -> StoreResult<Derived<P::Output>>
    where
        P: Pipeline<Input = Changes<T>>,
        P::Output: Clone + Send + Sync + 'static,
    {
        let child = self.inner.store.derived(pipeline, queue)?;
        child.inner.retain_arc(self.inner.clone());
        Ok(child)
    }

    /// Block until every subscriber of this derived has caught up.
    pub fn wait_until_all_subscribers_consumed(&self) {
        self.inner.store.wait_until_all_subscribers_consumed();
    }
}

impl<A, B> Derived<(A, B)>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
{
    /// Combine two deriveds into one holding both current values.
    pub fn combined2(a: &Derived<A>, b: &Derived<B>, queue: TargetQueue) -> StoreResult<Self> {
        let id = NEXT_DERIVED_ID.fetch_add(1, Ordering::Relaxed);
        let (state_a, state_b) = (a.state(), b.state());
        let store = Store::silent(
            (state_a.current().clone(), state_b.current().clone()),
            format!("combined-{}", id),
        );
        let inner = DerivedInner::new(id, store);

        let weak = Arc::downgrade(&inner);
        let last_a = Mutex::new(state_a.version());
        let sub_a = a.inner.store.subscribe(queue.clone(), false, move |changes: Changes<A>| {
            let Some(inner) = weak.upgrade() else { return };
            let mut last = last_a.lock();
            if changes.version() <= *last {
                return;
            }
            *last = changes.version();
            let value = changes.current().clone();
            let result = inner.store.commit_named("combined", |m| {
                m.0 = value;
                m.set_transaction::<DerivedFromUpstream>(true);
            });
            if let Err(e) = result {
                tracing::warn!(derived = inner.id, error = %e, "combined value dropped");
            }
        })?;

        let weak = Arc::downgrade(&inner);
        let last_b = Mutex::new(state_b.version());
        let sub_b = b.inner.store.subscribe(queue, false, move |changes: Changes<B>| {
            let Some(inner) = weak.upgrade() else { return };
            let mut last = last_b.lock();
            if changes.version() <= *last {
                return;
            }
            *last = changes.version();
            let value = changes.current().clone();
            let result = inner.store.commit_named("combined", |m| {
                m.1 = value;
                m.set_transaction::<DerivedFromUpstream>(true);
            });
            if let Err(e) = result {
                tracing::warn!(derived = inner.id, error = %e, "combined value dropped");
            }
        })?;

        inner.upstream.lock().extend([sub_a, sub_b]);
        inner.retain_arc(a.inner.clone());
        inner.retain_arc(b.inner.clone());
        Ok(Self { inner })
    }
}

impl<T: fmt::Debug> fmt::Debug for Derived<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Derived")
            .field("id", &self.inner.id)
            .field("store", &self.inner.store)
            .finish()
    }
}

/// A derived that can write back to its upstream store.
///
/// `set` commits through the upstream store tagged with this instance's
/// `BindingOrigin`. The new value reaches the read side like any other
/// upstream change, in upstream commit order, and the published change
/// carries the same `BindingOrigin`.
pub struct BindingDerived<T> {
    derived: Derived<T>,
    setter: Arc<dyn Fn(T) -> StoreResult<()> + Send + Sync>,
}

impl<T> Clone for BindingDerived<T> {
    fn clone(&self) -> Self {
        Self {
            derived: self.derived.clone(),
            setter: Arc::clone(&self.setter),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> BindingDerived<T> {
    /// Write `value` through to the upstream store.
    pub fn set(&self, value: T) -> StoreResult<()> {
        (self.setter)(value)
    }

    /// The read side.
    pub fn derived(&self) -> &Derived<T> {
        &self.derived
    }
}

impl<T> std::ops::Deref for BindingDerived<T> {
    type Target = Derived<T>;

    fn deref(&self) -> &Derived<T> {
        &self.derived
    }
}

impl<S: Clone + Send + Sync + 'static> Store<S> {
    /// Projection of this store through `pipeline`, delivered on `queue`.
    ///
    /// Pipelines with a `PipelineKey` are shared: while one instance is
    /// alive, the same key and queue return that same instance.
    pub fn derived<P>(&self, pipeline: P, queue: TargetQueue) -> StoreResult<Derived<P::Output>>
    where
        P: Pipeline<Input = Changes<S>>,
        P::Output: Clone + Send + Sync + 'static,
    {
        let Some(key) = pipeline.key() else {
            return Derived::from_pipeline(self, pipeline, queue);
        };
        let cache_key = (key, queue.id());
        if let Some(inner) = self.cached_derived::<DerivedInner<P::Output>>(&cache_key) {
            return Ok(Derived { inner });
        }
        let created = Derived::from_pipeline(self, pipeline, queue)?;
        let inner = self.insert_cached_derived(cache_key, created.inner);
        Ok(Derived { inner })
    }

    /// Like `derived`, but never shared.
    pub fn derived_uncached<P>(&self, pipeline: P, queue: TargetQueue) -> StoreResult<Derived<P::Output>>
    where
        P: Pipeline<Input = Changes<S>>,
        P::Output: Clone + Send + Sync + 'static,
    {
        Derived::from_pipeline(self, pipeline, queue)
    }

    /// Writable projection. `set` receives the upstream state and the value
    /// to write.
    pub fn binding_derived<P, F>(
        &self,
        pipeline: P,
        set: F,
        queue: TargetQueue,
    ) -> StoreResult<BindingDerived<P::Output>>
    where
        P: Pipeline<Input = Changes<S>>,
        P::Output: Clone + Send + Sync + 'static,
        F: Fn(&mut Modifying<'_, S>, P::Output) + Send + Sync + 'static,
    {
        let derived = Derived::from_pipeline(self, pipeline, queue)?;
        let id = derived.inner.id;
        let upstream = self.downgrade();
        let upstream_name = self.name().to_string();

        let setter = Arc::new(move |value: P::Output| -> StoreResult<()> {
            let store = upstream
                .upgrade()
                .ok_or_else(|| StoreError::Invalidated { store: upstream_name.clone() })?;
            store.commit_named("binding", |m| {
                set(m, value);
                m.set_transaction::<BindingOrigin>(Some(id));
            })?;
            Ok(())
        });

        Ok(BindingDerived { derived, setter })
    }
}
