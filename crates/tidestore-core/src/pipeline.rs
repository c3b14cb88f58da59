//! Pipelines: memoized projections
//!
//! A pipeline turns an input (usually a store's `Changes<S>`) into an output
//! and keeps a piece of storage between calls. `yield_initial` always
//! produces a value; `yield_continuously` may answer `NoUpdate`, which tells
//! the owning `Derived` not to notify anyone.
//!
//! Built-in drop policies, cheapest first:
//!
//! - **Versioned**: compare the lineage and version of a `Versioned<T>` input
//! - **Select with comparer**: compare a selected sub-value before mapping
//! - **Output equality**: recompute and compare the whole output
//!
//! Pipelines that can name themselves return a `PipelineKey`; `Store::derived`
//! uses it to share one live `Derived` between callers.

use std::any::TypeId;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::mem;

use crate::changes::Changes;
use crate::comparer::Comparer;
use crate::versioned::Versioned;

/// Result of a steady-state projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContinuousResult<T> {
    /// Output changed; notify downstream
    New(T),
    /// Nothing worth propagating
    NoUpdate,
}

impl<T> ContinuousResult<T> {
    /// The new value, if any.
    pub fn into_option(self) -> Option<T> {
        match self {
            ContinuousResult::New(value) => Some(value),
            ContinuousResult::NoUpdate => None,
        }
    }

    /// True for `NoUpdate`.
    pub fn is_no_update(&self) -> bool {
        matches!(self, ContinuousResult::NoUpdate)
    }
}

/// Identity of a pipeline configuration, used as a derived cache key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pipeline: TypeId,
    params: u64,
}

impl PipelineKey {
    /// Key for a pipeline type with no runtime parameters.
    pub fn of<P: 'static>() -> Self {
        Self { pipeline: TypeId::of::<P>(), params: 0 }
    }

    /// Key for a pipeline type plus hashed runtime parameters.
    pub fn with<P: 'static, H: Hash + ?Sized>(params: &H) -> Self {
        let mut hasher = DefaultHasher::new();
        params.hash(&mut hasher);
        Self { pipeline: TypeId::of::<P>(), params: hasher.finish() }
    }
}

impl fmt::Debug for PipelineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PipelineKey({:?}, {:#x})", self.pipeline, self.params)
    }
}

/// A memoized projection from `Input` to `Output`.
pub trait Pipeline: Send + Sync + 'static {
    /// What the pipeline reads
    type Input;
    /// What the pipeline produces
    type Output;
    /// Memo kept between calls
    type Storage: Send + 'static;

    /// Fresh storage for a new derived instance.
    fn make_storage(&self) -> Self::Storage;

    /// Unconditional projection for the first value.
    fn yield_initial(&self, input: &Self::Input, storage: &mut Self::Storage) -> Self::Output;

    /// Steady-state projection. Must not have side effects besides `storage`.
    fn yield_continuously(
        &self,
        input: &Self::Input,
        storage: &mut Self::Storage,
    ) -> ContinuousResult<Self::Output>;

    /// Cache identity, if this configuration can be shared.
    fn key(&self) -> Option<PipelineKey> {
        None
    }
}

/// Combinators available on every pipeline.
pub trait PipelineExt: Pipeline + Sized {
    /// Skip inputs for which `predicate` returns true, before running the
    /// projection at all.
    fn drops_input<F>(self, predicate: F) -> DropsInput<Self, F>
    where
        F: Fn(&Self::Input) -> bool + Send + Sync + 'static,
    {
        DropsInput { inner: self, predicate }
    }

    /// Give the pipeline an explicit cache identity. Needed when the
    /// projection captures runtime values.
    fn keyed<H: Hash + ?Sized>(self, params: &H) -> Keyed<Self> {
        let key = PipelineKey::with::<Self, H>(params);
        Keyed { inner: self, key }
    }
}

impl<P: Pipeline> PipelineExt for P {}

fn zero_sized<F>(_: &F) -> bool {
    mem::size_of::<F>() == 0
}

/// Selects a value and drops it when `comparer` says it did not change.
pub struct SelectPipeline<S, T, F> {
    select: F,
    comparer: Comparer<T>,
    auto_key: bool,
    _marker: PhantomData<fn(&S)>,
}

impl<S, T, F> Pipeline for SelectPipeline<S, T, F>
where
    S: 'static,
    T: Clone + Send + 'static,
    F: Fn(&S) -> T + Send + Sync + 'static,
{
    type Input = Changes<S>;
    type Output = T;
    type Storage = Option<T>;

    fn make_storage(&self) -> Option<T> {
        None
    }

    fn yield_initial(&self, input: &Changes<S>, storage: &mut Option<T>) -> T {
        let value = (self.select)(input.current());
        *storage = Some(value.clone());
        value
    }

    fn yield_continuously(&self, input: &Changes<S>, storage: &mut Option<T>) -> ContinuousResult<T> {
        let value = (self.select)(input.current());
        if let Some(last) = storage.as_ref() {
            if self.comparer.equals(last, &value) {
                return ContinuousResult::NoUpdate;
            }
        }
        *storage = Some(value.clone());
        ContinuousResult::New(value)
    }

    fn key(&self) -> Option<PipelineKey> {
        self.auto_key.then(PipelineKey::of::<Self>)
    }
}

/// Selects a cheap intermediate, and maps it only when the intermediate
/// changed. The mapped output is compared again with `output_comparer`.
pub struct MapPipeline<S, I, O, F, M> {
    select: F,
    select_comparer: Comparer<I>,
    map: M,
    output_comparer: Comparer<O>,
    _marker: PhantomData<fn(&S)>,
}

/// Memo for `MapPipeline`.
pub struct MapStorage<I, O> {
    intermediate: Option<I>,
    output: Option<O>,
}

impl<S, I, O, F, M> Pipeline for MapPipeline<S, I, O, F, M>
where
    S: 'static,
    I: Send + 'static,
    O: Clone + Send + 'static,
    F: Fn(&S) -> I + Send + Sync + 'static,
    M: Fn(&I) -> O + Send + Sync + 'static,
{
    type Input = Changes<S>;
    type Output = O;
    type Storage = MapStorage<I, O>;

    fn make_storage(&self) -> MapStorage<I, O> {
        MapStorage { intermediate: None, output: None }
    }

    fn yield_initial(&self, input: &Changes<S>, storage: &mut MapStorage<I, O>) -> O {
        let intermediate = (self.select)(input.current());
        let output = (self.map)(&intermediate);
        storage.intermediate = Some(intermediate);
        storage.output = Some(output.clone());
        output
    }

    fn yield_continuously(
        &self,
        input: &Changes<S>,
        storage: &mut MapStorage<I, O>,
    ) -> ContinuousResult<O> {
        let intermediate = (self.select)(input.current());
        if let Some(last) = storage.intermediate.as_ref() {
            if self.select_comparer.equals(last, &intermediate) {
                return ContinuousResult::NoUpdate;
            }
        }
        let output = (self.map)(&intermediate);
        storage.intermediate = Some(intermediate);
        if let Some(last) = storage.output.as_ref() {
            if self.output_comparer.equals(last, &output) {
                return ContinuousResult::NoUpdate;
            }
        }
        storage.output = Some(output.clone());
        ContinuousResult::New(output)
    }
}

/// Maps a `Versioned<T>` field, dropping inputs whose lineage and version
/// match the last one seen.
pub struct VersionedPipeline<S, T, O, F, M> {
    select: F,
    map: M,
    _marker: PhantomData<fn(&S) -> (T, O)>,
}

impl<S, T, O, F, M> Pipeline for VersionedPipeline<S, T, O, F, M>
where
    S: 'static,
    T: 'static,
    O: 'static,
    F: Fn(&S) -> &Versioned<T> + Send + Sync + 'static,
    M: Fn(&T) -> O + Send + Sync + 'static,
{
    type Input = Changes<S>;
    type Output = O;
    type Storage = Option<(u64, u64)>;

    fn make_storage(&self) -> Option<(u64, u64)> {
        None
    }

    fn yield_initial(&self, input: &Changes<S>, storage: &mut Option<(u64, u64)>) -> O {
        let versioned = (self.select)(input.current());
        *storage = Some((versioned.lineage(), versioned.version()));
        (self.map)(versioned.get())
    }

    fn yield_continuously(
        &self,
        input: &Changes<S>,
        storage: &mut Option<(u64, u64)>,
    ) -> ContinuousResult<O> {
        let versioned = (self.select)(input.current());
        let stamp = (versioned.lineage(), versioned.version());
        if *storage == Some(stamp) {
            return ContinuousResult::NoUpdate;
        }
        *storage = Some(stamp);
        ContinuousResult::New((self.map)(versioned.get()))
    }

    fn key(&self) -> Option<PipelineKey> {
        (zero_sized(&self.select) && zero_sized(&self.map)).then(PipelineKey::of::<Self>)
    }
}

/// Wrapper that rejects inputs before they reach the inner pipeline.
pub struct DropsInput<P, F> {
    inner: P,
    predicate: F,
}

impl<P, F> Pipeline for DropsInput<P, F>
where
    P: Pipeline,
    F: Fn(&P::Input) -> bool + Send + Sync + 'static,
{
    type Input = P::Input;
    type Output = P::Output;
    type Storage = P::Storage;

    fn make_storage(&self) -> P::Storage {
        self.inner.make_storage()
    }

    fn yield_initial(&self, input: &P::Input, storage: &mut P::Storage) -> P::Output {
        self.inner.yield_initial(input, storage)
    }

    fn yield_continuously(&self, input: &P::Input, storage: &mut P::Storage) -> ContinuousResult<P::Output> {
        if (self.predicate)(input) {
            return ContinuousResult::NoUpdate;
        }
        self.inner.yield_continuously(input, storage)
    }

    fn key(&self) -> Option<PipelineKey> {
        let inner = self.inner.key()?;
        zero_sized(&self.predicate).then(|| PipelineKey::with::<Self, _>(&inner))
    }
}

/// Wrapper carrying an explicit cache key.
pub struct Keyed<P> {
    inner: P,
    key: PipelineKey,
}

impl<P: Pipeline> Pipeline for Keyed<P> {
    type Input = P::Input;
    type Output = P::Output;
    type Storage = P::Storage;

    fn make_storage(&self) -> P::Storage {
        self.inner.make_storage()
    }

    fn yield_initial(&self, input: &P::Input, storage: &mut P::Storage) -> P::Output {
        self.inner.yield_initial(input, storage)
    }

    fn yield_continuously(&self, input: &P::Input, storage: &mut P::Storage) -> ContinuousResult<P::Output> {
        self.inner.yield_continuously(input, storage)
    }

    fn key(&self) -> Option<PipelineKey> {
        Some(self.key)
    }
}

/// Constructors for the built-in pipelines.
pub struct Pipelines;

impl Pipelines {
    /// Select a value; drop it when equal to the last one.
    ///
    /// A non-capturing closure yields a cache key automatically, so two call
    /// sites going through the same function share one derived.
    pub fn select<S, T, F>(select: F) -> SelectPipeline<S, T, F>
    where
        T: PartialEq + 'static,
        F: Fn(&S) -> T,
    {
        let auto_key = zero_sized(&select);
        SelectPipeline {
            select,
            comparer: Comparer::equality(),
            auto_key,
            _marker: PhantomData,
        }
    }

    /// Select a value; drop it when `comparer` says equal.
    pub fn select_by<S, T, F>(select: F, comparer: Comparer<T>) -> SelectPipeline<S, T, F>
    where
        F: Fn(&S) -> T,
    {
        SelectPipeline {
            select,
            comparer,
            auto_key: false,
            _marker: PhantomData,
        }
    }

    /// Select a cheap intermediate compared with `select_comparer`, then map
    /// it. The output is never compared.
    pub fn map_with<S, I, O, F, M>(
        select: F,
        select_comparer: Comparer<I>,
        map: M,
    ) -> MapPipeline<S, I, O, F, M>
    where
        O: 'static,
        F: Fn(&S) -> I,
        M: Fn(&I) -> O,
    {
        MapPipeline {
            select,
            select_comparer,
            map,
            output_comparer: Comparer::always_false(),
            _marker: PhantomData,
        }
    }

    /// Like `map_with`, and also drop when the output is unchanged.
    pub fn map_with_output<S, I, O, F, M>(
        select: F,
        select_comparer: Comparer<I>,
        map: M,
    ) -> MapPipeline<S, I, O, F, M>
    where
        O: PartialEq + 'static,
        F: Fn(&S) -> I,
        M: Fn(&I) -> O,
    {
        MapPipeline {
            select,
            select_comparer,
            map,
            output_comparer: Comparer::equality(),
            _marker: PhantomData,
        }
    }

    /// Map a `Versioned<T>` field; drop by version stamp.
    pub fn versioned<S, T, O, F, M>(select: F, map: M) -> VersionedPipeline<S, T, O, F, M>
    where
        F: Fn(&S) -> &Versioned<T>,
        M: Fn(&T) -> O,
    {
        VersionedPipeline {
            select,
            map,
            _marker: PhantomData,
        }
    }
}
