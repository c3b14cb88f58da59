//! Store: versioned state container
//!
//! A `Store<S>` holds the current `Changes<S>` snapshot, serializes commits
//! through one exclusive section and fans every committed change out to its
//! subscribers in version order.
//!
//! # Commit path
//!
//! 1. Take the writer lock (blocking other commits)
//! 2. Run the mutation against a copy-on-write view of the current state
//! 3. If nothing was written, return without touching the version
//! 4. Run middlewares, build `Changes` with `version + 1`, publish it to the
//!    lock-free read slot and enqueue the notification
//! 5. Release the writer lock, then drain notifications
//!
//! Enqueueing under the lock fixes the notification order; draining outside
//! it lets a subscriber commit again without deadlocking.
//!
//! # Delivery
//!
//! Each subscriber remembers the newest version it has been handed. If an
//! executor reorders deliveries so that an older version arrives after a
//! newer one, the subscriber is handed the newest snapshot again with its
//! previous value dropped, and the inversion is reported to the sanitizer.

use std::any::Any;
use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use hashbrown::HashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::changes::{Changes, MutationTrace};
use crate::config::StoreConfig;
use crate::emitter::{EventEmitter, Handler, Latch, Subscription, SubscriptionState, WaitToken};
use crate::error::{StoreError, StoreResult};
use crate::logger::{CommitLog, StoreLogger, SubscriptionEvent, SubscriptionLog};
use crate::modifying::Modifying;
use crate::pipeline::PipelineKey;
use crate::queue::{QueueId, TargetQueue};
use crate::sanitizer::{RuntimeError, RuntimeSanitizer, TracingSanitizer};

/// Hook that runs inside the exclusive section after a modifying mutation.
///
/// Middlewares run in registration order and may write further. They are not
/// run for commits that changed nothing.
pub trait StoreMiddleware<S>: Send + Sync + 'static {
    /// Adjust the state about to be committed.
    fn modify(&self, state: &mut Modifying<'_, S>);
}

impl<S, F> StoreMiddleware<S> for F
where
    F: Fn(&mut Modifying<'_, S>) + Send + Sync + 'static,
{
    fn modify(&self, state: &mut Modifying<'_, S>) {
        self(state)
    }
}

pub(crate) enum StoreEvent<S> {
    Changed(Changes<S>),
    Waiter(Arc<WaitToken>),
}

pub(crate) type DerivedCacheKey = (PipelineKey, QueueId);

/// Hazard reporting shared between a store and its subscription sinks.
pub(crate) struct Diagnostics {
    pub(crate) name: String,
    sanitizer: Arc<dyn RuntimeSanitizer>,
    report_order_recovery: bool,
    detect_recursive_commit: bool,
    /// Threads currently running a subscriber callback, with nesting depth
    dispatching: Mutex<HashMap<ThreadId, usize>>,
}

impl Diagnostics {
    fn enter_dispatch(&self) -> Option<DispatchGuard<'_>> {
        if !self.detect_recursive_commit {
            return None;
        }
        let thread = thread::current().id();
        *self.dispatching.lock().entry(thread).or_insert(0) += 1;
        Some(DispatchGuard { diagnostics: self, thread })
    }

    fn is_dispatching(&self, thread: ThreadId) -> bool {
        self.dispatching.lock().contains_key(&thread)
    }

    fn report(&self, error: RuntimeError) {
        self.sanitizer.on_runtime_error(error);
    }
}

struct DispatchGuard<'a> {
    diagnostics: &'a Diagnostics,
    thread: ThreadId,
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        let mut map = self.diagnostics.dispatching.lock();
        if let Some(depth) = map.get_mut(&self.thread) {
            *depth -= 1;
            if *depth == 0 {
                map.remove(&self.thread);
            }
        }
    }
}

/// Clears the writer-thread marker when the exclusive section ends.
struct WriterOwner<'a>(&'a Mutex<Option<ThreadId>>);

impl<'a> WriterOwner<'a> {
    fn set(slot: &'a Mutex<Option<ThreadId>>, thread: ThreadId) -> Self {
        *slot.lock() = Some(thread);
        Self(slot)
    }
}

impl Drop for WriterOwner<'_> {
    fn drop(&mut self) {
        *self.0.lock() = None;
    }
}

/// Per-subscriber delivery state.
struct Sink<S> {
    latest: Mutex<Option<Changes<S>>>,
    /// Version current when the subscription was registered. Older queued
    /// events belong to earlier subscribers.
    registered: AtomicU64,
    callback: Box<dyn Fn(Changes<S>) + Send + Sync>,
    state: Arc<SubscriptionState>,
    diagnostics: Arc<Diagnostics>,
}

impl<S> Sink<S> {
    fn receive(&self, received: Changes<S>, initial: bool) {
        if !initial && received.version() <= self.registered.load(Ordering::Acquire) {
            return;
        }
        self.state.deliver(|| {
            let mut inversion = None;
            let resolved = {
                let mut latest = self.latest.lock();
                match latest.as_ref() {
                    // A commit raced ahead of the initial snapshot; it already carried newer data
                    Some(l) if initial && l.version() >= received.version() => None,
                    Some(l) if l.version() > received.version() => {
                        inversion = Some((l.version(), received.version()));
                        Some(l.dropped_previous())
                    }
                    _ => {
                        *latest = Some(received.clone());
                        Some(received)
                    }
                }
            };

            if let Some((latest, received)) = inversion {
                if self.diagnostics.report_order_recovery {
                    self.diagnostics.report(RuntimeError::RecoveredFromOlderVersion {
                        store: self.diagnostics.name.clone(),
                        latest,
                        received,
                    });
                }
            }

            if let Some(changes) = resolved {
                let _dispatch = self.diagnostics.enter_dispatch();
                (self.callback)(changes);
            }
        });
    }
}

pub(crate) struct StoreCore<S> {
    pub(crate) diagnostics: Arc<Diagnostics>,
    config: StoreConfig,
    current: ArcSwap<Changes<S>>,
    writer: Mutex<()>,
    writer_thread: Mutex<Option<ThreadId>>,
    emitter: Arc<EventEmitter<StoreEvent<S>>>,
    middlewares: RwLock<Vec<Arc<dyn StoreMiddleware<S>>>>,
    logger: Option<Arc<dyn StoreLogger>>,
    derived_cache: Mutex<HashMap<DerivedCacheKey, Weak<dyn Any + Send + Sync>>>,
    invalidated: AtomicBool,
    background: Mutex<Option<TargetQueue>>,
}

impl<S> StoreCore<S> {
    fn name(&self) -> &str {
        &self.diagnostics.name
    }

    fn invalidate(&self) -> bool {
        if self.invalidated.swap(true, Ordering::AcqRel) {
            return false;
        }
        let states = self.emitter.clear();
        let cancelled = states.len();
        for state in states {
            state.cancel();
        }
        self.derived_cache.lock().clear();
        tracing::debug!(store = %self.name(), subscriptions = cancelled, "store invalidated");
        true
    }
}

impl<S> Drop for StoreCore<S> {
    fn drop(&mut self) {
        self.invalidate();
    }
}

/// Thread-safe handle to a versioned state container. Cloning is O(1) and
/// every clone refers to the same store.
pub struct Store<S> {
    pub(crate) core: Arc<StoreCore<S>>,
}

impl<S> Clone for Store<S> {
    fn clone(&self) -> Self {
        Self { core: Arc::clone(&self.core) }
    }
}

/// Non-owning reference to a store.
pub struct WeakStore<S> {
    core: Weak<StoreCore<S>>,
}

impl<S> Clone for WeakStore<S> {
    fn clone(&self) -> Self {
        Self { core: Weak::clone(&self.core) }
    }
}

impl<S> WeakStore<S> {
    /// The store, if any handle is still alive.
    pub fn upgrade(&self) -> Option<Store<S>> {
        self.core.upgrade().map(|core| Store { core })
    }
}

impl<S: Clone + Send + Sync + 'static> Store<S> {
    /// Create a store with the default configuration.
    #[track_caller]
    pub fn new(initial: S) -> Self {
        let config = StoreConfig::default();
        let name = default_name(Location::caller());
        Self::from_parts(initial, config, name, None, None, Vec::new())
    }

    /// Start configuring a store.
    #[track_caller]
    pub fn builder(initial: S) -> StoreBuilder<S> {
        StoreBuilder {
            initial,
            config: StoreConfig::default(),
            logger: None,
            sanitizer: None,
            middlewares: Vec::new(),
            location: Location::caller(),
        }
    }

    /// Unreported store used internally by derived values.
    pub(crate) fn silent(initial: S, name: String) -> Self {
        Self::from_parts(initial, StoreConfig::silent(), name, None, None, Vec::new())
    }

    fn from_parts(
        initial: S,
        config: StoreConfig,
        name: String,
        logger: Option<Arc<dyn StoreLogger>>,
        sanitizer: Option<Arc<dyn RuntimeSanitizer>>,
        middlewares: Vec<Arc<dyn StoreMiddleware<S>>>,
    ) -> Self {
        let diagnostics = Arc::new(Diagnostics {
            name,
            sanitizer: sanitizer.unwrap_or_else(|| Arc::new(TracingSanitizer)),
            report_order_recovery: config.report_order_recovery,
            detect_recursive_commit: config.detect_recursive_commit,
            dispatching: Mutex::new(HashMap::new()),
        });

        Self {
            core: Arc::new(StoreCore {
                diagnostics,
                config,
                current: ArcSwap::from_pointee(Changes::new(initial)),
                writer: Mutex::new(()),
                writer_thread: Mutex::new(None),
                emitter: Arc::new(EventEmitter::new()),
                middlewares: RwLock::new(middlewares),
                logger,
                derived_cache: Mutex::new(HashMap::new()),
                invalidated: AtomicBool::new(false),
                background: Mutex::new(None),
            }),
        }
    }

    /// Store name used in logs and errors.
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Active configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.core.config
    }

    /// Latest committed snapshot. Never blocks.
    pub fn state(&self) -> Changes<S> {
        Changes::clone(&self.core.current.load())
    }

    /// Version of the latest committed snapshot.
    pub fn version(&self) -> u64 {
        self.core.current.load().version()
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.core.emitter.len()
    }

    /// True once `invalidate` ran.
    pub fn is_invalidated(&self) -> bool {
        self.core.invalidated.load(Ordering::Acquire)
    }

    /// True if both handles refer to the same store.
    pub fn ptr_eq(&self, other: &Store<S>) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    /// Non-owning handle.
    pub fn downgrade(&self) -> WeakStore<S> {
        WeakStore { core: Arc::downgrade(&self.core) }
    }

    /// Register a middleware. Applies to commits issued after this returns.
    pub fn add_middleware(&self, middleware: impl StoreMiddleware<S>) {
        self.core.middlewares.write().push(Arc::new(middleware));
    }

    /// Dedicated serial background queue for this store, named after
    /// `StoreConfig::background_thread_name`. Spawned on first use.
    pub fn background_queue(&self) -> StoreResult<TargetQueue> {
        let mut slot = self.core.background.lock();
        if let Some(queue) = slot.as_ref() {
            return Ok(queue.clone());
        }
        let queue = TargetQueue::serial_background(self.core.config.background_thread_name.clone())?;
        *slot = Some(queue.clone());
        Ok(queue)
    }

    /// Run `mutation` inside the exclusive section.
    ///
    /// If the closure writes through the `Modifying` view, a new snapshot
    /// with `version + 1` is published and every subscriber is notified.
    /// Otherwise the store is left exactly as it was.
    #[track_caller]
    pub fn commit<R>(&self, mutation: impl FnOnce(&mut Modifying<'_, S>) -> R) -> StoreResult<R> {
        let trace = MutationTrace::here("commit");
        self.commit_traced(trace, |m| Ok::<R, StoreError>(mutation(m)))
    }

    /// `commit` with an explicit operation name recorded in the trace.
    #[track_caller]
    pub fn commit_named<R>(
        &self,
        name: &'static str,
        mutation: impl FnOnce(&mut Modifying<'_, S>) -> R,
    ) -> StoreResult<R> {
        let trace = MutationTrace::here(name);
        self.commit_traced(trace, |m| Ok::<R, StoreError>(mutation(m)))
    }

    /// Fallible commit. An error from `mutation` propagates unchanged and the
    /// state is left untouched.
    #[track_caller]
    pub fn try_commit<R, E>(
        &self,
        mutation: impl FnOnce(&mut Modifying<'_, S>) -> Result<R, E>,
    ) -> Result<R, E>
    where
        E: From<StoreError>,
    {
        let trace = MutationTrace::here("commit");
        self.commit_traced(trace, mutation)
    }

    /// Commit with a caller-supplied trace.
    pub fn commit_traced<R, E>(
        &self,
        trace: MutationTrace,
        mutation: impl FnOnce(&mut Modifying<'_, S>) -> Result<R, E>,
    ) -> Result<R, E>
    where
        E: From<StoreError>,
    {
        let core = &*self.core;
        self.ensure_valid()?;

        let me = thread::current().id();
        if *core.writer_thread.lock() == Some(me) {
            return Err(StoreError::ReentrantMutation { store: core.name().to_string() }.into());
        }
        if core.diagnostics.detect_recursive_commit && core.diagnostics.is_dispatching(me) {
            core.diagnostics.report(RuntimeError::RecursiveCommit {
                store: core.name().to_string(),
                thread: me,
            });
        }

        let started = Instant::now();
        let (result, committed) = {
            let _writer = core.writer.lock();
            let _owner = WriterOwner::set(&core.writer_thread, me);
            self.ensure_valid()?;

            let current = core.current.load_full();
            let mut modifying = Modifying::new(current.current());
            let result = mutation(&mut modifying)?;

            match modifying.finish() {
                (None, _) => (result, None),
                (Some(next), transaction) => {
                    let mut modifying = Modifying::owned(next, transaction);
                    for middleware in core.middlewares.read().iter() {
                        middleware.modify(&mut modifying);
                    }
                    let (next, transaction) = modifying.into_parts();

                    let changes = current.make_next(next, vec![trace], transaction);
                    core.current.store(Arc::new(changes.clone()));
                    core.emitter.enqueue(StoreEvent::Changed(changes.clone()));
                    (result, Some(changes))
                }
            }
        };

        if let Some(changes) = committed {
            let elapsed = started.elapsed();
            core.emitter.drain();

            if core.config.trace_commits {
                tracing::debug!(
                    store = %core.name(),
                    version = changes.version(),
                    took_us = elapsed.as_micros() as u64,
                    "committed"
                );
            }
            if let Some(logger) = &core.logger {
                logger.did_commit(CommitLog {
                    store: core.name().to_string(),
                    version: changes.version(),
                    traces: changes.traces().to_vec(),
                    elapsed,
                });
            }
        }

        Ok(result)
    }

    /// Register `callback` for every committed change, delivered on `queue`.
    ///
    /// Unless `drops_first`, the current snapshot is delivered first with its
    /// previous value dropped, so change checks on it report "changed".
    pub fn subscribe(
        &self,
        queue: TargetQueue,
        drops_first: bool,
        callback: impl Fn(Changes<S>) + Send + Sync + 'static,
    ) -> StoreResult<Subscription> {
        self.ensure_valid()?;
        let core = &*self.core;

        let id = core.emitter.next_id();
        let state = SubscriptionState::new(id);

        let emitter = Arc::downgrade(&core.emitter);
        let logger = core.logger.clone();
        let store_name = core.name().to_string();
        state.set_on_cancel(move || {
            if let Some(emitter) = emitter.upgrade() {
                emitter.remove(id);
            }
            if let Some(logger) = logger {
                logger.did_change_subscription(SubscriptionLog {
                    store: store_name,
                    subscription: id,
                    event: SubscriptionEvent::Cancelled,
                });
            }
        });

        let sink = Arc::new(Sink {
            latest: Mutex::new(None),
            registered: AtomicU64::new(0),
            callback: Box::new(callback),
            state: Arc::clone(&state),
            diagnostics: Arc::clone(&core.diagnostics),
        });

        let handler_sink = Arc::clone(&sink);
        let handler_queue = queue.clone();
        let handler: Handler<StoreEvent<S>> = Arc::new(move |event: &StoreEvent<S>| match event {
            StoreEvent::Changed(changes) => {
                let sink = Arc::clone(&handler_sink);
                let changes = changes.clone();
                handler_queue.execute(move || sink.receive(changes, false));
            }
            StoreEvent::Waiter(token) => {
                let token = Arc::clone(token);
                handler_queue.execute(move || drop(token));
            }
        });

        // Registration and the initial read must not straddle a commit
        let initial = {
            let _writer = self.lock_writer_unless_held();
            let initial = core.current.load_full();
            sink.registered.store(initial.version(), Ordering::Release);
            core.emitter.add(Arc::clone(&state), handler);
            initial
        };

        if let Some(logger) = &core.logger {
            logger.did_change_subscription(SubscriptionLog {
                store: core.name().to_string(),
                subscription: id,
                event: SubscriptionEvent::Subscribed,
            });
        }

        if !drops_first {
            let first = initial.dropped_previous();
            queue.execute(move || sink.receive(first, true));
        }

        Ok(Subscription::new(state))
    }

    /// Block until every subscriber has processed every change committed
    /// before this call.
    ///
    /// Must not be called from inside a subscriber callback of this store,
    /// nor from a queue a subscriber delivers on: it would wait on itself.
    pub fn wait_until_all_subscribers_consumed(&self) {
        let latch = Latch::new();
        self.core.emitter.accept(StoreEvent::Waiter(WaitToken::new(Arc::clone(&latch))));
        latch.wait();
    }

    /// `wait_until_all_subscribers_consumed` with a deadline. Returns false on
    /// timeout.
    pub fn wait_until_all_subscribers_consumed_timeout(&self, timeout: Duration) -> bool {
        let latch = Latch::new();
        self.core.emitter.accept(StoreEvent::Waiter(WaitToken::new(Arc::clone(&latch))));
        latch.wait_timeout(timeout)
    }

    /// Tear the store down: cancel every subscription, drop the derived
    /// cache and refuse further commits. Idempotent.
    pub fn invalidate(&self) {
        self.core.invalidate();
    }

    fn ensure_valid(&self) -> StoreResult<()> {
        if self.is_invalidated() {
            return Err(StoreError::Invalidated { store: self.name().to_string() });
        }
        Ok(())
    }

    fn lock_writer_unless_held(&self) -> Option<MutexGuard<'_, ()>> {
        if *self.core.writer_thread.lock() == Some(thread::current().id()) {
            None
        } else {
            Some(self.core.writer.lock())
        }
    }

    /// Look up a live cached derived instance.
    pub(crate) fn cached_derived<T: Any + Send + Sync>(&self, key: &DerivedCacheKey) -> Option<Arc<T>> {
        let cache = self.core.derived_cache.lock();
        cache
            .get(key)
            .and_then(Weak::upgrade)
            .and_then(|any| any.downcast::<T>().ok())
    }

    /// Insert `created` unless another thread won the race, in which case the
    /// live winner is returned instead. Dead entries are swept on the way.
    pub(crate) fn insert_cached_derived<T: Any + Send + Sync>(
        &self,
        key: DerivedCacheKey,
        created: Arc<T>,
    ) -> Arc<T> {
        let mut cache = self.core.derived_cache.lock();
        cache.retain(|_, weak| weak.strong_count() > 0);
        if let Some(existing) = cache
            .get(&key)
            .and_then(Weak::upgrade)
            .and_then(|any| any.downcast::<T>().ok())
        {
            return existing;
        }
        let erased: Arc<dyn Any + Send + Sync> = created.clone();
        cache.insert(key, Arc::downgrade(&erased));
        created
    }

    /// Number of live entries in the derived cache.
    pub fn derived_cache_len(&self) -> usize {
        let mut cache = self.core.derived_cache.lock();
        cache.retain(|_, weak| weak.strong_count() > 0);
        cache.len()
    }
}

impl<S: fmt::Debug> fmt::Debug for Store<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.core.name())
            .field("version", &self.core.current.load().version())
            .finish()
    }
}

fn default_name(location: &Location<'_>) -> String {
    format!("{}:{}", location.file(), location.line())
}

/// Builder for a configured `Store`.
pub struct StoreBuilder<S> {
    initial: S,
    config: StoreConfig,
    logger: Option<Arc<dyn StoreLogger>>,
    sanitizer: Option<Arc<dyn RuntimeSanitizer>>,
    middlewares: Vec<Arc<dyn StoreMiddleware<S>>>,
    location: &'static Location<'static>,
}

impl<S: Clone + Send + Sync + 'static> StoreBuilder<S> {
    /// Use `config` instead of the development preset.
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the store name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = Some(name.into());
        self
    }

    /// Attach a lifecycle logger.
    pub fn logger(mut self, logger: Arc<dyn StoreLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Replace the default `TracingSanitizer`.
    pub fn sanitizer(mut self, sanitizer: Arc<dyn RuntimeSanitizer>) -> Self {
        self.sanitizer = Some(sanitizer);
        self
    }

    /// Register a middleware.
    pub fn middleware(mut self, middleware: impl StoreMiddleware<S>) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Validate the configuration and create the store.
    pub fn build(self) -> StoreResult<Store<S>> {
        self.config
            .validate()
            .map_err(|reason| StoreError::InvalidConfig { reason })?;

        let name = self
            .config
            .name
            .clone()
            .unwrap_or_else(|| default_name(self.location));

        Ok(Store::from_parts(
            self.initial,
            self.config,
            name,
            self.logger,
            self.sanitizer,
            self.middlewares,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::RecordingLogger;
    use crate::queue::{Executor, Job};
    use crate::sanitizer::RecordingSanitizer;
    use crate::transaction::TransactionKey;

    #[derive(Debug, Clone, PartialEq, Default)]
    struct Counter {
        count: u64,
        label: String,
    }

    #[derive(Default)]
    struct ManualExecutor {
        jobs: Mutex<Vec<Job>>,
    }

    impl ManualExecutor {
        fn take(&self) -> Vec<Job> {
            std::mem::take(&mut *self.jobs.lock())
        }
    }

    impl Executor for ManualExecutor {
        fn execute(&self, job: Job) {
            self.jobs.lock().push(job);
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<Changes<Counter>>>>, impl Fn(Changes<Counter>) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        (seen, move |c| s.lock().push(c))
    }

    #[test]
    fn test_commit_bumps_version() {
        let store = Store::new(Counter::default());
        assert_eq!(store.version(), 0);
        store.commit(|s| s.count += 1).unwrap();
        store.commit(|s| s.count += 1).unwrap();
        assert_eq!(store.version(), 2);
        assert_eq!(store.state().count, 2);
        assert_eq!(store.state().previous_value().map(|p| p.count), Some(1));
    }

    #[test]
    fn test_noop_commit_does_not_notify() {
        let store = Store::new(Counter::default());
        let (seen, cb) = recorder();
        let _sub = store.subscribe(TargetQueue::inline(), true, cb).unwrap();

        let read = store.commit(|s| s.count).unwrap();
        assert_eq!(read, 0);
        assert_eq!(store.version(), 0);
        assert!(seen.lock().is_empty());

        store.commit(|s| s.label.push('x')).unwrap();
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(seen.lock()[0].version(), 1);
    }

    #[test]
    fn test_subscribe_delivers_initial_without_previous() {
        let store = Store::new(Counter::default());
        store.commit(|s| s.count = 5).unwrap();

        let (seen, cb) = recorder();
        let _sub = store.subscribe(TargetQueue::inline(), false, cb).unwrap();
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].version(), 1);
        assert!(seen[0].previous().is_none());
        assert_eq!(seen[0].take_if_changed(|s| s.count), Some(5));
    }

    #[test]
    fn test_cancel_stops_delivery() {
        let store = Store::new(Counter::default());
        let (seen, cb) = recorder();
        let sub = store.subscribe(TargetQueue::inline(), true, cb).unwrap();
        store.commit(|s| s.count += 1).unwrap();
        sub.cancel();
        sub.cancel();
        store.commit(|s| s.count += 1).unwrap();
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(store.subscriber_count(), 0);
    }

    #[test]
    fn test_drop_cancels() {
        let store = Store::new(Counter::default());
        let (seen, cb) = recorder();
        drop(store.subscribe(TargetQueue::inline(), true, cb).unwrap());
        store.commit(|s| s.count += 1).unwrap();
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_try_commit_error_leaves_state() {
        #[derive(Debug, PartialEq)]
        enum AppError {
            Rejected,
            Store(StoreError),
        }
        impl From<StoreError> for AppError {
            fn from(e: StoreError) -> Self {
                AppError::Store(e)
            }
        }

        let store = Store::new(Counter::default());
        let result: Result<(), AppError> = store.try_commit(|s| {
            s.count = 99;
            Err(AppError::Rejected)
        });
        assert_eq!(result, Err(AppError::Rejected));
        assert_eq!(store.version(), 0);
        assert_eq!(store.state().count, 0);
    }

    #[test]
    fn test_reentrant_mutation_rejected() {
        let store = Store::new(Counter::default());
        let inner = store.clone();
        let nested = store
            .commit(move |s| {
                s.count = 1;
                inner.commit(|s| s.count = 2)
            })
            .unwrap();
        assert!(matches!(nested, Err(StoreError::ReentrantMutation { .. })));
        assert_eq!(store.state().count, 1);
    }

    #[test]
    fn test_recursive_commit_reported_and_completes() {
        let sanitizer = RecordingSanitizer::new();
        let store = Store::builder(Counter::default())
            .sanitizer(sanitizer.clone())
            .build()
            .unwrap();

        let inner = store.downgrade();
        let versions = Arc::new(Mutex::new(Vec::new()));
        let v = Arc::clone(&versions);
        let _sub = store
            .subscribe(TargetQueue::inline(), true, move |c| {
                v.lock().push(c.version());
                if c.count == 1 {
                    if let Some(store) = inner.upgrade() {
                        store.commit(|s| s.count = 2).unwrap();
                    }
                }
            })
            .unwrap();

        store.commit(|s| s.count = 1).unwrap();
        assert_eq!(store.state().count, 2);
        assert_eq!(*versions.lock(), vec![1, 2]);
        assert!(matches!(sanitizer.errors().as_slice(), [RuntimeError::RecursiveCommit { .. }]));
    }

    #[test]
    fn test_version_inversion_recovered() {
        let sanitizer = RecordingSanitizer::new();
        let store = Store::builder(Counter::default())
            .sanitizer(sanitizer.clone())
            .build()
            .unwrap();
        let manual = Arc::new(ManualExecutor::default());
        let queue = TargetQueue::custom(manual.clone());

        let (seen, cb) = recorder();
        let _sub = store.subscribe(queue, true, cb).unwrap();
        for i in 1..=3 {
            store.commit(|s| s.count = i).unwrap();
        }

        let mut jobs = manual.take();
        assert_eq!(jobs.len(), 3);
        let v3 = jobs.pop().unwrap();
        let v2 = jobs.pop().unwrap();
        let v1 = jobs.pop().unwrap();
        v1();
        v3();
        v2();

        let seen = seen.lock();
        let versions: Vec<u64> = seen.iter().map(|c| c.version()).collect();
        assert_eq!(versions, vec![1, 3, 3]);
        assert_eq!(seen[2].count, 3);
        assert!(seen[2].previous().is_none());
        assert_eq!(
            sanitizer.errors(),
            vec![RuntimeError::RecoveredFromOlderVersion {
                store: store.name().to_string(),
                latest: 3,
                received: 2,
            }]
        );
    }

    #[test]
    fn test_late_subscriber_skips_events_queued_before_it() {
        let sanitizer = RecordingSanitizer::new();
        let store = Store::builder(Counter::default())
            .sanitizer(sanitizer.clone())
            .build()
            .unwrap();

        let (entered_tx, entered_rx) = crossbeam_channel::bounded::<()>(0);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        let (first_seen, first_cb) = recorder();
        let _first = store
            .subscribe(TargetQueue::inline(), true, move |c: Changes<Counter>| {
                let v = c.version();
                first_cb(c);
                if v == 1 {
                    entered_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                }
            })
            .unwrap();

        // This thread drains v1 and stays inside the first subscriber
        let writer = store.clone();
        let drainer = thread::spawn(move || writer.commit(|s| s.count = 1).unwrap());
        entered_rx.recv().unwrap();

        // Queued behind the blocked drain
        store.commit(|s| s.count = 2).unwrap();
        store.commit(|s| s.count = 3).unwrap();

        let (late_seen, late_cb) = recorder();
        let _late = store.subscribe(TargetQueue::inline(), false, late_cb).unwrap();

        release_tx.send(()).unwrap();
        drainer.join().unwrap();

        let late: Vec<u64> = late_seen.lock().iter().map(|c| c.version()).collect();
        assert_eq!(late, vec![3]);
        let first: Vec<u64> = first_seen.lock().iter().map(|c| c.version()).collect();
        assert_eq!(first, vec![1, 2, 3]);
        assert!(sanitizer.errors().is_empty());
    }

    struct LabelMiddleware;

    impl StoreMiddleware<Counter> for LabelMiddleware {
        fn modify(&self, state: &mut Modifying<'_, Counter>) {
            let label = format!("count={}", state.count);
            state.label = label;
        }
    }

    #[test]
    fn test_middleware_runs_only_on_change() {
        let store = Store::builder(Counter::default())
            .middleware(LabelMiddleware)
            .build()
            .unwrap();

        store.commit(|s| s.count = 3).unwrap();
        assert_eq!(store.state().label, "count=3");
        assert_eq!(store.version(), 1);

        store.commit(|s| s.count).unwrap();
        assert_eq!(store.version(), 1);
    }

    #[test]
    fn test_transaction_reaches_subscriber() {
        enum Source {}
        impl TransactionKey for Source {
            type Value = &'static str;
            fn default_value() -> &'static str {
                "unknown"
            }
        }

        let store = Store::new(Counter::default());
        let (seen, cb) = recorder();
        let _sub = store.subscribe(TargetQueue::inline(), true, cb).unwrap();
        store
            .commit(|s| {
                s.count = 1;
                s.set_transaction::<Source>("network");
            })
            .unwrap();
        assert_eq!(seen.lock()[0].transaction().get::<Source>(), "network");
    }

    #[test]
    fn test_wait_until_all_subscribers_consumed() {
        let store = Store::new(Counter::default());
        let queue = TargetQueue::serial_background("tidestore-test-wait").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let _sub = store
            .subscribe(queue, true, move |c| {
                thread::sleep(Duration::from_millis(5));
                s.lock().push(c.version());
            })
            .unwrap();

        for _ in 0..5 {
            store.commit(|s| s.count += 1).unwrap();
        }
        store.wait_until_all_subscribers_consumed();
        assert_eq!(*seen.lock(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_invalidate_cancels_and_rejects() {
        let store = Store::new(Counter::default());
        let (seen, cb) = recorder();
        let sub = store.subscribe(TargetQueue::inline(), true, cb).unwrap();

        store.invalidate();
        assert!(sub.is_cancelled());
        assert!(matches!(store.commit(|s| s.count = 1), Err(StoreError::Invalidated { .. })));
        assert!(store.subscribe(TargetQueue::inline(), true, |_| {}).is_err());
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_dropping_store_cancels_subscriptions() {
        let store = Store::new(Counter::default());
        let sub = store.subscribe(TargetQueue::inline(), true, |_| {}).unwrap();
        drop(store);
        assert!(sub.is_cancelled());
    }

    #[test]
    fn test_concurrent_commits_monotonic() {
        let store = Store::new(Counter::default());
        let versions = Arc::new(Mutex::new(Vec::new()));
        let v = Arc::clone(&versions);
        let _sub = store
            .subscribe(TargetQueue::inline(), true, move |c| v.lock().push(c.version()))
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        store.commit(|s| s.count += 1).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.state().count, 400);
        assert_eq!(store.version(), 400);
        let versions = versions.lock();
        assert_eq!(*versions, (1..=400).collect::<Vec<u64>>());
    }

    #[test]
    fn test_logger_records_commits_and_subscriptions() {
        let logger = RecordingLogger::new();
        let store = Store::builder(Counter::default())
            .name("logged")
            .logger(logger.clone())
            .build()
            .unwrap();

        let sub = store.subscribe(TargetQueue::inline(), true, |_| {}).unwrap();
        store.commit_named("increment", |s| s.count += 1).unwrap();
        drop(sub);

        let commits = logger.commits();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].store, "logged");
        assert_eq!(commits[0].traces[0].name, "increment");
        assert!(commits[0].traces[0].file.ends_with("store.rs"));

        let events: Vec<SubscriptionEvent> = logger.subscriptions().iter().map(|l| l.event).collect();
        assert_eq!(events, vec![SubscriptionEvent::Subscribed, SubscriptionEvent::Cancelled]);
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let result = Store::builder(Counter::default()).name("  ").build();
        assert!(matches!(result, Err(StoreError::InvalidConfig { .. })));
    }

    #[test]
    fn test_background_queue_uses_config_name() {
        let config = StoreConfig::production().with_name("bg");
        let mut config = config;
        config.background_thread_name = "tidestore-test-bg".into();
        let store = Store::builder(Counter::default()).config(config).build().unwrap();
        let queue = store.background_queue().unwrap();
        assert_eq!(queue.id(), store.background_queue().unwrap().id());

        let (tx, rx) = std::sync::mpsc::channel();
        queue.execute(move || {
            tx.send(thread::current().name().map(str::to_string)).unwrap();
        });
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("tidestore-test-bg"));
    }
}
