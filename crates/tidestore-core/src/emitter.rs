//! Ordered event fan-out and subscription handles
//!
//! Events are appended to a FIFO and drained by whichever thread finds the
//! emitter idle. A thread that enqueues while another is draining returns
//! immediately; the drainer picks the event up. This keeps delivery order
//! equal to enqueue order even when a handler enqueues more events.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex, ReentrantMutex, RwLock};

pub(crate) type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Entry<E> {
    state: Arc<SubscriptionState>,
    handler: Handler<E>,
}

impl<E> Clone for Entry<E> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            handler: Arc::clone(&self.handler),
        }
    }
}

pub(crate) struct EventEmitter<E> {
    subscribers: RwLock<IndexMap<u64, Entry<E>>>,
    queue: Mutex<VecDeque<E>>,
    draining: AtomicBool,
    next_id: AtomicU64,
}

/// Resets the draining flag even if a handler panics.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<E> EventEmitter<E> {
    pub(crate) fn new() -> Self {
        Self {
            subscribers: RwLock::new(IndexMap::new()),
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn add(&self, state: Arc<SubscriptionState>, handler: Handler<E>) {
        let id = state.id;
        self.subscribers.write().insert(id, Entry { state, handler });
    }

    pub(crate) fn remove(&self, id: u64) -> bool {
        // Dropped after the guard: a handler may own subscriptions to this emitter
        let removed = self.subscribers.write().shift_remove(&id);
        removed.is_some()
    }

    /// Remove every subscriber and return their states.
    pub(crate) fn clear(&self) -> Vec<Arc<SubscriptionState>> {
        let drained = std::mem::take(&mut *self.subscribers.write());
        drained.into_values().map(|e| e.state).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub(crate) fn enqueue(&self, event: E) {
        self.queue.lock().push_back(event);
    }

    /// Deliver queued events until the queue is empty, unless another thread
    /// is already doing so.
    pub(crate) fn drain(&self) {
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            {
                let _guard = DrainGuard(&self.draining);
                loop {
                    let next = self.queue.lock().pop_front();
                    let Some(event) = next else { break };
                    let entries: Vec<Entry<E>> = self.subscribers.read().values().cloned().collect();
                    for entry in entries {
                        if !entry.state.is_cancelled() {
                            (entry.handler)(&event);
                        }
                    }
                }
            }
            // An event may have landed between the last pop and the flag reset
            if self.queue.lock().is_empty() {
                return;
            }
        }
    }

    pub(crate) fn accept(&self, event: E) {
        self.enqueue(event);
        self.drain();
    }
}

/// Shared state behind a `Subscription`.
pub(crate) struct SubscriptionState {
    id: u64,
    cancelled: AtomicBool,
    delivery: ReentrantMutex<()>,
    on_cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl SubscriptionState {
    pub(crate) fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            cancelled: AtomicBool::new(false),
            delivery: ReentrantMutex::new(()),
            on_cancel: Mutex::new(None),
        })
    }

    pub(crate) fn set_on_cancel(&self, f: impl FnOnce() + Send + 'static) {
        *self.on_cancel.lock() = Some(Box::new(f));
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Run `f` unless cancelled. Holds the delivery lock so `cancel` can wait
    /// for an in-flight delivery to finish.
    pub(crate) fn deliver(&self, f: impl FnOnce()) {
        let _guard = self.delivery.lock();
        if self.is_cancelled() {
            return;
        }
        f();
    }

    pub(crate) fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let on_cancel = self.on_cancel.lock().take();
        if let Some(f) = on_cancel {
            f();
        }
        // Wait out a delivery running on another thread; re-entrant on ours
        drop(self.delivery.lock());
    }
}

/// Handle to a live subscription. Dropping it cancels the subscription.
///
/// Cancellation is idempotent and may be called from any thread, including
/// from inside the subscriber's own callback. Once `cancel` returns, the
/// callback will not be invoked again.
#[must_use = "dropping a Subscription cancels it"]
pub struct Subscription {
    state: Arc<SubscriptionState>,
    _retained: Vec<Arc<dyn Any + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new(state: Arc<SubscriptionState>) -> Self {
        Self { state, _retained: Vec::new() }
    }

    /// A subscription that is already cancelled and never delivers.
    pub fn empty() -> Self {
        let state = SubscriptionState::new(0);
        state.cancelled.store(true, Ordering::Release);
        Self { state, _retained: Vec::new() }
    }

    /// Keep `object` alive for as long as this handle.
    pub(crate) fn retaining(mut self, object: Arc<dyn Any + Send + Sync>) -> Self {
        self._retained.push(object);
        self
    }

    /// Stop deliveries.
    pub fn cancel(&self) {
        self.state.cancel();
    }

    /// True once cancelled by any path.
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// Identifier unique within the owning store.
    pub fn id(&self) -> u64 {
        self.state.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.state.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.state.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// One-shot completion signal.
pub(crate) struct Latch {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Latch {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            done: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    fn release(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cv.notify_all();
    }

    pub(crate) fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cv.wait(&mut done);
        }
    }

    /// Returns false on timeout.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock();
        while !*done {
            if self.cv.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }
        true
    }
}

/// Releases its latch when the last clone is dropped.
pub(crate) struct WaitToken {
    latch: Arc<Latch>,
}

impl WaitToken {
    pub(crate) fn new(latch: Arc<Latch>) -> Arc<Self> {
        Arc::new(Self { latch })
    }
}

impl Drop for WaitToken {
    fn drop(&mut self) {
        self.latch.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn subscribe(emitter: &EventEmitter<u32>, log: Arc<Mutex<Vec<u32>>>) -> Arc<SubscriptionState> {
        let state = SubscriptionState::new(emitter.next_id());
        emitter.add(Arc::clone(&state), Arc::new(move |e: &u32| log.lock().push(*e)));
        state
    }

    #[test]
    fn test_accept_delivers_in_order() {
        let emitter = EventEmitter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _s = subscribe(&emitter, Arc::clone(&log));
        for i in 0..5 {
            emitter.accept(i);
        }
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_nested_accept_is_queued_not_recursive() {
        let emitter = Arc::new(EventEmitter::<u32>::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let weak = Arc::downgrade(&emitter);
        let l = Arc::clone(&log);
        let state = SubscriptionState::new(emitter.next_id());
        emitter.add(
            state,
            Arc::new(move |e: &u32| {
                l.lock().push(*e);
                if *e == 1 {
                    if let Some(em) = weak.upgrade() {
                        em.accept(10);
                        // Not delivered yet: the outer drain owns the queue
                        assert_eq!(l.lock().last(), Some(&1));
                    }
                }
            }),
        );
        emitter.enqueue(1);
        emitter.enqueue(2);
        emitter.drain();
        assert_eq!(*log.lock(), vec![1, 2, 10]);
    }

    #[test]
    fn test_cancelled_subscriber_skipped() {
        let emitter = EventEmitter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let state = subscribe(&emitter, Arc::clone(&log));
        emitter.accept(1);
        state.cancel();
        emitter.accept(2);
        assert_eq!(*log.lock(), vec![1]);
    }

    #[test]
    fn test_clear_returns_states() {
        let emitter = EventEmitter::<u32>::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        subscribe(&emitter, Arc::clone(&log));
        subscribe(&emitter, Arc::clone(&log));
        assert_eq!(emitter.len(), 2);
        assert_eq!(emitter.clear().len(), 2);
        assert_eq!(emitter.len(), 0);
    }

    #[test]
    fn test_subscription_cancel_idempotent() {
        let state = SubscriptionState::new(1);
        let calls = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&calls);
        state.set_on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let sub = Subscription::new(state);
        sub.cancel();
        sub.cancel();
        drop(sub);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_inside_delivery_does_not_deadlock() {
        let state = SubscriptionState::new(1);
        let inner = Arc::clone(&state);
        state.deliver(move || inner.cancel());
        assert!(state.is_cancelled());
    }

    #[test]
    fn test_remove_handler_owning_sibling_subscription() {
        let emitter = Arc::new(EventEmitter::<u32>::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let sibling = subscribe(&emitter, Arc::clone(&log));
        let weak = Arc::downgrade(&emitter);
        let sibling_id = sibling.id;
        sibling.set_on_cancel(move || {
            if let Some(em) = weak.upgrade() {
                em.remove(sibling_id);
            }
        });
        let owned = Subscription::new(sibling);

        let outer = SubscriptionState::new(emitter.next_id());
        emitter.add(
            Arc::clone(&outer),
            Arc::new(move |_: &u32| {
                let _ = owned.id();
            }),
        );
        assert_eq!(emitter.len(), 2);

        // Dropping the outer handler cancels the sibling, which removes itself
        assert!(emitter.remove(outer.id));
        assert_eq!(emitter.len(), 0);
    }

    #[test]
    fn test_concurrent_accept_total_order_per_producer() {
        let emitter = Arc::new(EventEmitter::<u32>::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let _s = subscribe(&emitter, Arc::clone(&log));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let em = Arc::clone(&emitter);
                thread::spawn(move || {
                    for i in 0..100 {
                        em.accept(t * 1000 + i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let log = log.lock();
        assert_eq!(log.len(), 400);
        for t in 0..4 {
            let mine: Vec<u32> = log.iter().copied().filter(|v| v / 1000 == t).collect();
            assert!(mine.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_latch_released_by_last_token() {
        let latch = Latch::new();
        let token = WaitToken::new(Arc::clone(&latch));
        let clone = Arc::clone(&token);
        drop(token);
        assert!(!latch.wait_timeout(Duration::from_millis(10)));
        let handle = thread::spawn(move || drop(clone));
        latch.wait();
        handle.join().unwrap();
    }
}
