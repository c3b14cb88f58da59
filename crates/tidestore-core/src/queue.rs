//! Executors and target queues
//!
//! Deciding *where* a subscriber callback runs is separate from deciding
//! *when* a state changed. A `TargetQueue` pairs an `Executor` with a stable
//! `QueueId`; the id takes part in the derived cache key so that the same
//! projection delivered to two different queues is two different instances.
//!
//! Provided executors:
//!
//! - **Inline**: runs the job on the calling thread
//! - **Serial background**: one dedicated named thread fed by a channel
//! - **Main queue**: affine to one bound thread (a UI thread); runs inline
//!   when already on that thread with nothing pending, otherwise enqueues
//!   for the next `drain()`

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::error::{StoreError, StoreResult};

/// A unit of work handed to an executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs somewhere.
pub trait Executor: Send + Sync + 'static {
    /// Schedule `job`. Jobs given to one executor from one thread must run in
    /// the order they were given.
    fn execute(&self, job: Job);
}

/// Runs every job immediately on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, job: Job) {
        job();
    }
}

/// One dedicated thread executing jobs in FIFO order.
///
/// Dropping the executor closes the channel, lets the thread finish what is
/// queued and joins it.
pub struct SerialBackgroundExecutor {
    sender: Mutex<Option<Sender<Job>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
    name: String,
    queue_id: QueueId,
}

impl SerialBackgroundExecutor {
    /// Spawn the worker thread.
    pub fn spawn(name: impl Into<String>) -> StoreResult<Self> {
        let name = name.into();
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();

        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(receiver))
            .map_err(|e| StoreError::Spawn {
                name: name.clone(),
                message: e.to_string(),
            })?;
        let thread_id = thread.thread().id();

        tracing::debug!(thread = %name, "background executor started");

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            thread: Mutex::new(Some(thread)),
            thread_id,
            name,
            queue_id: QueueId::next(),
        })
    }

    /// Process-wide default instance, created on first use.
    pub fn shared() -> StoreResult<Arc<SerialBackgroundExecutor>> {
        static SHARED: Mutex<Option<Arc<SerialBackgroundExecutor>>> = parking_lot::const_mutex(None);

        let mut slot = SHARED.lock();
        if let Some(existing) = slot.as_ref() {
            return Ok(Arc::clone(existing));
        }
        let created = Arc::new(Self::spawn("tidestore-background")?);
        *slot = Some(Arc::clone(&created));
        Ok(created)
    }

    /// Thread name given at spawn.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity of every `TargetQueue` built on this executor.
    pub fn queue_id(&self) -> QueueId {
        self.queue_id
    }

    /// True when called from the worker thread.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Check if the worker thread is still running.
    pub fn is_running(&self) -> bool {
        self.thread.lock().as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Stop accepting jobs, run the queued ones and join the worker.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            // A job may drop the last handle from inside the worker itself
            if self.is_current() {
                return;
            }
            let _ = handle.join();
        }
    }
}

impl Executor for SerialBackgroundExecutor {
    fn execute(&self, job: Job) {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(tx) => {
                if tx.send(job).is_err() {
                    tracing::warn!(thread = %self.name, "background executor is gone, job dropped");
                }
            }
            None => tracing::warn!(thread = %self.name, "job submitted after shutdown, dropped"),
        }
    }
}

impl Drop for SerialBackgroundExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for SerialBackgroundExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialBackgroundExecutor")
            .field("name", &self.name)
            .finish()
    }
}

fn worker_loop(receiver: Receiver<Job>) {
    while let Ok(job) = receiver.recv() {
        job();
    }
}

/// Executor affine to a single bound thread.
///
/// Jobs submitted from the bound thread while nothing is pending run inline.
/// Everything else is queued and runs when the bound thread calls `drain`.
pub struct MainQueue {
    sender: Sender<Job>,
    receiver: Receiver<Job>,
    pending: AtomicUsize,
    bound: ThreadId,
    queue_id: QueueId,
}

impl MainQueue {
    /// Bind a new queue to the calling thread.
    pub fn bind_current() -> Arc<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Arc::new(Self {
            sender,
            receiver,
            pending: AtomicUsize::new(0),
            bound: thread::current().id(),
            queue_id: QueueId::next(),
        })
    }

    /// Identity of every `TargetQueue` built on this queue.
    pub fn queue_id(&self) -> QueueId {
        self.queue_id
    }

    /// True when called from the bound thread.
    pub fn is_bound_thread(&self) -> bool {
        thread::current().id() == self.bound
    }

    /// Number of queued jobs.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Run every queued job. Returns how many ran. Does nothing off the
    /// bound thread.
    pub fn drain(&self) -> usize {
        if !self.is_bound_thread() {
            tracing::warn!("MainQueue::drain called off the bound thread");
            return 0;
        }
        let mut ran = 0;
        while let Ok(job) = self.receiver.try_recv() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            job();
            ran += 1;
        }
        ran
    }

    /// Keep draining until `timeout` passes without new work arriving.
    /// Returns how many jobs ran.
    pub fn drain_for(&self, timeout: Duration) -> usize {
        if !self.is_bound_thread() {
            return 0;
        }
        let mut ran = self.drain();
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return ran;
            }
            match self.receiver.recv_timeout(deadline - now) {
                Ok(job) => {
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                    job();
                    ran += 1 + self.drain();
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return ran,
            }
        }
    }
}

impl Executor for MainQueue {
    fn execute(&self, job: Job) {
        if self.is_bound_thread() && self.pending.load(Ordering::Acquire) == 0 {
            job();
            return;
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        // The receiver lives as long as `self`, so this cannot fail
        let _ = self.sender.send(job);
    }
}

impl fmt::Debug for MainQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MainQueue")
            .field("pending", &self.pending())
            .finish()
    }
}

/// Runs the first job inline, every later job on `inner`.
struct StartsFromCurrentThread {
    started: AtomicBool,
    inner: Arc<dyn Executor>,
}

impl Executor for StartsFromCurrentThread {
    fn execute(&self, job: Job) {
        if !self.started.swap(true, Ordering::AcqRel) {
            job();
        } else {
            self.inner.execute(job);
        }
    }
}

/// Stable identity of a target queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(u64);

impl QueueId {
    const INLINE: QueueId = QueueId(0);
    const SHARED_BACKGROUND: QueueId = QueueId(1);

    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(16);
        QueueId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value, for logs.
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Where subscriber callbacks run.
#[derive(Clone)]
pub struct TargetQueue {
    id: QueueId,
    executor: Arc<dyn Executor>,
}

impl TargetQueue {
    /// Run callbacks on the thread that delivered the change.
    pub fn inline() -> Self {
        Self {
            id: QueueId::INLINE,
            executor: Arc::new(InlineExecutor),
        }
    }

    /// The process-wide serial background thread.
    pub fn background() -> StoreResult<Self> {
        Ok(Self {
            id: QueueId::SHARED_BACKGROUND,
            executor: SerialBackgroundExecutor::shared()?,
        })
    }

    /// A new dedicated serial background thread.
    pub fn serial_background(name: impl Into<String>) -> StoreResult<Self> {
        Ok(Self::serial(&Arc::new(SerialBackgroundExecutor::spawn(name)?)))
    }

    /// Deliver on `executor`. Queues over the same executor share an identity.
    pub fn serial(executor: &Arc<SerialBackgroundExecutor>) -> Self {
        Self {
            id: executor.queue_id(),
            executor: Arc::clone(executor) as Arc<dyn Executor>,
        }
    }

    /// Deliver on the thread bound to `main`. Queues over the same
    /// `MainQueue` share an identity.
    pub fn main(main: &Arc<MainQueue>) -> Self {
        Self {
            id: main.queue_id(),
            executor: Arc::clone(main) as Arc<dyn Executor>,
        }
    }

    /// Wrap any executor. Each call yields a distinct queue identity.
    pub fn custom(executor: Arc<dyn Executor>) -> Self {
        Self { id: QueueId::next(), executor }
    }

    /// First job inline on the calling thread, the rest on `queue`. Useful to
    /// hand a subscriber its initial value synchronously.
    pub fn starts_from_current_thread(queue: TargetQueue) -> Self {
        Self::custom(Arc::new(StartsFromCurrentThread {
            started: AtomicBool::new(false),
            inner: queue.executor,
        }))
    }

    /// Identity used in cache keys.
    pub fn id(&self) -> QueueId {
        self.id
    }

    /// True if this is the inline queue.
    pub fn is_inline(&self) -> bool {
        self.id == QueueId::INLINE
    }

    /// Schedule a job.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        self.executor.execute(Box::new(job));
    }
}

impl Default for TargetQueue {
    fn default() -> Self {
        Self::inline()
    }
}

impl fmt::Debug for TargetQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TargetQueue").field(&self.id.0).finish()
    }
}
