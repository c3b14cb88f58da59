//! Runtime hazard reporting
//!
//! Ordering inversions and recursive commits are survivable, so they are
//! never returned as errors. They are handed to a `RuntimeSanitizer` instead.

use std::fmt;
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::Mutex;

/// A hazard detected while a store was running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// A subscriber received version `received` after already having seen
    /// `latest`. The latest snapshot was delivered again with its previous
    /// value dropped.
    RecoveredFromOlderVersion {
        /// Store name
        store: String,
        /// Newest version the subscriber had seen
        latest: u64,
        /// Older version that arrived late
        received: u64,
    },

    /// A commit was issued synchronously from inside a subscriber callback of
    /// the same store. It completed, but ordering is not guaranteed for it.
    RecursiveCommit {
        /// Store name
        store: String,
        /// Thread that issued the nested commit
        thread: ThreadId,
    },
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::RecoveredFromOlderVersion { store, latest, received } => write!(
                f,
                "store `{}` delivered version {} after {}; resent latest with previous dropped",
                store, received, latest
            ),
            RuntimeError::RecursiveCommit { store, thread } => write!(
                f,
                "store `{}` committed from inside its own subscriber on {:?}; defer the commit to a queue",
                store, thread
            ),
        }
    }
}

/// Receiver of runtime hazards.
pub trait RuntimeSanitizer: Send + Sync + 'static {
    /// Called once per detected hazard. May run on any thread.
    fn on_runtime_error(&self, error: RuntimeError);
}

/// Logs every hazard with `tracing::warn!`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSanitizer;

impl RuntimeSanitizer for TracingSanitizer {
    fn on_runtime_error(&self, error: RuntimeError) {
        match &error {
            RuntimeError::RecoveredFromOlderVersion { store, latest, received } => {
                tracing::warn!(
                    store = %store,
                    latest = *latest,
                    received = *received,
                    "received older version than latest delivered; commits may be racing across threads"
                );
            }
            RuntimeError::RecursiveCommit { store, thread } => {
                tracing::warn!(
                    store = %store,
                    thread = ?thread,
                    "commit issued from inside a subscriber of the same store"
                );
            }
        }
    }
}

/// Keeps every reported hazard in memory.
#[derive(Debug, Default)]
pub struct RecordingSanitizer {
    errors: Mutex<Vec<RuntimeError>>,
}

impl RecordingSanitizer {
    /// Create an empty recorder.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Everything reported so far.
    pub fn errors(&self) -> Vec<RuntimeError> {
        self.errors.lock().clone()
    }

    /// Take and clear the recorded hazards.
    pub fn take(&self) -> Vec<RuntimeError> {
        std::mem::take(&mut *self.errors.lock())
    }
}

impl RuntimeSanitizer for RecordingSanitizer {
    fn on_runtime_error(&self, error: RuntimeError) {
        self.errors.lock().push(error);
    }
}
