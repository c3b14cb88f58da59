//! Commit and subscription lifecycle observer
//!
//! A `StoreLogger` is optional and never needed for correctness. The stock
//! `TracingLogger` forwards every record to `tracing` at debug level.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::changes::MutationTrace;

/// One committed change.
#[derive(Debug, Clone)]
pub struct CommitLog {
    /// Store name
    pub store: String,
    /// Version produced by the commit
    pub version: u64,
    /// Where the commit came from
    pub traces: Vec<MutationTrace>,
    /// Time spent inside the exclusive section
    pub elapsed: Duration,
}

/// What happened to a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// Registered
    Subscribed,
    /// Cancelled explicitly, by drop, or by store teardown
    Cancelled,
}

/// One subscription lifecycle record.
#[derive(Debug, Clone)]
pub struct SubscriptionLog {
    /// Store name
    pub store: String,
    /// Subscription id, unique per store
    pub subscription: u64,
    /// What happened
    pub event: SubscriptionEvent,
}

/// Observer of store activity.
pub trait StoreLogger: Send + Sync + 'static {
    /// A commit produced a new version.
    fn did_commit(&self, log: CommitLog);

    /// A subscription was registered or cancelled.
    fn did_change_subscription(&self, log: SubscriptionLog) {
        let _ = log;
    }
}

/// Forwards records to `tracing::debug!`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl StoreLogger for TracingLogger {
    fn did_commit(&self, log: CommitLog) {
        let trace = log.traces.first().map(|t| t.to_string()).unwrap_or_default();
        tracing::debug!(
            store = %log.store,
            version = log.version,
            took_us = log.elapsed.as_micros() as u64,
            trace = %trace,
            "commit"
        );
    }

    fn did_change_subscription(&self, log: SubscriptionLog) {
        tracing::debug!(
            store = %log.store,
            subscription = log.subscription,
            event = ?log.event,
            "subscription"
        );
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct RecordingLogger {
    commits: Mutex<Vec<CommitLog>>,
    subscriptions: Mutex<Vec<SubscriptionLog>>,
}

impl RecordingLogger {
    /// Create an empty recorder.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Recorded commits.
    pub fn commits(&self) -> Vec<CommitLog> {
        self.commits.lock().clone()
    }

    /// Recorded subscription events.
    pub fn subscriptions(&self) -> Vec<SubscriptionLog> {
        self.subscriptions.lock().clone()
    }
}

impl StoreLogger for RecordingLogger {
    fn did_commit(&self, log: CommitLog) {
        self.commits.lock().push(log);
    }

    fn did_change_subscription(&self, log: SubscriptionLog) {
        self.subscriptions.lock().push(log);
    }
}
