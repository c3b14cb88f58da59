//! Tidestore Core: Versioned State Store with Memoized Projections
//!
//! An in-process state container that keeps the current and previous value
//! of an application state, serializes every mutation and notifies
//! subscribers in strict version order.
//!
//! # Architecture
//!
//! - **Store**: one exclusive section per commit, lock-free snapshot reads
//! - **Changes**: current value, one previous value, version, provenance
//! - **Pipeline / Derived**: memoized projections that notify only when
//!   their output changed, shared through a weak per-store cache
//! - **TargetQueue**: where callbacks run (inline, background, UI thread)
//!
//! # No Entity Model Here
//!
//! This crate knows nothing about tables or indexes. The normalized entity
//! database lives in a separate crate (tidestore-orm) built on top of it.

pub mod changes;
pub mod comparer;
pub mod config;
pub mod derived;
pub mod emitter;
pub mod error;
pub mod instance_pool;
pub mod logger;
pub mod modifying;
pub mod pipeline;
pub mod queue;
pub mod sanitizer;
pub mod store;
pub mod transaction;
pub mod versioned;

// Re-export key types for convenience
pub use changes::{Changes, MutationTrace};
pub use comparer::Comparer;
pub use config::StoreConfig;
pub use derived::{BindingDerived, Derived};
pub use emitter::Subscription;
pub use error::{StoreError, StoreResult};
pub use instance_pool::InstancePool;
pub use logger::{CommitLog, RecordingLogger, StoreLogger, SubscriptionEvent, SubscriptionLog, TracingLogger};
pub use modifying::Modifying;
pub use pipeline::{ContinuousResult, Pipeline, PipelineExt, PipelineKey, Pipelines};
pub use queue::{Executor, InlineExecutor, Job, MainQueue, QueueId, SerialBackgroundExecutor, TargetQueue};
pub use sanitizer::{RecordingSanitizer, RuntimeError, RuntimeSanitizer, TracingSanitizer};
pub use store::{Store, StoreBuilder, StoreMiddleware, WeakStore};
pub use transaction::{BindingOrigin, DerivedFromUpstream, Transaction, TransactionKey};
pub use versioned::Versioned;
