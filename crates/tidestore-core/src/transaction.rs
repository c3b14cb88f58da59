//! Per-commit context values.
//!
//! A `Transaction` travels with every commit and ends up on the resulting
//! `Changes`. It lets a commit say *why* a value changed, which matters when
//! the same value change means different things (for example a write coming
//! back from a binding versus a fresh upstream update).

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use hashbrown::HashMap;

/// A type-based key for transaction values.
///
/// ```
/// use tidestore_core::{Transaction, TransactionKey};
///
/// enum RequestId {}
///
/// impl TransactionKey for RequestId {
///     type Value = Option<u64>;
///     fn default_value() -> Option<u64> { None }
/// }
///
/// let mut tx = Transaction::new();
/// assert_eq!(tx.get::<RequestId>(), None);
/// tx.set::<RequestId>(Some(7));
/// assert_eq!(tx.get::<RequestId>(), Some(7));
/// ```
pub trait TransactionKey: 'static {
    /// Stored value type
    type Value: Clone + Send + Sync + 'static;

    /// Value returned when the key was never set
    fn default_value() -> Self::Value;
}

/// Value storage for a single commit.
#[derive(Clone, Default)]
pub struct Transaction {
    values: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Transaction {
    /// Create an empty transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the value stored for `K`, or its default.
    pub fn get<K: TransactionKey>(&self) -> K::Value {
        self.values
            .get(&TypeId::of::<K>())
            .and_then(|value| value.downcast_ref::<K::Value>())
            .cloned()
            .unwrap_or_else(K::default_value)
    }

    /// Store a value for `K`.
    pub fn set<K: TransactionKey>(&mut self, value: K::Value) {
        self.values.insert(TypeId::of::<K>(), Arc::new(value));
    }

    /// Builder-style `set`.
    pub fn with<K: TransactionKey>(mut self, value: K::Value) -> Self {
        self.set::<K>(value);
        self
    }

    /// True if no key was ever set.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("keys", &self.values.len())
            .finish()
    }
}

/// Set on commits a Derived makes to itself after projecting an upstream change.
pub enum DerivedFromUpstream {}

impl TransactionKey for DerivedFromUpstream {
    type Value = bool;
    fn default_value() -> bool { false }
}

/// Identifies the binding derived that originated a write, so its own
/// pipeline can skip the echo of that write.
pub enum BindingOrigin {}

impl TransactionKey for BindingOrigin {
    type Value = Option<u64>;
    fn default_value() -> Option<u64> { None }
}
