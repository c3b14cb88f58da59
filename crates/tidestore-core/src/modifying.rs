//! Write tracking for commit closures.
//!
//! A commit closure receives a `Modifying` view of the state. Reads go through
//! `Deref` and never count as writes. The first mutable access clones the
//! state and flags the commit as modified; a commit that never does so leaves
//! the store untouched and notifies nobody.

use std::fmt;
use std::ops::{Deref, DerefMut};

use crate::transaction::{Transaction, TransactionKey};

enum Slot<'a, S> {
    Borrowed(&'a S),
    Owned(S),
}

/// Mutable view of a store's state for the duration of one commit.
pub struct Modifying<'a, S> {
    state: Slot<'a, S>,
    modified: bool,
    transaction: Transaction,
}

impl<'a, S> Modifying<'a, S> {
    /// Start from a borrowed snapshot. Nothing is cloned until the first write.
    pub fn new(state: &'a S) -> Self {
        Self {
            state: Slot::Borrowed(state),
            modified: false,
            transaction: Transaction::new(),
        }
    }

    /// Start from an owned value already known to be modified.
    pub(crate) fn owned(state: S, transaction: Transaction) -> Self {
        Self {
            state: Slot::Owned(state),
            modified: true,
            transaction,
        }
    }

    /// True once anything wrote through this view.
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Force the commit to count as a change even without a write.
    pub fn mark_modified(&mut self) {
        self.modified = true;
    }

    /// Replace the whole state.
    pub fn replace(&mut self, value: S) {
        self.state = Slot::Owned(value);
        self.modified = true;
    }

    /// Transaction values attached to the resulting `Changes`.
    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    /// Mutable access to the transaction. Does not mark the state modified.
    pub fn transaction_mut(&mut self) -> &mut Transaction {
        &mut self.transaction
    }

    /// Shortcut for `transaction_mut().set::<K>(value)`.
    pub fn set_transaction<K: TransactionKey>(&mut self, value: K::Value) {
        self.transaction.set::<K>(value);
    }
}

impl<S: Clone> Modifying<'_, S> {
    /// Consume the view. Returns the new state only if it was modified.
    pub(crate) fn finish(self) -> (Option<S>, Transaction) {
        if self.modified {
            (Some(self.state.into_owned()), self.transaction)
        } else {
            (None, self.transaction)
        }
    }

    /// Consume the view unconditionally.
    pub(crate) fn into_parts(self) -> (S, Transaction) {
        (self.state.into_owned(), self.transaction)
    }
}

impl<S: Clone> Slot<'_, S> {
    fn to_mut(&mut self) -> &mut S {
        if let Slot::Borrowed(borrowed) = *self {
            *self = Slot::Owned(borrowed.clone());
        }
        match self {
            Slot::Owned(owned) => owned,
            Slot::Borrowed(_) => unreachable!("slot was just made owned"),
        }
    }

    fn into_owned(self) -> S {
        match self {
            Slot::Borrowed(borrowed) => borrowed.clone(),
            Slot::Owned(owned) => owned,
        }
    }
}

impl<S> Deref for Modifying<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        match &self.state {
            Slot::Borrowed(borrowed) => borrowed,
            Slot::Owned(owned) => owned,
        }
    }
}

impl<S: Clone> DerefMut for Modifying<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        self.modified = true;
        self.state.to_mut()
    }
}

impl<S: fmt::Debug> fmt::Debug for Modifying<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Modifying")
            .field("modified", &self.modified)
            .field("state", &**self)
            .finish()
    }
}
