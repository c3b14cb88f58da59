//! Copy-on-write values that carry their own change counter.
//!
//! A `Versioned<T>` lets a pipeline reject an input by comparing two integers
//! instead of walking the value. Equality is "same lineage, same version":
//! two wrappers compare equal only when one is an unmodified copy of the
//! other.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_LINEAGE: AtomicU64 = AtomicU64::new(1);

/// A shared value plus a version bumped on every write.
pub struct Versioned<T> {
    value: Arc<T>,
    version: u64,
    lineage: u64,
}

impl<T> Versioned<T> {
    /// Wrap `value` in a fresh lineage at version 0.
    pub fn new(value: T) -> Self {
        Self {
            value: Arc::new(value),
            version: 0,
            lineage: NEXT_LINEAGE.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Current value.
    #[inline]
    pub fn get(&self) -> &T {
        &self.value
    }

    /// Number of writes since creation.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Identity shared by every copy of this wrapper.
    #[inline]
    pub fn lineage(&self) -> u64 {
        self.lineage
    }

    /// Replace the value and bump the version.
    pub fn set(&mut self, value: T) {
        self.value = Arc::new(value);
        self.version += 1;
    }
}

impl<T: Clone> Versioned<T> {
    /// Mutate in place, cloning first if the value is shared, and bump the
    /// version.
    pub fn modify<R>(&mut self, f: impl FnOnce(&mut T) -> R) -> R {
        let out = f(Arc::make_mut(&mut self.value));
        self.version += 1;
        out
    }
}

impl<T> Clone for Versioned<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            version: self.version,
            lineage: self.lineage,
        }
    }
}

impl<T> PartialEq for Versioned<T> {
    fn eq(&self, other: &Self) -> bool {
        self.lineage == other.lineage && self.version == other.version
    }
}

impl<T> Eq for Versioned<T> {}

impl<T> Deref for Versioned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: Default> Default for Versioned<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for Versioned<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Versioned")
            .field("version", &self.version)
            .field("value", &self.value)
            .finish()
    }
}
