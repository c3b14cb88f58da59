//! Versioned snapshots handed to subscribers.
//!
//! A `Changes<S>` pairs the current value with at most one previous value, a
//! version number and the provenance of the commit that produced it. The
//! previous value is never chained further back: `make_next` drops the
//! previous of the previous, which bounds memory to two snapshots.

use std::fmt;
use std::ops::Deref;
use std::panic::Location;
use std::sync::Arc;

use crate::comparer::Comparer;
use crate::transaction::Transaction;

/// Where a mutation came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationTrace {
    /// Operation name ("commit" unless given)
    pub name: &'static str,
    /// Source file of the call site
    pub file: &'static str,
    /// Line of the call site
    pub line: u32,
    /// Column of the call site
    pub column: u32,
}

impl MutationTrace {
    /// Capture the caller's location.
    #[track_caller]
    pub fn here(name: &'static str) -> Self {
        Self::from_location(name, Location::caller())
    }

    /// Build a trace from an explicit location.
    pub fn from_location(name: &'static str, location: &'static Location<'static>) -> Self {
        Self {
            name,
            file: location.file(),
            line: location.line(),
            column: location.column(),
        }
    }
}

impl fmt::Display for MutationTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}:{}", self.name, self.file, self.line, self.column)
    }
}

struct ChangesInner<S> {
    previous: Option<Changes<S>>,
    value: Arc<S>,
    version: u64,
    traces: Arc<[MutationTrace]>,
    transaction: Transaction,
}

/// A snapshot of a state value together with its predecessor.
///
/// Cloning is O(1).
pub struct Changes<S> {
    inner: Arc<ChangesInner<S>>,
}

impl<S> Clone for Changes<S> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<S> Changes<S> {
    /// Initial snapshot: version 0, no previous value.
    pub fn new(value: S) -> Self {
        Self::from_parts(None, Arc::new(value), 0, Arc::from(Vec::new()), Transaction::new())
    }

    /// A snapshot whose previous value is `old`; mostly useful in tests of
    /// drop policies.
    pub fn with_previous(old: S, new: S) -> Self {
        let previous = Self::new(old);
        Self::from_parts(Some(previous), Arc::new(new), 0, Arc::from(Vec::new()), Transaction::new())
    }

    fn from_parts(
        previous: Option<Changes<S>>,
        value: Arc<S>,
        version: u64,
        traces: Arc<[MutationTrace]>,
        transaction: Transaction,
    ) -> Self {
        Self {
            inner: Arc::new(ChangesInner { previous, value, version, traces, transaction }),
        }
    }

    /// Version of this snapshot.
    #[inline]
    pub fn version(&self) -> u64 {
        self.inner.version
    }

    /// The current value.
    #[inline]
    pub fn current(&self) -> &S {
        &self.inner.value
    }

    /// The current value as a shared pointer.
    pub fn current_arc(&self) -> Arc<S> {
        Arc::clone(&self.inner.value)
    }

    /// The previous snapshot, if this one still carries it.
    pub fn previous(&self) -> Option<&Changes<S>> {
        self.inner.previous.as_ref()
    }

    /// The previous value, if any.
    pub fn previous_value(&self) -> Option<&S> {
        self.inner.previous.as_ref().map(|p| p.current())
    }

    /// Provenance of the commit that produced this snapshot.
    pub fn traces(&self) -> &[MutationTrace] {
        &self.inner.traces
    }

    /// Context values set during the commit.
    pub fn transaction(&self) -> &Transaction {
        &self.inner.transaction
    }

    /// True if both handles point at the same snapshot.
    pub fn ptr_eq(&self, other: &Changes<S>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Same snapshot without its previous value. Every "changed?" check on
    /// the result reports changed.
    pub fn dropped_previous(&self) -> Changes<S> {
        if self.inner.previous.is_none() {
            return self.clone();
        }
        Self::from_parts(
            None,
            Arc::clone(&self.inner.value),
            self.inner.version,
            Arc::clone(&self.inner.traces),
            self.inner.transaction.clone(),
        )
    }

    /// Build the successor snapshot with `version + 1`.
    pub fn make_next(
        &self,
        next: S,
        traces: Vec<MutationTrace>,
        transaction: Transaction,
    ) -> Changes<S> {
        Self::from_parts(
            Some(self.dropped_previous()),
            Arc::new(next),
            self.inner.version.wrapping_add(1),
            Arc::from(traces),
            transaction,
        )
    }

    /// Project current and previous through `transform`, keeping version,
    /// traces and transaction.
    pub fn map<U>(&self, transform: impl Fn(&S) -> U) -> Changes<U> {
        let previous = self.inner.previous.as_ref().map(|p| {
            Changes::from_parts(
                None,
                Arc::new(transform(p.current())),
                p.version(),
                Arc::clone(&p.inner.traces),
                p.inner.transaction.clone(),
            )
        });
        Changes::from_parts(
            previous,
            Arc::new(transform(self.current())),
            self.inner.version,
            Arc::clone(&self.inner.traces),
            self.inner.transaction.clone(),
        )
    }

    /// True if the selected value differs from the previous one, or if there
    /// is no previous value.
    pub fn has_changes<T: 'static>(&self, select: impl Fn(&S) -> T, comparer: &Comparer<T>) -> bool {
        match self.previous_value() {
            None => true,
            Some(old) => !comparer.equals(&select(old), &select(self.current())),
        }
    }

    /// Inverse of `has_changes`.
    pub fn no_changes<T: 'static>(&self, select: impl Fn(&S) -> T, comparer: &Comparer<T>) -> bool {
        !self.has_changes(select, comparer)
    }

    /// The selected value, if it changed according to `comparer`.
    pub fn take_if_changed_by<T: 'static>(
        &self,
        select: impl Fn(&S) -> T,
        comparer: &Comparer<T>,
    ) -> Option<T> {
        let current = select(self.current());
        match self.previous_value() {
            None => Some(current),
            Some(old) if comparer.equals(&select(old), &current) => None,
            Some(_) => Some(current),
        }
    }

    /// The selected value, if it changed according to `PartialEq`.
    pub fn take_if_changed<T: PartialEq>(&self, select: impl Fn(&S) -> T) -> Option<T> {
        let current = select(self.current());
        match self.previous_value() {
            Some(old) if select(old) == current => None,
            _ => Some(current),
        }
    }

    /// Run `perform` with the selected value if it changed.
    pub fn if_changed<T: PartialEq, R>(
        &self,
        select: impl Fn(&S) -> T,
        perform: impl FnOnce(T) -> R,
    ) -> Option<R> {
        self.take_if_changed(select).map(perform)
    }
}

impl<S> Deref for Changes<S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.current()
    }
}

impl<S: fmt::Debug> fmt::Debug for Changes<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Changes")
            .field("version", &self.inner.version)
            .field("current", &self.inner.value)
            .field("has_previous", &self.inner.previous.is_some())
            .field("traces", &self.inner.traces)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct State {
        count: u32,
        name: String,
    }

    fn state(count: u32, name: &str) -> State {
        State { count, name: name.to_string() }
    }

    #[test]
    fn test_initial_reports_changed() {
        let c = Changes::new(state(1, "a"));
        assert_eq!(c.version(), 0);
        assert!(c.previous().is_none());
        assert_eq!(c.take_if_changed(|s| s.count), Some(1));
    }

    #[test]
    fn test_make_next_keeps_one_level() {
        let c0 = Changes::new(state(0, "a"));
        let c1 = c0.make_next(state(1, "a"), vec![MutationTrace::here("commit")], Transaction::new());
        let c2 = c1.make_next(state(2, "a"), vec![], Transaction::new());

        assert_eq!(c2.version(), 2);
        assert_eq!(c2.previous_value().map(|s| s.count), Some(1));
        assert!(c2.previous().unwrap().previous().is_none());
        assert_eq!(c1.traces().len(), 1);
        assert_eq!(c1.traces()[0].name, "commit");
    }

    #[test]
    fn test_take_if_changed() {
        let c = Changes::with_previous(state(1, "a"), state(1, "b"));
        assert_eq!(c.take_if_changed(|s| s.count), None);
        assert_eq!(c.take_if_changed(|s| s.name.clone()), Some("b".to_string()));
        assert_eq!(c.if_changed(|s| s.name.clone(), |n| n.len()), Some(1));
    }

    #[test]
    fn test_has_changes_with_comparer() {
        let c = Changes::with_previous(state(1, "a"), state(3, "a"));
        let parity = Comparer::<u32>::new(|a, b| a % 2 == b % 2);
        assert!(c.no_changes(|s| s.count, &parity));
        assert!(c.has_changes(|s| s.count, &Comparer::equality()));
        assert_eq!(c.take_if_changed_by(|s| s.count, &parity), None);
    }

    #[test]
    fn test_dropped_previous_always_changed() {
        let c = Changes::with_previous(state(1, "a"), state(1, "a"));
        assert_eq!(c.take_if_changed(|s| s.count), None);
        let dropped = c.dropped_previous();
        assert_eq!(dropped.version(), c.version());
        assert_eq!(dropped.take_if_changed(|s| s.count), Some(1));
    }

    #[test]
    fn test_map_projects_both_sides() {
        let c = Changes::with_previous(state(1, "a"), state(2, "a"));
        let counts = c.map(|s| s.count);
        assert_eq!(*counts.current(), 2);
        assert_eq!(counts.previous_value(), Some(&1));
        assert_eq!(counts.version(), c.version());
    }

    #[test]
    fn test_deref_reads_current() {
        let c = Changes::new(state(4, "x"));
        assert_eq!(c.count, 4);
        assert!(c.ptr_eq(&c.clone()));
    }
}
