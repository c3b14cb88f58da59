//! Equality predicates used by drop policies.
//!
//! A `Comparer` answers "are these two values the same for my purposes?".
//! Returning `true` means the new value is dropped as a duplicate.

use std::fmt;
use std::sync::Arc;

/// A shareable equality predicate over `T`.
pub struct Comparer<T: ?Sized> {
    equals: Arc<dyn Fn(&T, &T) -> bool + Send + Sync>,
}

impl<T: ?Sized> Clone for Comparer<T> {
    fn clone(&self) -> Self {
        Self { equals: Arc::clone(&self.equals) }
    }
}

impl<T: ?Sized> fmt::Debug for Comparer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Comparer").finish_non_exhaustive()
    }
}

impl<T: ?Sized + 'static> Comparer<T> {
    /// Create a comparer from a closure returning `true` when both inputs are equal.
    pub fn new(equals: impl Fn(&T, &T) -> bool + Send + Sync + 'static) -> Self {
        Self { equals: Arc::new(equals) }
    }

    /// A comparer that never considers two values equal.
    pub fn always_false() -> Self {
        Self::new(|_, _| false)
    }

    /// Compares the keys produced by `select`.
    pub fn by_key<K: PartialEq>(select: impl Fn(&T) -> K + Send + Sync + 'static) -> Self {
        Self::new(move |a, b| select(a) == select(b))
    }

    /// Compares the keys produced by `select` with another comparer.
    pub fn by_key_with<K: 'static>(
        select: impl Fn(&T) -> K + Send + Sync + 'static,
        comparer: Comparer<K>,
    ) -> Self {
        Self::new(move |a, b| comparer.equals(&select(a), &select(b)))
    }

    /// Equal only if every comparer says equal.
    pub fn all_of(comparers: Vec<Comparer<T>>) -> Self {
        Self::new(move |a, b| comparers.iter().all(|c| c.equals(a, b)))
    }

    /// Equal if any comparer says equal. Evaluated in order, so put the
    /// cheapest check first.
    pub fn any_of(comparers: Vec<Comparer<T>>) -> Self {
        Self::new(move |a, b| comparers.iter().any(|c| c.equals(a, b)))
    }

    /// Combine with `other`, both must agree.
    pub fn and(self, other: Comparer<T>) -> Self {
        Self::all_of(vec![self, other])
    }

    /// Combine with `other`, either suffices.
    pub fn or(self, other: Comparer<T>) -> Self {
        Self::any_of(vec![self, other])
    }

    /// Evaluate the predicate.
    #[inline]
    pub fn equals(&self, lhs: &T, rhs: &T) -> bool {
        (self.equals)(lhs, rhs)
    }
}

impl<T: PartialEq + ?Sized + 'static> Comparer<T> {
    /// Compares with `PartialEq`.
    pub fn equality() -> Self {
        Self::new(|a, b| a == b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(PartialEq)]
    struct User {
        id: u32,
        name: &'static str,
    }

    #[test]
    fn test_equality() {
        let c = Comparer::<u32>::equality();
        assert!(c.equals(&1, &1));
        assert!(!c.equals(&1, &2));
    }

    #[test]
    fn test_always_false() {
        let c = Comparer::<u32>::always_false();
        assert!(!c.equals(&1, &1));
    }

    #[test]
    fn test_by_key() {
        let c = Comparer::<User>::by_key(|u| u.id);
        let a = User { id: 1, name: "a" };
        let b = User { id: 1, name: "b" };
        assert!(c.equals(&a, &b));
        assert!(!Comparer::<User>::equality().equals(&a, &b));
    }

    #[test]
    fn test_any_of_short_circuits_in_order() {
        let c = Comparer::<u32>::any_of(vec![
            Comparer::new(|a, _| *a == 0),
            Comparer::new(|_, _| panic!("must not be evaluated")),
        ]);
        assert!(c.equals(&0, &5));
    }

    #[test]
    fn test_and_or() {
        let even = Comparer::<u32>::new(|a, b| a % 2 == b % 2);
        let small = Comparer::<u32>::new(|a, b| (*a < 10) == (*b < 10));
        assert!(even.clone().and(small.clone()).equals(&2, &4));
        assert!(!even.clone().and(small.clone()).equals(&2, &12));
        assert!(even.or(small).equals(&2, &12));
    }
}
