//! Update markers.
//!
//! A marker changes every time the thing it labels is rewritten. Values come
//! from one process-wide counter, so two markers are only equal when they
//! label the same write (or when neither was ever written).

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_MARKER: AtomicU64 = AtomicU64::new(1);

/// Change stamp for a table, a database, or its indexes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UpdateMarker(u64);

impl UpdateMarker {
    /// Marker of something never written.
    pub const INITIAL: UpdateMarker = UpdateMarker(0);

    /// Draw a fresh marker.
    pub(crate) fn fresh() -> Self {
        UpdateMarker(NEXT_MARKER.fetch_add(1, Ordering::Relaxed))
    }

    /// Replace with a fresh value.
    pub(crate) fn mark_updated(&mut self) {
        *self = Self::fresh();
    }

    /// Raw value.
    pub fn get(self) -> u64 {
        self.0
    }
}
