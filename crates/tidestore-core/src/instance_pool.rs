//! Keyed instance reuse.
//!
//! `InstancePool::map` turns a list of keys into a list of instances,
//! building only the ones it has not seen before.

use std::hash::Hash;

use hashbrown::HashMap;
use parking_lot::Mutex;

/// Cache of instances keyed by `K`.
pub struct InstancePool<K, V> {
    instances: Mutex<HashMap<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> InstancePool<K, V> {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self { instances: Mutex::new(HashMap::new()) }
    }

    /// One instance per key, in key order. Missing instances are built with
    /// `make_new`. With `sweeps_unused`, keys not in `keys` are evicted.
    pub fn map<I>(&self, keys: I, sweeps_unused: bool, mut make_new: impl FnMut(&K) -> V) -> Vec<V>
    where
        I: IntoIterator<Item = K>,
    {
        let mut instances = self.instances.lock();
        let keys: Vec<K> = keys.into_iter().collect();

        let out: Vec<V> = keys
            .iter()
            .map(|key| {
                instances
                    .entry(key.clone())
                    .or_insert_with(|| make_new(key))
                    .clone()
            })
            .collect();

        if sweeps_unused {
            let wanted: hashbrown::HashSet<&K> = keys.iter().collect();
            instances.retain(|k, _| wanted.contains(k));
        }
        out
    }

    /// Instance for `key`, if pooled.
    pub fn get(&self, key: &K) -> Option<V> {
        self.instances.lock().get(key).cloned()
    }

    /// Number of pooled instances.
    pub fn len(&self) -> usize {
        self.instances.lock().len()
    }

    /// True when nothing is pooled.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every pooled instance.
    pub fn clear(&self) {
        self.instances.lock().clear();
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Default for InstancePool<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
