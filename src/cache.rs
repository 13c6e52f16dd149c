//! Bounded LRU maps for decoded on-disk records.
//!
//! The image is read-only, so cached values can never go stale; eviction
//! only costs a re-read. Lookup recency is tracked with a monotonic tick,
//! and eviction scans for the smallest tick, which is plenty for the small
//! capacities used here.

use core::hash::Hash;

use hashbrown::HashMap;

pub(crate) struct LruCache<K, V> {
    map: HashMap<K, (u64, V)>,
    capacity: usize,
    tick: u64,
}

impl<K: Eq + Hash + Copy, V: Clone> LruCache<K, V> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::with_capacity(capacity.min(64)),
            capacity,
            tick: 0,
        }
    }

    pub(crate) fn get(&mut self, key: &K) -> Option<V> {
        self.tick += 1;
        let tick = self.tick;
        self.map.get_mut(key).map(|slot| {
            slot.0 = tick;
            slot.1.clone()
        })
    }

    pub(crate) fn insert(&mut self, key: K, value: V) {
        self.tick += 1;
        if self.map.len() >= self.capacity && !self.map.contains_key(&key) {
            if let Some(oldest) = self
                .map
                .iter()
                .min_by_key(|(_, (tick, _))| *tick)
                .map(|(k, _)| *k)
            {
                self.map.remove(&oldest);
            }
        }
        self.map.insert(key, (self.tick, value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = LruCache::new(2);
        cache.insert(1u32, "one");
        cache.insert(2, "two");

        assert_eq!(cache.get(&1), Some("one"));

        cache.insert(3, "three");
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&1), Some("one"));
        assert_eq!(cache.get(&3), Some("three"));
    }

    #[test]
    fn reinsert_replaces_without_eviction() {
        let mut cache = LruCache::new(2);
        cache.insert(1u32, "one");
        cache.insert(2, "two");
        cache.insert(2, "deux");

        assert_eq!(cache.get(&1), Some("one"));
        assert_eq!(cache.get(&2), Some("deux"));
    }
}
