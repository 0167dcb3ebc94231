//! Bounded LRU cache for index blocks (component C7).
//!
//! A lookup moves the hit entry to the most-recently-used end; on miss, a
//! caller-supplied closure computes the value, which is inserted and then
//! evicted from the least-recently-used end once the cache exceeds its
//! capacity. The closure is supplied on every call rather than captured up
//! front so the cache never needs to hold a reference back to its owner
//! (which would create an ownership cycle between the reader and its
//! cache).

use std::collections::HashMap;
use std::collections::VecDeque;
use std::hash::Hash;

pub struct Lru<K, V> {
    capacity: usize,
    map: HashMap<K, V>,
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone, V: Clone> Lru<K, V> {
    pub fn new(capacity: usize) -> Self {
        Lru {
            capacity,
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns the cached value for `key`, computing it with `compute` on a
    /// miss. On a hit, `key` is moved to the most-recently-used end.
    pub fn get_or_compute<F, E>(&mut self, key: K, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        if let Some(v) = self.map.get(&key) {
            let v = v.clone();
            self.touch(&key);
            return Ok(v);
        }
        let value = compute()?;
        self.insert(key, value.clone());
        Ok(value)
    }

    fn touch(&mut self, key: &K) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let k = self.order.remove(pos).unwrap();
            self.order.push_back(k);
        }
    }

    fn insert(&mut self, key: K, value: V) {
        if self.capacity == 0 {
            return;
        }
        self.map.insert(key.clone(), value);
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.map.remove(&evicted);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eviction_order() {
        let mut cache: Lru<i32, i32> = Lru::new(2);
        let miss = |v: i32| -> Result<i32, ()> { Ok(v) };

        cache.get_or_compute(1, || miss(10)).unwrap();
        cache.get_or_compute(2, || miss(20)).unwrap();
        assert_eq!(cache.len(), 2);

        // touch 1, making 2 the least-recently-used
        cache.get_or_compute(1, || miss(999)).unwrap();
        // insert 3, should evict 2, not 1
        cache.get_or_compute(3, || miss(30)).unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.map.contains_key(&1));
        assert!(!cache.map.contains_key(&2));
        assert!(cache.map.contains_key(&3));
    }

    #[test]
    fn recomputes_are_not_cached_when_capacity_zero() {
        let mut cache: Lru<i32, i32> = Lru::new(0);
        let mut calls = 0;
        for _ in 0..3 {
            cache
                .get_or_compute(1, || -> Result<i32, ()> {
                    calls += 1;
                    Ok(42)
                })
                .unwrap();
        }
        assert_eq!(calls, 3);
    }
}
