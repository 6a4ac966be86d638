//! Bounded set of recently seen keys
//!
//! Used to drop duplicate gossip (votes, rejected transactions) without
//! letting the set grow forever. When full, the oldest key is evicted.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

/// Default number of keys remembered
pub const DEFAULT_SEEN_CAPACITY: usize = 8192;

#[derive(Debug, Clone)]
pub struct SeenCache<K> {
    capacity: usize,
    keys: HashSet<K>,
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone> SeenCache<K> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            keys: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Record `key`. Returns `true` if it was not already present.
    pub fn insert(&mut self, key: K) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.keys.insert(key);
        true
    }

    pub fn contains(&self, key: &K) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn clear(&mut self) {
        self.keys.clear();
        self.order.clear();
    }
}

impl<K: Eq + Hash + Clone> Default for SeenCache<K> {
    fn default() -> Self {
        Self::new(DEFAULT_SEEN_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_reports_first_sighting() {
        let mut seen = SeenCache::new(4);
        assert!(seen.insert("a"));
        assert!(!seen.insert("a"));
        assert!(seen.contains(&"a"));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn test_oldest_is_evicted() {
        let mut seen = SeenCache::new(2);
        seen.insert(1);
        seen.insert(2);
        seen.insert(3);
        assert!(!seen.contains(&1));
        assert!(seen.contains(&2));
        assert!(seen.contains(&3));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_clear() {
        let mut seen = SeenCache::default();
        seen.insert("x".to_string());
        seen.clear();
        assert!(seen.is_empty());
        assert!(seen.insert("x".to_string()));
    }
}
