//! Bounded caches used to coalesce repeated notifications

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::{Duration, Instant};

/// A map that holds at most `max_items` entries, evicting the oldest insert
/// first. Re-adding a key refreshes its value and moves it to the back.
#[derive(Debug)]
pub struct BoundedCache<K, V> {
    max_items: usize,
    entries: HashMap<K, V>,
    order: VecDeque<K>,
}

impl<K: Hash + Eq + Clone, V> BoundedCache<K, V> {
    pub fn new(max_items: usize) -> Self {
        Self {
            max_items: max_items.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn add(&mut self, key: K, value: V) {
        if self.entries.insert(key.clone(), value).is_some() {
            self.order.retain(|existing| existing != &key);
        } else {
            while self.entries.len() > self.max_items {
                let Some(oldest) = self.order.pop_front() else {
                    break;
                };
                self.entries.remove(&oldest);
            }
        }
        self.order.push_back(key);
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let value = self.entries.remove(key)?;
        self.order.retain(|existing| existing != key);
        Some(value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_items(&self) -> usize {
        self.max_items
    }

    /// Keys from oldest to newest
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.order.iter()
    }
}

/// Lets a key through once per `interval`.
///
/// The window is measured from the first timestamp recorded for the key, so a
/// burst of occurrences inside the window doesn't keep pushing it forward. Once
/// the window has elapsed the next occurrence passes and opens a new window.
#[derive(Debug)]
pub struct DebounceCache<K> {
    interval: Duration,
    first_seen: BoundedCache<K, Instant>,
}

impl<K: Hash + Eq + Clone> DebounceCache<K> {
    pub fn new(interval: Duration, max_items: usize) -> Self {
        Self {
            interval,
            first_seen: BoundedCache::new(max_items),
        }
    }

    pub fn debounce(&mut self, key: K) -> bool {
        self.debounce_at(key, Instant::now())
    }

    /// Returns true if `key` should be let through at `now`.
    pub fn debounce_at(&mut self, key: K, now: Instant) -> bool {
        if let Some(first) = self.first_seen.get(&key) {
            if now.saturating_duration_since(*first) < self.interval {
                return false;
            }
        }
        self.first_seen.add(key, now);
        true
    }

    /// Forget `key` so its next occurrence passes immediately
    pub fn forget(&mut self, key: &K) {
        self.first_seen.remove(key);
    }

    pub fn clear(&mut self) {
        self.first_seen.clear();
    }

    pub fn len(&self) -> usize {
        self.first_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.first_seen.is_empty()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::TypeId;

    fn secs(value: f64) -> Duration {
        Duration::from_secs_f64(value)
    }

    #[test]
    fn test_window_is_measured_from_first_occurrence() {
        let mut cache = DebounceCache::new(secs(5.0), 10);
        let t0 = Instant::now();

        assert!(cache.debounce_at("disk full", t0));
        assert!(!cache.debounce_at("disk full", t0 + secs(4.99999)));
        assert!(cache.debounce_at("disk full", t0 + secs(5.000002)));
        // The window re-opened at 5.000002 and is not extended by repeats
        assert!(!cache.debounce_at("disk full", t0 + secs(6.0)));
        assert!(!cache.debounce_at("disk full", t0 + secs(10.0)));
        assert!(cache.debounce_at("disk full", t0 + secs(10.000003)));
    }

    #[test]
    fn test_keys_are_independent() {
        let mut cache = DebounceCache::new(secs(5.0), 10);
        let t0 = Instant::now();

        assert!(cache.debounce_at("a", t0));
        assert!(cache.debounce_at("b", t0 + secs(1.0)));
        assert!(!cache.debounce_at("a", t0 + secs(1.0)));
        assert!(!cache.debounce_at("b", t0 + secs(2.0)));
    }

    #[test]
    fn test_same_named_types_are_distinct_keys() {
        mod first {
            pub struct Boom;
        }
        mod second {
            pub struct Boom;
        }

        let mut cache = DebounceCache::new(secs(5.0), 10);
        let t0 = Instant::now();

        let first_key = ("tag", TypeId::of::<first::Boom>());
        let second_key = ("tag", TypeId::of::<second::Boom>());

        assert!(cache.debounce_at(first_key, t0));
        assert!(cache.debounce_at(second_key, t0));
        assert!(!cache.debounce_at(first_key, t0 + secs(1.0)));
        assert!(!cache.debounce_at(second_key, t0 + secs(1.0)));
    }

    #[test]
    fn test_forget_lets_next_occurrence_through() {
        let mut cache = DebounceCache::new(secs(5.0), 10);
        let t0 = Instant::now();

        assert!(cache.debounce_at("k", t0));
        cache.forget(&"k");
        assert!(cache.debounce_at("k", t0 + secs(0.1)));
    }

    #[test]
    fn test_bounded_cache_evicts_oldest() {
        let mut cache = BoundedCache::new(10);
        for i in 0..60 {
            cache.add(i, i * 2);
            assert!(cache.len() <= 10);
        }

        assert_eq!(cache.len(), 10);
        assert!(!cache.contains(&49));
        assert!(cache.contains(&50));
        assert_eq!(cache.get(&59), Some(&118));
        assert_eq!(cache.keys().copied().collect::<Vec<_>>(), (50..60).collect::<Vec<_>>());
    }

    #[test]
    fn test_bounded_cache_readd_moves_to_back() {
        let mut cache = BoundedCache::new(3);
        cache.add("a", 1);
        cache.add("b", 2);
        cache.add("c", 3);
        cache.add("a", 10);
        cache.add("d", 4);

        // "b" was the oldest after "a" was refreshed
        assert!(!cache.contains(&"b"));
        assert_eq!(cache.get(&"a"), Some(&10));
        assert_eq!(cache.keys().copied().collect::<Vec<_>>(), vec!["c", "a", "d"]);
    }

    #[test]
    fn test_debounce_cache_is_bounded() {
        let mut cache = DebounceCache::new(secs(5.0), 10);
        let t0 = Instant::now();
        for i in 0..60 {
            assert!(cache.debounce_at(i, t0));
        }
        assert_eq!(cache.len(), 10);
        // Evicted keys pass again
        assert!(cache.debounce_at(0, t0 + secs(0.5)));
    }
}
