use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Entry<V> {
    value: V,
    generation: u64,
}

/// Size- and age-bounded map. The oldest entry is evicted first.
#[derive(Debug)]
pub struct ExpiringCache<K, V> {
    entries: HashMap<K, Entry<V>>,
    // Insertion order; may hold stale keys that were overwritten later.
    order: VecDeque<(K, u64, Instant)>,
    next_generation: u64,
    capacity: usize,
    ttl: Duration,
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            next_generation: 0,
            capacity: capacity.max(1),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&mut self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.prune_expired(Instant::now());
        self.entries.get(key).map(|entry| &entry.value)
    }

    pub fn insert(&mut self, key: K, value: V) {
        let now = Instant::now();
        self.prune_expired(now);

        let generation = self.next_generation;
        self.next_generation += 1;
        self.entries.insert(key.clone(), Entry { value, generation });
        self.order.push_back((key, generation, now));

        while self.entries.len() > self.capacity {
            if !self.evict_oldest() {
                break;
            }
        }
    }

    fn evict_oldest(&mut self) -> bool {
        while let Some((key, generation, _)) = self.order.pop_front() {
            if self.is_current(&key, generation) {
                self.entries.remove(&key);
                return true;
            }
        }
        false
    }

    fn prune_expired(&mut self, now: Instant) {
        while let Some((_, _, inserted_at)) = self.order.front() {
            if now.duration_since(*inserted_at) < self.ttl {
                break;
            }
            let Some((key, generation, _)) = self.order.pop_front() else {
                break;
            };
            if self.is_current(&key, generation) {
                self.entries.remove(&key);
            }
        }
    }

    fn is_current(&self, key: &K, generation: u64) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.generation == generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let mut cache = ExpiringCache::new(2, Duration::from_secs(60));
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("c", 3);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.get(&"b"), Some(&2));
        assert_eq!(cache.get(&"c"), Some(&3));
    }

    #[test]
    fn overwrite_refreshes_position() {
        let mut cache = ExpiringCache::new(2, Duration::from_secs(60));
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("a", 10);
        cache.insert("c", 3);

        assert_eq!(cache.get(&"a"), Some(&10));
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let mut cache = ExpiringCache::new(8, Duration::from_millis(20));
        cache.insert("a", 1);
        assert!(cache.contains(&"a"));

        std::thread::sleep(Duration::from_millis(40));

        assert!(!cache.contains(&"a"));
        assert!(cache.is_empty());
    }
}
