use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Bounded, insertion-ordered map. Decoupled from disk files: callers that
/// need to reclaim resources for evicted keys get the evicted key list back
/// from `insert` and act on it themselves.
///
/// Eviction policy: when an insertion would push `len() > capacity`, evict
/// the oldest `max(ceil(capacity * evict_pct / 100), len() - capacity)`
/// entries in insertion order. The `max(...)` half of that formula only
/// matters at `capacity == 0`, where `ceil(0 * pct / 100)` is always zero but
/// the invariant `len() <= capacity` still has to hold — see
/// `tests::capacity_zero_evicts_everything`.
pub struct CacheIndex<V> {
    capacity: usize,
    evict_pct: u8,
    inner: Mutex<Inner<V>>,
}

struct Inner<V> {
    map: HashMap<String, V>,
    order: VecDeque<String>,
}

impl<V: Clone> CacheIndex<V> {
    pub fn new(capacity: usize, evict_pct: u8) -> Self {
        Self {
            capacity,
            evict_pct,
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.inner.lock().unwrap().map.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().unwrap().map.contains_key(key)
    }

    /// Inserts or updates `key`. Returns the list of keys evicted as a side
    /// effect (empty unless this insertion is the one that crosses
    /// capacity). Updating an existing key preserves its insertion-order
    /// position and never evicts.
    pub fn insert(&self, key: String, value: V) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap();
        if inner.map.contains_key(&key) {
            inner.map.insert(key, value);
            return Vec::new();
        }

        inner.order.push_back(key.clone());
        inner.map.insert(key, value);

        let len = inner.map.len();
        if len <= self.capacity {
            return Vec::new();
        }

        let pct_count = div_ceil(self.capacity as u64 * self.evict_pct as u64, 100) as usize;
        let overflow = len - self.capacity;
        let evict_count = pct_count.max(overflow).min(len);

        let mut evicted = Vec::with_capacity(evict_count);
        for _ in 0..evict_count {
            if let Some(k) = inner.order.pop_front() {
                inner.map.remove(&k);
                evicted.push(k);
            }
        }
        evicted
    }

    /// Removes `key` if present. No-op if absent.
    pub fn remove(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner.map.remove(key);
        if removed.is_some() {
            inner.order.retain(|k| k != key);
        }
        removed
    }
}

fn div_ceil(a: u64, b: u64) -> u64 {
    if b == 0 {
        0
    } else {
        (a + b - 1) / b
    }
}
