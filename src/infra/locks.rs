//! Keyed mutex table: one lock per key, created on first use

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

/// Lazily populated table of per-key mutexes holding `V`
///
/// The outer `RwLock` only guards the map shape; the per-key `Mutex` serializes
/// all work for one key while other keys proceed in parallel.
pub struct KeyedLocks<K, V> {
    slots: RwLock<FxHashMap<K, Arc<Mutex<V>>>>,
    timeout: Duration,
}

impl<K, V> KeyedLocks<K, V>
where
    K: Eq + Hash + Clone,
    V: Default,
{
    pub fn new(timeout: Duration) -> Self {
        Self { slots: RwLock::new(FxHashMap::default()), timeout }
    }

    /// Slot for `key`, inserting a default value if absent
    pub fn slot(&self, key: &K) -> Arc<Mutex<V>> {
        if let Some(slot) = self.slots.read().get(key) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write();
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    /// Slot for `key` only if it already exists
    pub fn existing(&self, key: &K) -> Option<Arc<Mutex<V>>> {
        self.slots.read().get(key).map(Arc::clone)
    }

    /// Run `f` with the key's value locked, or `None` on timeout
    pub fn with_lock<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let slot = self.slot(key);
        let mut guard = slot.try_lock_for(self.timeout)?;
        Some(f(&mut guard))
    }

    /// Snapshot of current keys
    pub fn keys(&self) -> Vec<K> {
        self.slots.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_same_key_shares_slot() {
        let locks: KeyedLocks<String, u32> = KeyedLocks::new(Duration::from_millis(50));
        locks.with_lock(&"a".to_string(), |v| *v += 1);
        locks.with_lock(&"a".to_string(), |v| *v += 1);
        assert_eq!(locks.with_lock(&"a".to_string(), |v| *v), Some(2));
        assert_eq!(locks.len(), 1);
    }

    #[test]
    fn test_timeout_when_held() {
        let locks: KeyedLocks<String, u32> = KeyedLocks::new(Duration::from_millis(10));
        let slot = locks.slot(&"a".to_string());
        let _guard = slot.lock();
        assert!(locks.with_lock(&"a".to_string(), |v| *v).is_none());
        assert!(locks.with_lock(&"b".to_string(), |v| *v).is_some());
    }

    #[test]
    fn test_parallel_increments() {
        let locks: Arc<KeyedLocks<u8, u64>> = Arc::new(KeyedLocks::new(Duration::from_secs(5)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        locks.with_lock(&1, |v| *v += 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(locks.with_lock(&1, |v| *v), Some(8000));
    }
}
