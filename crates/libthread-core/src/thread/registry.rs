//! Bucketed concurrent map used for the TCB table and the context index.
//!
//! Keys choose their own bucket through [`BucketKey`]; each bucket is a
//! `HashMap` behind its own spinlock, so unrelated lookups never contend.
//! The lock covers structure only: values are cheap clones (`Arc`s or ids)
//! whose own fields carry their own locks.

use std::collections::HashMap;
use std::hash::Hash;

use crate::kernel::ContextId;
use crate::sync::SpinLock;

use super::ThreadId;

/// Key that picks its registry bucket.
pub trait BucketKey: Copy + Eq + Hash {
    fn bucket(&self, buckets: usize) -> usize;
}

impl BucketKey for ThreadId {
    fn bucket(&self, buckets: usize) -> usize {
        self.0 as usize % buckets
    }
}

impl BucketKey for ContextId {
    fn bucket(&self, buckets: usize) -> usize {
        (self.0 % buckets as u64) as usize
    }
}

/// Fixed number of buckets, each a spinlocked `HashMap<K, V>`.
pub struct Registry<K, V> {
    buckets: Box<[SpinLock<HashMap<K, V>>]>,
}

impl<K: BucketKey, V: Clone> Registry<K, V> {
    /// # Panics
    /// If `buckets` is zero.
    #[must_use]
    pub fn new(buckets: usize) -> Self {
        assert!(buckets > 0, "registry needs at least one bucket");
        Self {
            buckets: (0..buckets)
                .map(|_| SpinLock::new(HashMap::new()))
                .collect(),
        }
    }

    fn bucket(&self, key: &K) -> &SpinLock<HashMap<K, V>> {
        &self.buckets[key.bucket(self.buckets.len())]
    }

    /// Insert unless the key is present; on conflict the value comes back.
    pub fn insert(&self, key: K, value: V) -> Result<(), V> {
        let mut bucket = self.bucket(&key).lock();
        if bucket.contains_key(&key) {
            return Err(value);
        }
        bucket.insert(key, value);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        self.bucket(key).lock().get(key).cloned()
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.bucket(key).lock().remove(key)
    }

    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.bucket(key).lock().contains_key(key)
    }

    /// Entries across all buckets. Not a consistent snapshot under
    /// concurrent mutation.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn insert_get_remove() {
        let reg: Registry<ThreadId, &str> = Registry::new(4);
        reg.insert(ThreadId(1), "one").unwrap();
        reg.insert(ThreadId(5), "five").unwrap();
        assert_eq!(reg.insert(ThreadId(1), "again"), Err("again"));
        assert_eq!(reg.get(&ThreadId(5)), Some("five"));
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.remove(&ThreadId(1)), Some("one"));
        assert_eq!(reg.remove(&ThreadId(1)), None);
        assert!(!reg.contains(&ThreadId(1)));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn keys_hash_by_modulo() {
        assert_eq!(ThreadId(17).bucket(16), 1);
        assert_eq!(ContextId(33).bucket(16), 1);
        assert_eq!(ThreadId(0).bucket(1), 0);
    }

    #[test]
    fn concurrent_disjoint_inserts() {
        let reg: Arc<Registry<ThreadId, u32>> = Arc::new(Registry::new(16));
        let handles: Vec<_> = (0..8u32)
            .map(|t| {
                let reg = Arc::clone(&reg);
                thread::spawn(move || {
                    for i in 0..100 {
                        let id = t * 100 + i;
                        reg.insert(ThreadId(id), id).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(reg.len(), 800);
        assert_eq!(reg.get(&ThreadId(742)), Some(742));
    }

    #[test]
    #[should_panic(expected = "at least one bucket")]
    fn zero_buckets_panics() {
        let _ = Registry::<ThreadId, u32>::new(0);
    }
}
