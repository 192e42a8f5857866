//! Weighted Window TinyLFU cache.
//!
//! Values live in a `DashMap` that readers consult without touching the
//! policy lock. Admission and eviction bookkeeping is serialized by one
//! mutex per cache and is held only for that bookkeeping. Reads record
//! recency into a small lossy buffer that the next write drains.

use crate::policy::Policy;
use crate::sketch::FrequencySketch;
use crate::weigh::{CapacityPolicy, EstimateSize, ENTRY_OVERHEAD};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Reads buffered between two writes; further reads are not recorded.
const READ_BUFFER_CAPACITY: usize = 128;

/// Sketch width is derived from the budget under the memory policy.
const ASSUMED_ENTRY_BYTES: u64 = 4 * ENTRY_OVERHEAD as u64;

/// Point-in-time view of one cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub policy: CapacityPolicy,
    pub entries: usize,
    pub weighted_size: u64,
    pub capacity: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// A single bounded cache.
pub struct TinyLfuCache<K, V> {
    entries: DashMap<K, Arc<V>>,
    policy: Mutex<Policy<K>>,
    sketch: FrequencySketch,
    read_buffer: Mutex<Vec<K>>,
    hasher: RandomState,
    capacity_policy: CapacityPolicy,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K, V> TinyLfuCache<K, V>
where
    K: Hash + Eq + Clone + EstimateSize,
    V: EstimateSize,
{
    /// Create a cache with the given policy and budget.
    pub fn new(capacity_policy: CapacityPolicy, capacity: u64) -> Self {
        let expected_entries = match capacity_policy {
            CapacityPolicy::Memory => capacity / ASSUMED_ENTRY_BYTES,
            CapacityPolicy::Entries => capacity,
        };
        let expected_entries = usize::try_from(expected_entries).unwrap_or(usize::MAX);

        Self {
            entries: DashMap::new(),
            policy: Mutex::new(Policy::new(capacity)),
            sketch: FrequencySketch::with_capacity(expected_entries),
            read_buffer: Mutex::new(Vec::with_capacity(READ_BUFFER_CAPACITY)),
            hasher: RandomState::new(),
            capacity_policy,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up a value. Never evicts and never waits on the policy lock.
    pub fn get<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
    {
        self.sketch.increment(self.hasher.hash_one(key));

        let Some(value) = self.entries.get(key).map(|v| Arc::clone(v.value())) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        self.hits.fetch_add(1, Ordering::Relaxed);

        if let Some(mut buffer) = self.read_buffer.try_lock() {
            if buffer.len() < READ_BUFFER_CAPACITY {
                buffer.push(key.to_owned());
            }
        }
        Some(value)
    }

    /// Insert or overwrite a value, evicting as needed.
    pub fn insert(&self, key: K, value: Arc<V>) {
        let weight = self.capacity_policy.weigh(&key, value.as_ref());
        let hash = self.hasher.hash_one(&key);
        self.sketch.increment(hash);

        let mut policy = self.policy.lock();
        self.drain_reads(&mut policy);
        self.entries.insert(key.clone(), value);
        let evicted = policy.insert(key, hash, weight, &self.sketch);
        self.discard(evicted);
    }

    /// Drop one entry. Returns its value if it was present.
    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        let mut policy = self.policy.lock();
        policy.remove(key);
        self.entries.remove(key).map(|(_, value)| value)
    }

    /// Change the budget. Shrinking evicts immediately.
    pub fn resize(&self, capacity: u64) {
        let mut policy = self.policy.lock();
        if policy.capacity() == capacity {
            return;
        }
        policy.set_capacity(capacity);
        self.drain_reads(&mut policy);
        let evicted = policy.cleanup(&self.sketch);
        self.discard(evicted);
    }

    /// Run a cleanup pass; returns the number of evicted entries.
    pub fn cleanup(&self) -> usize {
        let mut policy = self.policy.lock();
        self.drain_reads(&mut policy);
        let evicted = policy.cleanup(&self.sketch);
        let count = evicted.len();
        self.discard(evicted);
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the footprint currently exceeds the budget.
    pub fn is_full(&self) -> bool {
        self.policy.lock().is_full()
    }

    pub fn capacity(&self) -> u64 {
        self.policy.lock().capacity()
    }

    pub fn weighted_size(&self) -> u64 {
        self.policy.lock().weighted_size()
    }

    pub fn capacity_policy(&self) -> CapacityPolicy {
        self.capacity_policy
    }

    pub fn stats(&self) -> CacheStats {
        let (weighted_size, capacity, entries) = {
            let policy = self.policy.lock();
            (policy.weighted_size(), policy.capacity(), policy.len())
        };
        CacheStats {
            policy: self.capacity_policy,
            entries,
            weighted_size,
            capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn drain_reads(&self, policy: &mut Policy<K>) {
        let pending = std::mem::take(&mut *self.read_buffer.lock());
        for key in &pending {
            policy.record_access(key);
        }
    }

    fn discard(&self, evicted: Vec<K>) {
        if evicted.is_empty() {
            return;
        }
        for key in &evicted {
            self.entries.remove(key);
        }
        self.evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
    }
}
