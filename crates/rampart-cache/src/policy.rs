//! Window TinyLFU bookkeeping.
//!
//! Tracks which segment each key lives in and its recency, decides
//! admission and picks eviction victims. It never touches values: callers
//! remove the returned keys from their own storage.

use crate::sketch::FrequencySketch;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Share of the budget given to the admission window, in percent.
const WINDOW_PERCENT: u64 = 1;

/// Share of the main space reserved for protected entries, in percent.
const PROTECTED_PERCENT: u64 = 80;

/// `value * percent / 100` without overflow for any `u64` budget.
fn percent_of(value: u64, percent: u64) -> u64 {
    (u128::from(value) * u128::from(percent) / 100) as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Segment {
    Window,
    Probation,
    Protected,
}

#[derive(Debug, Clone, Copy)]
struct Node {
    segment: Segment,
    tick: u64,
    weight: u64,
    hash: u64,
}

/// Segmented LRU state. Each segment maps a monotonically increasing tick
/// to its key, so the first entry is the least recently used one.
pub(crate) struct Policy<K> {
    nodes: HashMap<K, Node>,
    window: BTreeMap<u64, K>,
    probation: BTreeMap<u64, K>,
    protected: BTreeMap<u64, K>,
    window_weight: u64,
    probation_weight: u64,
    protected_weight: u64,
    capacity: u64,
    window_capacity: u64,
    protected_capacity: u64,
    tick: u64,
}

impl<K: Hash + Eq + Clone> Policy<K> {
    pub(crate) fn new(capacity: u64) -> Self {
        let mut policy = Self {
            nodes: HashMap::new(),
            window: BTreeMap::new(),
            probation: BTreeMap::new(),
            protected: BTreeMap::new(),
            window_weight: 0,
            probation_weight: 0,
            protected_weight: 0,
            capacity: 0,
            window_capacity: 0,
            protected_capacity: 0,
            tick: 0,
        };
        policy.set_capacity(capacity);
        policy
    }

    pub(crate) fn capacity(&self) -> u64 {
        self.capacity
    }

    pub(crate) fn set_capacity(&mut self, capacity: u64) {
        self.capacity = capacity;
        self.window_capacity = percent_of(capacity, WINDOW_PERCENT).max(1);
        let main = capacity.saturating_sub(self.window_capacity);
        self.protected_capacity = percent_of(main, PROTECTED_PERCENT);
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn weighted_size(&self) -> u64 {
        self.window_weight + self.probation_weight + self.protected_weight
    }

    pub(crate) fn is_full(&self) -> bool {
        self.weighted_size() > self.capacity
    }

    #[cfg(test)]
    pub(crate) fn segment_of(&self, key: &K) -> Option<Segment> {
        self.nodes.get(key).map(|n| n.segment)
    }

    /// Refresh recency for a key that was read.
    ///
    /// A hit in probation promotes the entry to protected; keys that are no
    /// longer tracked are ignored.
    pub(crate) fn record_access(&mut self, key: &K) {
        let Some(node) = self.nodes.get(key).copied() else {
            return;
        };
        match node.segment {
            Segment::Window => self.move_to(key, Segment::Window),
            Segment::Probation => {
                self.move_to(key, Segment::Protected);
                self.demote_protected_overflow();
            }
            Segment::Protected => self.move_to(key, Segment::Protected),
        }
    }

    /// Insert or overwrite a key, returning every key evicted as a result.
    pub(crate) fn insert(
        &mut self,
        key: K,
        hash: u64,
        weight: u64,
        sketch: &FrequencySketch,
    ) -> Vec<K> {
        if let Some(node) = self.nodes.get_mut(&key) {
            let (segment, old_weight) = (node.segment, node.weight);
            node.weight = weight;
            let total = self.weight_mut(segment);
            *total = *total - old_weight + weight;
            self.record_access(&key);
        } else {
            let tick = self.link(key.clone(), Segment::Window, weight);
            self.nodes.insert(
                key,
                Node {
                    segment: Segment::Window,
                    tick,
                    weight,
                    hash,
                },
            );
        }

        let mut evicted = Vec::new();
        self.evict_window_overflow(sketch, &mut evicted);
        if self.is_full() {
            self.evict_until_within_budget(&mut evicted);
        }
        evicted
    }

    /// Rebalance segments against the current capacity and evict from the
    /// coldest end until the footprint fits.
    pub(crate) fn cleanup(&mut self, sketch: &FrequencySketch) -> Vec<K> {
        let mut evicted = Vec::new();
        self.demote_protected_overflow();
        self.evict_window_overflow(sketch, &mut evicted);
        self.evict_until_within_budget(&mut evicted);
        evicted
    }

    /// Move window overflow into the main space. The window always keeps
    /// its most recent entry.
    fn evict_window_overflow(&mut self, sketch: &FrequencySketch, evicted: &mut Vec<K>) {
        while self.window_weight > self.window_capacity && self.window.len() > 1 {
            let Some(candidate) = self.lru(Segment::Window) else {
                break;
            };
            self.admit(candidate, sketch, evicted);
        }
    }

    /// Let a window candidate compete for room in the main space.
    ///
    /// While the main space cannot take the candidate, it is compared with
    /// the coldest main entry: a strictly higher frequency evicts the
    /// victim, anything else rejects the candidate.
    fn admit(&mut self, candidate: K, sketch: &FrequencySketch, evicted: &mut Vec<K>) {
        let Some(node) = self.nodes.get(&candidate).copied() else {
            return;
        };
        let main_capacity = self.capacity.saturating_sub(self.window_capacity);

        loop {
            let main_weight = self.probation_weight + self.protected_weight;
            if main_weight + node.weight <= main_capacity {
                break;
            }
            let victim = self
                .lru(Segment::Probation)
                .or_else(|| self.lru(Segment::Protected));
            let Some(victim) = victim else {
                // Main space is empty; the budget check that follows decides.
                break;
            };
            let victim_hash = self.nodes.get(&victim).map_or(0, |n| n.hash);

            if sketch.frequency(node.hash) > sketch.frequency(victim_hash) {
                self.remove(&victim);
                evicted.push(victim);
            } else {
                self.remove(&candidate);
                evicted.push(candidate);
                return;
            }
        }

        self.move_to(&candidate, Segment::Probation);
    }

    fn evict_until_within_budget(&mut self, evicted: &mut Vec<K>) {
        while self.is_full() {
            let victim = self
                .lru(Segment::Probation)
                .or_else(|| self.lru(Segment::Window))
                .or_else(|| self.lru(Segment::Protected));
            let Some(victim) = victim else {
                break;
            };
            self.remove(&victim);
            evicted.push(victim);
        }
    }

    fn demote_protected_overflow(&mut self) {
        while self.protected_weight > self.protected_capacity && self.protected.len() > 1 {
            let Some(coldest) = self.lru(Segment::Protected) else {
                break;
            };
            self.move_to(&coldest, Segment::Probation);
        }
    }

    fn lru(&self, segment: Segment) -> Option<K> {
        self.segment(segment)
            .first_key_value()
            .map(|(_, key)| key.clone())
    }

    pub(crate) fn remove(&mut self, key: &K) {
        if let Some(node) = self.nodes.remove(key) {
            self.unlink(node.tick, node.segment, node.weight);
        }
    }

    /// Re-link `key` at the most recent end of `to`.
    fn move_to(&mut self, key: &K, to: Segment) {
        let Some(node) = self.nodes.get(key).copied() else {
            return;
        };
        self.unlink(node.tick, node.segment, node.weight);
        let tick = self.link(key.clone(), to, node.weight);
        if let Some(n) = self.nodes.get_mut(key) {
            n.segment = to;
            n.tick = tick;
        }
    }

    fn link(&mut self, key: K, segment: Segment, weight: u64) -> u64 {
        self.tick += 1;
        let tick = self.tick;
        self.segment_mut(segment).insert(tick, key);
        *self.weight_mut(segment) += weight;
        tick
    }

    fn unlink(&mut self, tick: u64, segment: Segment, weight: u64) {
        self.segment_mut(segment).remove(&tick);
        let total = self.weight_mut(segment);
        *total = total.saturating_sub(weight);
    }

    fn segment(&self, segment: Segment) -> &BTreeMap<u64, K> {
        match segment {
            Segment::Window => &self.window,
            Segment::Probation => &self.probation,
            Segment::Protected => &self.protected,
        }
    }

    fn segment_mut(&mut self, segment: Segment) -> &mut BTreeMap<u64, K> {
        match segment {
            Segment::Window => &mut self.window,
            Segment::Probation => &mut self.probation,
            Segment::Protected => &mut self.protected,
        }
    }

    fn weight_mut(&mut self, segment: Segment) -> &mut u64 {
        match segment {
            Segment::Window => &mut self.window_weight,
            Segment::Probation => &mut self.probation_weight,
            Segment::Protected => &mut self.protected_weight,
        }
    }
}
