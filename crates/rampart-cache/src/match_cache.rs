//! Per-plugin match cache.
//!
//! Maps `(plugin name, request path)` to the selector matched for that
//! path. Every plugin gets its own [`TinyLfuCache`], created on first write
//! and sized by the budget passed with each `put`.
//!
//! Every `invalidate` and `clear` advances an epoch. A caller that resolved
//! a value from the backing store passes the epoch it read beforehand to
//! [`MatchCache::put_if_epoch`], so a lookup that raced an invalidation
//! cannot write stale data back.

use crate::tinylfu::{CacheStats, TinyLfuCache};
use crate::weigh::{CapacityPolicy, EstimateSize};
use dashmap::DashMap;
use rampart_telemetry::events;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Selector cache keyed by plugin name, then request path.
pub struct MatchCache<V> {
    caches: DashMap<String, Arc<TinyLfuCache<String, V>>>,
    policy: CapacityPolicy,
    epoch: AtomicU64,
}

impl<V: EstimateSize> MatchCache<V> {
    /// Create an empty cache. Every per-plugin cache uses `policy`.
    pub fn new(policy: CapacityPolicy) -> Self {
        Self {
            caches: DashMap::new(),
            policy,
            epoch: AtomicU64::new(0),
        }
    }

    /// Look up the cached value for `path` under `plugin`.
    pub fn get(&self, plugin: &str, path: &str) -> Option<Arc<V>> {
        let cache = self.caches.get(plugin).map(|c| Arc::clone(c.value()))?;
        cache.get(path)
    }

    /// Insert or overwrite an entry.
    ///
    /// `budget` is bytes under the memory policy, entries otherwise. A
    /// budget different from the one the plugin's cache was last sized with
    /// resizes it before the insert.
    pub fn put(&self, plugin: &str, path: &str, value: Arc<V>, budget: u64) {
        self.sized_cache(plugin, budget)
            .insert(path.to_string(), value);
    }

    /// Current invalidation epoch. Read it before consulting the backing
    /// store and hand it to [`put_if_epoch`](Self::put_if_epoch).
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Like [`put`](Self::put), but only while no `invalidate` or `clear`
    /// happened since `epoch` was read. Returns whether the entry was kept.
    pub fn put_if_epoch(&self, plugin: &str, path: &str, value: Arc<V>, budget: u64, epoch: u64) -> bool {
        if self.epoch() != epoch {
            return false;
        }
        let cache = self.sized_cache(plugin, budget);
        let key = path.to_string();
        cache.insert(key.clone(), value);
        // An invalidation may have run between the check and the insert.
        if self.epoch() != epoch {
            cache.remove(&key);
            return false;
        }
        true
    }

    /// Drop the cache of one plugin. Returns whether it existed.
    pub fn invalidate(&self, plugin: &str) -> bool {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let removed = self.caches.remove(plugin).is_some();
        if removed {
            tracing::debug!(
                event = events::MATCH_CACHE_INVALIDATED,
                plugin = %plugin,
                "match cache invalidated"
            );
        }
        removed
    }

    /// Drop every per-plugin cache.
    pub fn clear(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.caches.clear();
        tracing::debug!(event = events::MATCH_CACHE_CLEARED, "match cache cleared");
    }

    /// Force a cleanup pass on one plugin's cache.
    pub fn cleanup(&self, plugin: &str) -> usize {
        self.caches
            .get(plugin)
            .map(|c| Arc::clone(c.value()))
            .map_or(0, |cache| cache.cleanup())
    }

    pub fn stats(&self, plugin: &str) -> Option<CacheStats> {
        self.caches
            .get(plugin)
            .map(|c| Arc::clone(c.value()))
            .map(|cache| cache.stats())
    }

    /// Number of cached paths for one plugin.
    pub fn len(&self, plugin: &str) -> usize {
        self.caches.get(plugin).map_or(0, |c| c.len())
    }

    /// Names of plugins that currently have a cache.
    pub fn plugins(&self) -> Vec<String> {
        self.caches.iter().map(|e| e.key().clone()).collect()
    }

    pub fn policy(&self) -> CapacityPolicy {
        self.policy
    }

    fn sized_cache(&self, plugin: &str, budget: u64) -> Arc<TinyLfuCache<String, V>> {
        let cache = self.plugin_cache(plugin, budget);
        if cache.capacity() != budget {
            tracing::debug!(plugin = %plugin, budget = budget, "resizing match cache");
            cache.resize(budget);
        }
        cache
    }

    fn plugin_cache(&self, plugin: &str, budget: u64) -> Arc<TinyLfuCache<String, V>> {
        if let Some(cache) = self.caches.get(plugin) {
            return Arc::clone(cache.value());
        }
        let cache = self
            .caches
            .entry(plugin.to_string())
            .or_insert_with(|| Arc::new(TinyLfuCache::new(self.policy, budget)));
        Arc::clone(cache.value())
    }
}

impl<V: EstimateSize> Default for MatchCache<V> {
    fn default() -> Self {
        Self::new(CapacityPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector(id: &str) -> Arc<String> {
        Arc::new(format!("selector-{id}"))
    }

    #[test]
    fn test_get_after_put() {
        let cache = MatchCache::new(CapacityPolicy::Memory);
        cache.put("auth", "/a", selector("1"), 1 << 20);
        assert_eq!(cache.get("auth", "/a").as_deref(), Some(&"selector-1".to_string()));
        assert!(cache.get("auth", "/b").is_none());
        assert!(cache.get("rewrite", "/a").is_none());
    }

    #[test]
    fn test_plugins_are_isolated() {
        let cache = MatchCache::new(CapacityPolicy::Entries);
        cache.put("auth", "/a", selector("auth"), 10);
        cache.put("rewrite", "/a", selector("rewrite"), 10);
        assert_eq!(cache.get("auth", "/a").as_deref(), Some(&"selector-auth".to_string()));
        assert_eq!(
            cache.get("rewrite", "/a").as_deref(),
            Some(&"selector-rewrite".to_string())
        );
    }

    #[test]
    fn test_invalidate_drops_plugin_only() {
        let cache = MatchCache::new(CapacityPolicy::Entries);
        cache.put("auth", "/a", selector("1"), 10);
        cache.put("auth", "/b", selector("2"), 10);
        cache.put("rewrite", "/a", selector("3"), 10);

        assert!(cache.invalidate("auth"));
        assert!(cache.get("auth", "/a").is_none());
        assert!(cache.get("auth", "/b").is_none());
        assert!(cache.get("rewrite", "/a").is_some());
        assert!(!cache.invalidate("auth"));
    }

    #[test]
    fn test_clear_drops_everything() {
        let cache = MatchCache::new(CapacityPolicy::Entries);
        cache.put("auth", "/a", selector("1"), 10);
        cache.put("rewrite", "/a", selector("2"), 10);
        cache.clear();
        assert!(cache.plugins().is_empty());
        assert!(cache.get("rewrite", "/a").is_none());
    }

    #[test]
    fn test_budget_change_resizes() {
        let cache = MatchCache::new(CapacityPolicy::Entries);
        for i in 0..50 {
            cache.put("auth", &format!("/{i}"), selector("x"), 100);
        }
        assert_eq!(cache.len("auth"), 50);

        cache.put("auth", "/last", selector("x"), 5);
        let stats = cache.stats("auth").expect("stats");
        assert_eq!(stats.capacity, 5);
        assert!(stats.entries <= 5);
    }

    #[test]
    fn test_stats_for_unknown_plugin() {
        let cache: MatchCache<String> = MatchCache::default();
        assert!(cache.stats("nope").is_none());
        assert_eq!(cache.len("nope"), 0);
        assert_eq!(cache.cleanup("nope"), 0);
    }

    #[test]
    fn test_put_if_epoch_drops_writes_after_invalidation() {
        let cache = MatchCache::new(CapacityPolicy::Entries);
        let before = cache.epoch();
        assert!(cache.put_if_epoch("auth", "/a", selector("fresh"), 10, before));

        let stale = cache.epoch();
        cache.invalidate("auth");
        assert!(!cache.put_if_epoch("auth", "/a", selector("stale"), 10, stale));
        assert!(cache.get("auth", "/a").is_none());

        let stale = cache.epoch();
        cache.clear();
        assert!(!cache.put_if_epoch("rewrite", "/a", selector("stale"), 10, stale));
        assert!(cache.plugins().is_empty());

        assert!(cache.put_if_epoch("auth", "/a", selector("new"), 10, cache.epoch()));
        assert_eq!(cache.get("auth", "/a").as_deref(), Some(&"selector-new".to_string()));
    }

    #[test]
    fn test_invalidating_unknown_plugin_still_advances_epoch() {
        let cache: MatchCache<String> = MatchCache::new(CapacityPolicy::Entries);
        let epoch = cache.epoch();
        assert!(!cache.invalidate("nope"));
        assert_ne!(cache.epoch(), epoch);
    }

    #[test]
    fn test_huge_budget_does_not_overflow() {
        let cache = MatchCache::new(CapacityPolicy::Memory);
        cache.put("mock", "/z", selector("z"), 1_000_000_000_000_000_000);
        assert_eq!(cache.get("mock", "/z").as_deref(), Some(&"selector-z".to_string()));
        cache.put("mock", "/y", selector("y"), u64::MAX);
        assert_eq!(cache.len("mock"), 2);
    }

    #[test]
    fn test_churn_under_small_budget() {
        let cache = MatchCache::new(CapacityPolicy::Memory);
        cache.put("auth", "/a", selector("a"), 1024);
        for i in 0..2_000 {
            cache.put("auth", &format!("/unrelated/{i}"), selector("u"), 1024);
        }
        cache.cleanup("auth");
        let stats = cache.stats("auth").expect("stats");
        assert!(stats.weighted_size <= 1024);
        assert!(stats.evictions > 0);
    }
}
