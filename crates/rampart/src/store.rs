//! File-backed configuration store.
//!
//! Holds the plugin data and selectors from `rampart.toml` in an immutable
//! snapshot. Readers load the snapshot without locking; writers build a new
//! one, swap it in, then invalidate the match cache of every plugin they
//! touched.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;
use rampart_cache::MatchCache;
use rampart_chain::{ConfigStore, InboundRequest, PluginData, SelectorData};

use crate::config::GatewayConfig;

#[derive(Default, Clone)]
struct Snapshot {
    plugins: HashMap<String, Arc<PluginData>>,
    /// Per plugin, ordered by ascending `sort`.
    selectors: HashMap<String, Vec<Arc<SelectorData>>>,
    /// Plugins whose enabled selectors all match on the path alone.
    path_keyed: HashSet<String>,
}

impl Snapshot {
    fn build(plugins: Vec<PluginData>, selectors: Vec<SelectorData>) -> Self {
        let mut snapshot = Snapshot {
            plugins: plugins
                .into_iter()
                .map(|p| (p.name.clone(), Arc::new(p)))
                .collect(),
            selectors: HashMap::new(),
            path_keyed: HashSet::new(),
        };
        for selector in selectors {
            snapshot.insert_selector(Arc::new(selector.normalized()));
        }
        snapshot
    }

    fn reindex(&mut self, plugin: &str) {
        let keyed = self.selectors.get(plugin).map_or(true, |list| {
            list.iter()
                .filter(|s| s.enabled)
                .all(|s| s.matches_on_path_only())
        });
        if keyed {
            self.path_keyed.insert(plugin.to_string());
        } else {
            self.path_keyed.remove(plugin);
        }
    }

    fn insert_selector(&mut self, selector: Arc<SelectorData>) {
        let plugin = selector.plugin_name.clone();
        let list = self.selectors.entry(plugin.clone()).or_default();
        list.retain(|s| s.id != selector.id);
        list.push(selector);
        list.sort_by_key(|s| s.sort);
        self.reindex(&plugin);
    }
}

pub struct StaticConfigStore {
    snapshot: ArcSwap<Snapshot>,
    writer: Mutex<()>,
    cache: ArcSwapOption<MatchCache<SelectorData>>,
}

impl StaticConfigStore {
    pub fn new(plugins: Vec<PluginData>, selectors: Vec<SelectorData>) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Snapshot::build(plugins, selectors)),
            writer: Mutex::new(()),
            cache: ArcSwapOption::empty(),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(config.plugins.clone(), config.selectors.clone())
    }

    /// Replace everything. Returns the names of plugins whose data or
    /// selectors differ from before.
    pub fn replace(&self, plugins: Vec<PluginData>, selectors: Vec<SelectorData>) -> Vec<String> {
        let _guard = self.writer.lock();
        let next = Snapshot::build(plugins, selectors);
        let previous = self.snapshot.load();

        let mut changed: Vec<String> = previous
            .plugins
            .keys()
            .chain(next.plugins.keys())
            .chain(previous.selectors.keys())
            .chain(next.selectors.keys())
            .filter(|name| {
                previous.plugins.get(*name) != next.plugins.get(*name)
                    || previous.selectors.get(*name) != next.selectors.get(*name)
            })
            .cloned()
            .collect();
        changed.sort();
        changed.dedup();

        self.snapshot.store(Arc::new(next));
        for plugin in &changed {
            self.invalidate(plugin);
        }
        changed
    }

    pub fn resync(&self, config: &GatewayConfig) -> Vec<String> {
        self.replace(config.plugins.clone(), config.selectors.clone())
    }

    /// Add or overwrite one selector. Returns its plugin name.
    pub fn upsert_selector(&self, selector: SelectorData) -> String {
        let _guard = self.writer.lock();
        let mut next = Snapshot::clone(&self.snapshot.load());
        let plugin = selector.plugin_name.clone();
        let mut previous_owners = Vec::new();
        for (owner, list) in next.selectors.iter_mut() {
            let before = list.len();
            list.retain(|s| s.id != selector.id);
            if list.len() != before && *owner != plugin {
                previous_owners.push(owner.clone());
            }
        }
        next.selectors.retain(|_, list| !list.is_empty());
        for owner in &previous_owners {
            next.reindex(owner);
        }
        next.insert_selector(Arc::new(selector.normalized()));
        self.snapshot.store(Arc::new(next));

        for owner in &previous_owners {
            self.invalidate(owner);
        }
        self.invalidate(&plugin);
        plugin
    }

    /// Remove a selector by id. Returns the plugin it belonged to.
    pub fn remove_selector(&self, id: &str) -> Option<String> {
        let _guard = self.writer.lock();
        let mut next = Snapshot::clone(&self.snapshot.load());
        let mut owner = None;
        for (plugin, list) in next.selectors.iter_mut() {
            let before = list.len();
            list.retain(|s| s.id != id);
            if list.len() != before {
                owner = Some(plugin.clone());
            }
        }
        if let Some(plugin) = &owner {
            next.selectors.retain(|_, list| !list.is_empty());
            next.reindex(plugin);
            self.snapshot.store(Arc::new(next));
            self.invalidate(plugin);
        }
        owner
    }

    /// Drop a plugin's data and every selector that belongs to it.
    pub fn remove_plugin(&self, name: &str) -> bool {
        let _guard = self.writer.lock();
        let mut next = Snapshot::clone(&self.snapshot.load());
        let had_data = next.plugins.remove(name).is_some();
        let had_selectors = next.selectors.remove(name).is_some();
        if had_data || had_selectors {
            next.reindex(name);
            self.snapshot.store(Arc::new(next));
            self.invalidate(name);
        }
        had_data || had_selectors
    }

    fn invalidate(&self, plugin: &str) {
        if let Some(cache) = self.cache.load().as_ref() {
            cache.invalidate(plugin);
        }
    }

    pub fn selectors(&self, plugin: &str) -> Vec<Arc<SelectorData>> {
        self.snapshot
            .load()
            .selectors
            .get(plugin)
            .cloned()
            .unwrap_or_default()
    }

    pub fn selector_count(&self) -> usize {
        self.snapshot.load().selectors.values().map(Vec::len).sum()
    }

    pub fn plugin_count(&self) -> usize {
        self.snapshot.load().plugins.len()
    }
}

impl Default for StaticConfigStore {
    fn default() -> Self {
        Self::new(Vec::new(), Vec::new())
    }
}

impl ConfigStore for StaticConfigStore {
    fn plugin(&self, name: &str) -> Option<Arc<PluginData>> {
        self.snapshot.load().plugins.get(name).cloned()
    }

    fn selector_for(&self, plugin: &str, request: &InboundRequest) -> Option<Arc<SelectorData>> {
        let snapshot = self.snapshot.load();
        snapshot
            .selectors
            .get(plugin)?
            .iter()
            .find(|s| s.enabled && s.matches(request))
            .cloned()
    }

    fn path_keyed(&self, plugin: &str) -> bool {
        let snapshot = self.snapshot.load();
        !snapshot.selectors.contains_key(plugin) || snapshot.path_keyed.contains(plugin)
    }

    fn attach_cache(&self, cache: Arc<MatchCache<SelectorData>>) {
        self.cache.store(Some(cache));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rampart_cache::CapacityPolicy;
    use rampart_chain::{Condition, Field, Operator, RuleData};

    fn attached(store: &StaticConfigStore) -> Arc<MatchCache<SelectorData>> {
        let cache = Arc::new(MatchCache::new(CapacityPolicy::Entries));
        store.attach_cache(Arc::clone(&cache));
        cache
    }

    fn warm(cache: &MatchCache<SelectorData>, plugins: &[&str]) {
        for plugin in plugins {
            cache.put(plugin, "/warm", Arc::new(SelectorData::new("warm", *plugin)), 16);
        }
    }

    fn path_selector(id: &str, plugin: &str, prefix: &str, sort: i32) -> SelectorData {
        let mut selector = SelectorData::new(id, plugin)
            .with_condition(Condition::new(Field::Path, Operator::StartsWith, prefix))
            .with_rule(RuleData::new(format!("{id}-rule")));
        selector.sort = sort;
        selector
    }

    #[test]
    fn test_selector_lookup_by_plugin_and_request() {
        let store = StaticConfigStore::new(
            vec![PluginData::new("mock")],
            vec![
                path_selector("api", "mock", "/api", 2),
                path_selector("api-v2", "mock", "/api/v2", 1),
                path_selector("other", "auth", "/", 0),
            ],
        );

        let v2 = InboundRequest::new("GET", "/api/v2/users");
        let v1 = InboundRequest::new("GET", "/api/v1/users");
        assert_eq!(store.selector_for("mock", &v2).map(|s| s.id.clone()), Some("api-v2".into()));
        assert_eq!(store.selector_for("mock", &v1).map(|s| s.id.clone()), Some("api".into()));
        assert!(store.selector_for("mock", &InboundRequest::new("GET", "/web")).is_none());
        assert!(store.selector_for("rewrite", &v1).is_none());
        assert_eq!(store.selector_count(), 3);
        assert!(store.plugin("mock").is_some());
        assert!(store.plugin("auth").is_none());
    }

    #[test]
    fn test_disabled_selector_is_passed_over() {
        let mut first = path_selector("first", "mock", "/", 0);
        first.enabled = false;
        let store = StaticConfigStore::new(vec![], vec![first, path_selector("second", "mock", "/", 1)]);
        let found = store.selector_for("mock", &InboundRequest::new("GET", "/x"));
        assert_eq!(found.map(|s| s.id.clone()), Some("second".into()));
    }

    #[test]
    fn test_rules_are_stamped_with_selector_id() {
        let store = StaticConfigStore::new(vec![], vec![path_selector("s", "mock", "/", 0)]);
        let selectors = store.selectors("mock");
        assert_eq!(selectors[0].rules[0].selector_id, "s");
    }

    #[test]
    fn test_replace_reports_changed_plugins() {
        let store = StaticConfigStore::new(
            vec![PluginData::new("mock")],
            vec![path_selector("a", "mock", "/a", 0), path_selector("b", "auth", "/b", 0)],
        );

        let changed = store.replace(
            vec![PluginData::new("mock")],
            vec![path_selector("a", "mock", "/a", 0), path_selector("b2", "auth", "/b", 0)],
        );
        assert_eq!(changed, vec!["auth".to_string()]);
        assert_eq!(store.selectors("auth")[0].id, "b2");

        let changed = store.replace(vec![], vec![]);
        assert_eq!(changed, vec!["auth".to_string(), "mock".to_string()]);
        assert_eq!(store.selector_count(), 0);
    }

    #[test]
    fn test_upsert_moves_selector_between_plugins() {
        let store = StaticConfigStore::new(vec![], vec![path_selector("s", "mock", "/", 0)]);
        let plugin = store.upsert_selector(path_selector("s", "auth", "/", 0));
        assert_eq!(plugin, "auth");
        assert!(store.selectors("mock").is_empty());
        assert_eq!(store.selectors("auth").len(), 1);
    }

    #[test]
    fn test_remove_selector_and_plugin() {
        let store = StaticConfigStore::new(
            vec![PluginData::new("mock")],
            vec![path_selector("a", "mock", "/a", 0), path_selector("b", "mock", "/b", 1)],
        );
        assert_eq!(store.remove_selector("a"), Some("mock".to_string()));
        assert_eq!(store.remove_selector("a"), None);
        assert_eq!(store.selector_count(), 1);

        assert!(store.remove_plugin("mock"));
        assert!(!store.remove_plugin("mock"));
        assert_eq!(store.selector_count(), 0);
        assert_eq!(store.plugin_count(), 0);
    }

    #[test]
    fn test_path_keyed_tracks_selector_fields() {
        let store = StaticConfigStore::new(vec![], vec![path_selector("p", "mock", "/", 0)]);
        assert!(store.path_keyed("mock"));
        assert!(store.path_keyed("unknown"));

        let by_method = SelectorData::new("m", "mock")
            .with_condition(Condition::new(Field::Method, Operator::Equals, "GET"));
        store.upsert_selector(by_method.clone());
        assert!(!store.path_keyed("mock"));

        let mut disabled = by_method;
        disabled.enabled = false;
        store.upsert_selector(disabled);
        assert!(store.path_keyed("mock"));

        store.upsert_selector(
            SelectorData::new("h", "auth")
                .with_condition(Condition::new(Field::Header, Operator::Equals, "acme").with_key("x-tenant")),
        );
        assert!(!store.path_keyed("auth"));
        assert_eq!(store.remove_selector("h"), Some("auth".to_string()));
        assert!(store.path_keyed("auth"));
    }

    #[test]
    fn test_writes_invalidate_the_touched_plugins() {
        let store = StaticConfigStore::new(
            vec![PluginData::new("mock"), PluginData::new("auth")],
            vec![path_selector("a", "mock", "/a", 0), path_selector("b", "auth", "/b", 0)],
        );
        let cache = attached(&store);

        warm(&cache, &["mock", "auth", "rewrite"]);
        store.upsert_selector(path_selector("c", "mock", "/c", 1));
        assert!(cache.get("mock", "/warm").is_none());
        assert!(cache.get("auth", "/warm").is_some());

        warm(&cache, &["mock", "auth"]);
        store.upsert_selector(path_selector("a", "auth", "/a", 0));
        assert!(cache.get("mock", "/warm").is_none(), "previous owner invalidated");
        assert!(cache.get("auth", "/warm").is_none());

        warm(&cache, &["mock", "auth"]);
        assert_eq!(store.remove_selector("c"), Some("mock".to_string()));
        assert!(cache.get("mock", "/warm").is_none());
        assert!(cache.get("auth", "/warm").is_some());

        assert!(store.remove_plugin("auth"));
        assert!(cache.get("auth", "/warm").is_none());
        assert!(cache.get("rewrite", "/warm").is_some());
    }

    #[test]
    fn test_replace_invalidates_changed_plugins_only() {
        let store = StaticConfigStore::new(
            vec![PluginData::new("mock")],
            vec![path_selector("a", "mock", "/a", 0), path_selector("b", "auth", "/b", 0)],
        );
        let cache = attached(&store);
        warm(&cache, &["mock", "auth"]);

        let changed = store.replace(
            vec![PluginData::new("mock")],
            vec![path_selector("a", "mock", "/a", 0), path_selector("b", "auth", "/other", 0)],
        );
        assert_eq!(changed, vec!["auth".to_string()]);
        assert!(cache.get("mock", "/warm").is_some());
        assert!(cache.get("auth", "/warm").is_none());
    }
}
