//! Plugin chain execution.
//!
//! Plugins run in ascending priority order. Before each plugin the engine
//! resolves its selector (match cache first, then the config store) and
//! rule; a plugin without a match is skipped. The first plugin that
//! responds ends the chain. A plugin error or panic ends it with a 500. A
//! plugin that hands off ends the chain suspended; the caller finishes the
//! handoff with [`PluginChain::resume`] wherever it runs it.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use futures_util::FutureExt;
use rampart_cache::MatchCache;
use rampart_telemetry::{events, ExchangeOutcome, MetricsRegistry};

use crate::attributes::keys;
use crate::data::{RuleData, SelectorData};
use crate::error::PluginError;
use crate::exchange::{Exchange, ExchangeState};
use crate::plugin::{Flow, Handoff, Next, Plugin, PluginList};
use crate::request::InboundRequest;
use crate::response::GatewayResponse;
use crate::store::ConfigStore;

/// Engine settings taken from gateway configuration.
#[derive(Debug, Clone)]
pub struct ChainSettings {
    /// Match cache budget for plugins that do not set their own.
    pub default_budget: u64,
    /// Include error details in fault responses.
    pub dev_mode: bool,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            default_budget: 1 << 20,
            dev_mode: false,
        }
    }
}

/// Result of running the chain for one exchange.
#[derive(Debug)]
pub enum ChainOutcome {
    /// A plugin answered.
    Terminated {
        plugin: String,
        response: GatewayResponse,
    },
    /// No plugin answered; carries the default "no route" response.
    Exhausted { response: GatewayResponse },
    /// A plugin failed; carries the 500 response.
    Failed {
        plugin: String,
        error: PluginError,
        response: GatewayResponse,
    },
}

impl ChainOutcome {
    pub fn response(&self) -> &GatewayResponse {
        match self {
            ChainOutcome::Terminated { response, .. }
            | ChainOutcome::Exhausted { response }
            | ChainOutcome::Failed { response, .. } => response,
        }
    }

    pub fn into_response(self) -> GatewayResponse {
        match self {
            ChainOutcome::Terminated { response, .. }
            | ChainOutcome::Exhausted { response }
            | ChainOutcome::Failed { response, .. } => response,
        }
    }

    pub fn outcome(&self) -> ExchangeOutcome {
        match self {
            ChainOutcome::Terminated { .. } => ExchangeOutcome::Terminated,
            ChainOutcome::Exhausted { .. } => ExchangeOutcome::Exhausted,
            ChainOutcome::Failed { .. } => ExchangeOutcome::Failed,
        }
    }
}

/// A chain run that a plugin handed off.
#[derive(Debug)]
pub struct Suspended {
    plugin: String,
    handoff: Handoff,
}

impl Suspended {
    /// Name of the plugin that handed off.
    pub fn plugin(&self) -> &str {
        &self.plugin
    }
}

/// What one pass over the chain produced.
#[derive(Debug)]
pub enum ChainRun {
    Finished(ChainOutcome),
    Suspended(Suspended),
}

impl ChainRun {
    /// The outcome, unless a plugin handed off.
    pub fn finished(self) -> Option<ChainOutcome> {
        match self {
            ChainRun::Finished(outcome) => Some(outcome),
            ChainRun::Suspended(_) => None,
        }
    }
}

enum RuleChoice {
    None,
    Index(usize),
    Default(RuleData),
}

enum Resolution {
    Skip(&'static str),
    Invoke {
        selector: Option<Arc<SelectorData>>,
        rule: RuleChoice,
    },
}

/// The plugin chain engine.
pub struct PluginChain {
    plugins: ArcSwap<PluginList>,
    cache: Arc<MatchCache<SelectorData>>,
    store: Arc<dyn ConfigStore>,
    metrics: Arc<MetricsRegistry>,
    settings: ChainSettings,
}

impl PluginChain {
    pub fn new(
        cache: Arc<MatchCache<SelectorData>>,
        store: Arc<dyn ConfigStore>,
        metrics: Arc<MetricsRegistry>,
        settings: ChainSettings,
    ) -> Self {
        Self {
            plugins: ArcSwap::from_pointee(PluginList::default()),
            cache,
            store,
            metrics,
            settings,
        }
    }

    /// Replace the plugin list. In-flight exchanges keep the list they
    /// were stamped with.
    pub fn set_plugins(&self, plugins: Vec<Arc<dyn Plugin>>) {
        let list = PluginList::new(plugins);
        tracing::info!(
            event = events::PLUGINS_SWAPPED,
            plugins = ?list.names(),
            "plugin list replaced"
        );
        self.plugins.store(Arc::new(list));
    }

    /// Current plugin list snapshot.
    pub fn plugins(&self) -> Arc<PluginList> {
        self.plugins.load_full()
    }

    pub fn plugin_named(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.load().named(name).cloned()
    }

    pub fn cache(&self) -> &Arc<MatchCache<SelectorData>> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    pub fn settings(&self) -> &ChainSettings {
        &self.settings
    }

    /// Pin the current plugin list on an exchange that has none yet.
    pub fn stamp(&self, exchange: &mut Exchange) {
        if !exchange.has_plugins() {
            exchange.set_plugins(self.plugins());
        }
    }

    /// Run the exchange from its current chain position until a plugin
    /// answers, fails or hands off, or the chain is exhausted.
    pub async fn execute(&self, exchange: &mut Exchange) -> ChainRun {
        self.stamp(exchange);
        let plugins = Arc::clone(exchange.plugins());

        while let Some(plugin) = plugins.get(exchange.chain_position()).cloned() {
            let index = exchange.chain_position();
            let name = plugin.name();
            exchange.set_state(ExchangeState::Matching(index));

            let (selector, rule) = match self.resolve(plugin.as_ref(), exchange) {
                Resolution::Skip(reason) => {
                    tracing::trace!(
                        plugin = %name,
                        reason = reason,
                        trace_id = %exchange.trace_id(),
                        "plugin skipped"
                    );
                    exchange.advance_past(index);
                    continue;
                }
                Resolution::Invoke { selector, rule } => (selector, rule),
            };

            let rule = match (&rule, &selector) {
                (RuleChoice::Index(i), Some(selector)) => selector.rules.get(*i),
                (RuleChoice::Default(rule), _) => Some(rule),
                _ => None,
            };
            if let Some(selector) = &selector {
                exchange
                    .attributes_mut()
                    .insert(keys::MATCHED_SELECTOR, selector.id.clone());
            }
            if let Some(rule) = rule {
                exchange
                    .attributes_mut()
                    .insert(keys::MATCHED_RULE, rule.id.clone());
            }

            exchange.set_state(ExchangeState::Executing(index));
            let started = Instant::now();
            let result = AssertUnwindSafe(plugin.execute(
                exchange,
                Next::new(index),
                selector.as_deref(),
                rule,
            ))
            .catch_unwind()
            .await;
            let elapsed = started.elapsed().as_secs_f64();

            match result {
                Ok(Ok(Flow::Continue(next))) | Ok(Ok(Flow::Skip(next))) => {
                    self.metrics.record_plugin(name, elapsed, false);
                    exchange.advance_past(next.position());
                }
                Ok(Ok(Flow::Respond(response))) => {
                    self.metrics.record_plugin(name, elapsed, true);
                    rampart_telemetry::log_plugin_short_circuit!(
                        plugin = %name,
                        status = response.status,
                        trace_id = %exchange.trace_id(),
                        "plugin answered"
                    );
                    exchange.set_state(ExchangeState::Terminated);
                    self.metrics.record_exchange(ExchangeOutcome::Terminated);
                    return ChainRun::Finished(ChainOutcome::Terminated {
                        plugin: name.to_string(),
                        response,
                    });
                }
                Ok(Ok(Flow::Handoff(handoff))) => {
                    self.metrics.record_plugin(name, elapsed, false);
                    self.metrics.record_handoff(name);
                    tracing::debug!(
                        event = events::PLUGIN_HANDOFF,
                        plugin = %name,
                        trace_id = %exchange.trace_id(),
                        "plugin handed off"
                    );
                    exchange.set_state(ExchangeState::Suspended(index));
                    exchange.advance_past(index);
                    return ChainRun::Suspended(Suspended {
                        plugin: name.to_string(),
                        handoff,
                    });
                }
                Ok(Err(error)) => {
                    self.metrics.record_plugin(name, elapsed, false);
                    return ChainRun::Finished(self.fault(exchange, name, error));
                }
                Err(payload) => {
                    self.metrics.record_plugin(name, elapsed, false);
                    let error = PluginError::Panicked(panic_message(payload.as_ref()));
                    return ChainRun::Finished(self.fault(exchange, name, error));
                }
            }
        }

        exchange.set_state(ExchangeState::Exhausted);
        tracing::debug!(
            event = events::CHAIN_EXHAUSTED,
            path = %exchange.request().path,
            trace_id = %exchange.trace_id(),
            "no plugin answered"
        );
        self.metrics.record_exchange(ExchangeOutcome::Exhausted);
        ChainRun::Finished(ChainOutcome::Exhausted {
            response: GatewayResponse::no_route(&exchange.request().path),
        })
    }

    /// Await a handoff and turn its result into the exchange's outcome. An
    /// error or panic in the handoff becomes a 500 like any plugin fault.
    pub async fn resume(&self, exchange: &mut Exchange, suspended: Suspended) -> ChainOutcome {
        let Suspended { plugin, handoff } = suspended;
        let started = Instant::now();
        let result = AssertUnwindSafe(handoff.into_future()).catch_unwind().await;
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(Ok(response)) => {
                self.metrics.record_plugin(&plugin, elapsed, true);
                rampart_telemetry::log_plugin_short_circuit!(
                    plugin = %plugin,
                    status = response.status,
                    trace_id = %exchange.trace_id(),
                    "handoff answered"
                );
                exchange.set_state(ExchangeState::Terminated);
                self.metrics.record_exchange(ExchangeOutcome::Terminated);
                ChainOutcome::Terminated { plugin, response }
            }
            Ok(Err(error)) => {
                self.metrics.record_plugin(&plugin, elapsed, false);
                self.fault(exchange, &plugin, error)
            }
            Err(payload) => {
                self.metrics.record_plugin(&plugin, elapsed, false);
                let error = PluginError::Panicked(panic_message(payload.as_ref()));
                self.fault(exchange, &plugin, error)
            }
        }
    }

    fn resolve(&self, plugin: &dyn Plugin, exchange: &Exchange) -> Resolution {
        if !plugin.applies_to(exchange) {
            return Resolution::Skip("not applicable");
        }

        let data = self.store.plugin(plugin.name());
        if data.as_ref().is_some_and(|d| !d.enabled) {
            return Resolution::Skip("plugin disabled");
        }

        if !plugin.requires_selector() {
            return Resolution::Invoke {
                selector: None,
                rule: RuleChoice::None,
            };
        }

        let budget = data
            .as_ref()
            .map_or(self.settings.default_budget, |d| {
                d.cache_budget(self.settings.default_budget)
            });
        let request = exchange.request();
        let Some(selector) = self.match_selector(plugin.name(), request, budget) else {
            return Resolution::Skip("no selector");
        };
        if !selector.enabled {
            return Resolution::Skip("selector disabled");
        }

        let rule = if selector.continued {
            match selector.matching_rule_index(request) {
                Some(index) => RuleChoice::Index(index),
                None => return Resolution::Skip("no rule"),
            }
        } else {
            RuleChoice::Default(selector.default_rule())
        };

        Resolution::Invoke {
            selector: Some(selector),
            rule,
        }
    }

    /// Resolve the selector of `plugin` for `request`.
    ///
    /// Plugins whose selectors decide on the path alone go through the
    /// match cache; the rest always ask the store. A write-back is dropped
    /// when the cache was invalidated after the lookup started.
    fn match_selector(
        &self,
        plugin: &str,
        request: &InboundRequest,
        budget: u64,
    ) -> Option<Arc<SelectorData>> {
        if !self.store.path_keyed(plugin) {
            return self.store.selector_for(plugin, request);
        }

        let epoch = self.cache.epoch();
        if let Some(selector) = self.cache.get(plugin, &request.path) {
            self.metrics.record_cache_lookup(plugin, true);
            return Some(selector);
        }
        self.metrics.record_cache_lookup(plugin, false);

        let selector = self.store.selector_for(plugin, request)?;
        self.cache
            .put_if_epoch(plugin, &request.path, Arc::clone(&selector), budget, epoch);
        Some(selector)
    }

    fn fault(&self, exchange: &mut Exchange, plugin: &str, error: PluginError) -> ChainOutcome {
        rampart_telemetry::log_plugin_fault!(
            plugin = %plugin,
            trace_id = %exchange.trace_id(),
            error = %error,
            "plugin failed"
        );
        self.metrics.record_plugin_fault(plugin);
        self.metrics.record_exchange(ExchangeOutcome::Failed);
        exchange.set_state(ExchangeState::Failed);

        let detail = self.settings.dev_mode.then(|| error.to_string());
        let response = GatewayResponse::plugin_fault(exchange.trace_id(), detail.as_deref());
        ChainOutcome::Failed {
            plugin: plugin.to_string(),
            error,
            response,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{Condition, Field, Operator};
    use crate::data::PluginData;
    use async_trait::async_trait;
    use rampart_cache::CapacityPolicy;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct TestStore {
        plugins: HashMap<String, Arc<PluginData>>,
        selectors: Vec<Arc<SelectorData>>,
        lookups: AtomicUsize,
    }

    impl TestStore {
        fn with_selector(mut self, selector: SelectorData) -> Self {
            self.selectors.push(Arc::new(selector.normalized()));
            self
        }

        fn with_plugin(mut self, data: PluginData) -> Self {
            self.plugins.insert(data.name.clone(), Arc::new(data));
            self
        }
    }

    impl ConfigStore for TestStore {
        fn plugin(&self, name: &str) -> Option<Arc<PluginData>> {
            self.plugins.get(name).cloned()
        }

        fn selector_for(&self, plugin: &str, request: &InboundRequest) -> Option<Arc<SelectorData>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.selectors
                .iter()
                .find(|s| s.plugin_name == plugin && s.matches(request))
                .cloned()
        }

        fn path_keyed(&self, plugin: &str) -> bool {
            self.selectors
                .iter()
                .filter(|s| s.plugin_name == plugin)
                .all(|s| s.matches_on_path_only())
        }
    }

    /// Clears the cache from inside the store lookup, the way a reload
    /// landing between lookup and write-back would.
    struct ReloadingStore {
        cache: std::sync::OnceLock<Arc<MatchCache<SelectorData>>>,
        selector: Arc<SelectorData>,
    }

    impl ConfigStore for ReloadingStore {
        fn plugin(&self, _name: &str) -> Option<Arc<PluginData>> {
            None
        }

        fn selector_for(&self, plugin: &str, _request: &InboundRequest) -> Option<Arc<SelectorData>> {
            if let Some(cache) = self.cache.get() {
                cache.clear();
            }
            (plugin == self.selector.plugin_name).then(|| Arc::clone(&self.selector))
        }

        fn path_keyed(&self, _plugin: &str) -> bool {
            true
        }

        fn attach_cache(&self, cache: Arc<MatchCache<SelectorData>>) {
            let _ = self.cache.set(cache);
        }
    }

    #[derive(Clone, Copy)]
    enum Behavior {
        Continue,
        Skip,
        Respond(u16),
        Fail,
        Panic,
    }

    struct TestPlugin {
        name: String,
        priority: i32,
        behavior: Behavior,
        needs_selector: bool,
        calls: Arc<AtomicUsize>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl TestPlugin {
        fn new(name: &str, priority: i32, behavior: Behavior, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                priority,
                behavior,
                needs_selector: false,
                calls: Arc::new(AtomicUsize::new(0)),
                log: Arc::clone(log),
            }
        }

        fn needing_selector(mut self) -> Self {
            self.needs_selector = true;
            self
        }
    }

    #[async_trait]
    impl Plugin for TestPlugin {
        fn name(&self) -> &str {
            &self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn requires_selector(&self) -> bool {
            self.needs_selector
        }

        async fn execute(
            &self,
            exchange: &mut Exchange,
            next: Next,
            _selector: Option<&SelectorData>,
            rule: Option<&RuleData>,
        ) -> Result<Flow, PluginError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.log.lock().expect("log lock").push(self.name.clone());
            exchange
                .attributes_mut()
                .insert(format!("seen.{}", self.name), rule.map(|r| r.id.clone()));

            match self.behavior {
                Behavior::Continue => Ok(next.proceed()),
                Behavior::Skip => Ok(next.skip()),
                Behavior::Respond(status) => Ok(Flow::respond(
                    GatewayResponse::text(status, format!("from {}", self.name)),
                )),
                Behavior::Fail => Err(PluginError::failed("upstream exploded")),
                Behavior::Panic => panic!("plugin bug"),
            }
        }
    }

    fn chain_with(store: TestStore, settings: ChainSettings) -> (PluginChain, Arc<TestStore>) {
        let store = Arc::new(store);
        let chain = PluginChain::new(
            Arc::new(MatchCache::new(CapacityPolicy::Memory)),
            Arc::clone(&store) as Arc<dyn ConfigStore>,
            Arc::new(MetricsRegistry::new()),
            settings,
        );
        (chain, store)
    }

    fn exchange(path: &str) -> Exchange {
        Exchange::new(InboundRequest::new("GET", path))
    }

    fn new_log() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    async fn finish(chain: &PluginChain, exchange: &mut Exchange) -> ChainOutcome {
        chain.execute(exchange).await.finished().expect("chain finished")
    }

    /// Hands off a future that answers with the given result.
    struct Upstream {
        result: fn() -> Result<GatewayResponse, PluginError>,
    }

    #[async_trait]
    impl Plugin for Upstream {
        fn name(&self) -> &str {
            "upstream"
        }

        fn priority(&self) -> i32 {
            5
        }

        fn requires_selector(&self) -> bool {
            false
        }

        async fn execute(
            &self,
            exchange: &mut Exchange,
            _next: Next,
            _selector: Option<&SelectorData>,
            _rule: Option<&RuleData>,
        ) -> Result<Flow, PluginError> {
            let path = exchange.request().path.clone();
            let result = self.result;
            Ok(Flow::handoff(async move {
                tokio::task::yield_now().await;
                result().map(|r| r.with_header("x-path", path))
            }))
        }
    }

    fn handoff_chain(result: fn() -> Result<GatewayResponse, PluginError>, log: &Arc<Mutex<Vec<String>>>) -> (PluginChain, Arc<AtomicUsize>) {
        let (chain, _) = chain_with(TestStore::default(), ChainSettings::default());
        let after = TestPlugin::new("after", 9, Behavior::Respond(200), log);
        let after_calls = after.calls.clone();
        chain.set_plugins(vec![
            Arc::new(TestPlugin::new("before", 1, Behavior::Continue, log)),
            Arc::new(Upstream { result }),
            Arc::new(after),
        ]);
        (chain, after_calls)
    }

    #[tokio::test]
    async fn test_short_circuit_stops_chain() {
        let log = new_log();
        let a = TestPlugin::new("a", 10, Behavior::Continue, &log);
        let b = TestPlugin::new("b", 20, Behavior::Respond(200), &log);
        let c = TestPlugin::new("c", 30, Behavior::Continue, &log);
        let (a_calls, b_calls, c_calls) = (a.calls.clone(), b.calls.clone(), c.calls.clone());

        let (chain, _) = chain_with(TestStore::default(), ChainSettings::default());
        chain.set_plugins(vec![Arc::new(c), Arc::new(a), Arc::new(b)]);

        let mut ex = exchange("/echo");
        let outcome = finish(&chain, &mut ex).await;

        assert!(matches!(&outcome, ChainOutcome::Terminated { plugin, .. } if plugin == "b"));
        assert_eq!(outcome.response().status, 200);
        assert_eq!(ex.state(), ExchangeState::Terminated);
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
        assert_eq!(c_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_equal_priorities_keep_registration_order() {
        let log = new_log();
        let (chain, _) = chain_with(TestStore::default(), ChainSettings::default());
        chain.set_plugins(vec![
            Arc::new(TestPlugin::new("x", 5, Behavior::Continue, &log)),
            Arc::new(TestPlugin::new("y", 1, Behavior::Skip, &log)),
            Arc::new(TestPlugin::new("z", 5, Behavior::Continue, &log)),
        ]);

        let mut ex = exchange("/");
        chain.execute(&mut ex).await;
        assert_eq!(*log.lock().expect("log lock"), vec!["y", "x", "z"]);
        assert_eq!(ex.chain_position(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_chain_returns_no_route() {
        let log = new_log();
        let (chain, _) = chain_with(TestStore::default(), ChainSettings::default());
        chain.set_plugins(vec![Arc::new(TestPlugin::new("a", 1, Behavior::Continue, &log))]);

        let mut ex = exchange("/nowhere");
        let outcome = finish(&chain, &mut ex).await;

        assert_eq!(outcome.outcome(), ExchangeOutcome::Exhausted);
        assert_eq!(ex.state(), ExchangeState::Exhausted);
        let body: serde_json::Value =
            serde_json::from_slice(&outcome.response().body).expect("json body");
        assert_eq!(body, serde_json::json!({"error": "no route", "path": "/nowhere"}));
        assert_eq!(outcome.response().status, 404);
    }

    #[tokio::test]
    async fn test_plugin_error_becomes_500() {
        let log = new_log();
        let after = TestPlugin::new("after", 2, Behavior::Respond(200), &log);
        let after_calls = after.calls.clone();
        let (chain, _) = chain_with(TestStore::default(), ChainSettings::default());
        chain.set_plugins(vec![
            Arc::new(TestPlugin::new("broken", 1, Behavior::Fail, &log)),
            Arc::new(after),
        ]);

        let mut ex = exchange("/");
        let outcome = finish(&chain, &mut ex).await;

        assert!(matches!(
            &outcome,
            ChainOutcome::Failed { plugin, error: PluginError::Failed(_), .. } if plugin == "broken"
        ));
        assert_eq!(outcome.response().status, 500);
        assert_eq!(ex.state(), ExchangeState::Failed);
        assert_eq!(after_calls.load(Ordering::SeqCst), 0);

        let body: serde_json::Value =
            serde_json::from_slice(&outcome.response().body).expect("json body");
        assert_eq!(body["trace_id"], ex.trace_id());
        assert!(body.get("detail").is_none());
    }

    #[tokio::test]
    async fn test_plugin_panic_is_contained() {
        let log = new_log();
        let settings = ChainSettings {
            dev_mode: true,
            ..ChainSettings::default()
        };
        let (chain, _) = chain_with(TestStore::default(), settings);
        chain.set_plugins(vec![Arc::new(TestPlugin::new("wild", 1, Behavior::Panic, &log))]);

        let mut ex = exchange("/");
        let outcome = finish(&chain, &mut ex).await;

        assert!(matches!(
            &outcome,
            ChainOutcome::Failed { error: PluginError::Panicked(msg), .. } if msg == "plugin bug"
        ));
        let body: serde_json::Value =
            serde_json::from_slice(&outcome.response().body).expect("json body");
        assert_eq!(body["detail"], "plugin panicked: plugin bug");
    }

    #[tokio::test]
    async fn test_plugins_without_match_are_skipped() {
        let log = new_log();
        let mut disabled = PluginData::new("disabled");
        disabled.enabled = false;
        let store = TestStore::default()
            .with_plugin(disabled)
            .with_selector(
                SelectorData::new("s-norule", "norule").with_rule(
                    RuleData::new("r").with_condition(Condition::new(
                        Field::Path,
                        Operator::Equals,
                        "/other",
                    )),
                ),
            );
        let (chain, _) = chain_with(store, ChainSettings::default());

        let disabled = TestPlugin::new("disabled", 1, Behavior::Respond(418), &log);
        let no_selector = TestPlugin::new("noselector", 2, Behavior::Respond(418), &log).needing_selector();
        let no_rule = TestPlugin::new("norule", 3, Behavior::Respond(418), &log).needing_selector();
        let counters = [disabled.calls.clone(), no_selector.calls.clone(), no_rule.calls.clone()];
        chain.set_plugins(vec![Arc::new(disabled), Arc::new(no_selector), Arc::new(no_rule)]);

        let mut ex = exchange("/a");
        let outcome = finish(&chain, &mut ex).await;

        assert_eq!(outcome.outcome(), ExchangeOutcome::Exhausted);
        for calls in counters {
            assert_eq!(calls.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn test_selector_and_rule_are_resolved_and_cached() {
        let log = new_log();
        let store = TestStore::default().with_selector(
            SelectorData::new("s1", "route")
                .with_condition(Condition::new(Field::Path, Operator::PathPattern, "/api/**"))
                .with_rule(RuleData::new("r1")),
        );
        let (chain, store) = chain_with(store, ChainSettings::default());
        chain.set_plugins(vec![Arc::new(
            TestPlugin::new("route", 1, Behavior::Respond(200), &log).needing_selector(),
        )]);

        for _ in 0..3 {
            let mut ex = exchange("/api/orders");
            let outcome = finish(&chain, &mut ex).await;
            assert_eq!(outcome.outcome(), ExchangeOutcome::Terminated);
            assert_eq!(
                ex.attributes().get::<String>(keys::MATCHED_SELECTOR).map(String::as_str),
                Some("s1")
            );
            assert_eq!(
                ex.attributes().get::<Option<String>>("seen.route"),
                Some(&Some("r1".to_string()))
            );
        }

        assert_eq!(store.lookups.load(Ordering::SeqCst), 1);
        assert_eq!(chain.cache().len("route"), 1);
    }

    #[tokio::test]
    async fn test_selector_priority_holds_for_mixed_traffic() {
        let log = new_log();
        let mut get_only = SelectorData::new("get-only", "route")
            .with_condition(Condition::new(Field::Method, Operator::Equals, "GET"))
            .with_condition(Condition::new(Field::Path, Operator::Equals, "/x"))
            .with_rule(RuleData::new("g"));
        get_only.sort = 0;
        let mut any = SelectorData::new("any", "route")
            .with_condition(Condition::new(Field::Path, Operator::Equals, "/x"))
            .with_rule(RuleData::new("a"));
        any.sort = 1;
        let store = TestStore::default().with_selector(get_only).with_selector(any);
        let (chain, store) = chain_with(store, ChainSettings::default());
        chain.set_plugins(vec![Arc::new(
            TestPlugin::new("route", 1, Behavior::Respond(200), &log).needing_selector(),
        )]);

        let matched = |ex: &Exchange| ex.attributes().get::<String>(keys::MATCHED_SELECTOR).cloned();
        for (method, expected) in [("GET", "get-only"), ("POST", "any"), ("GET", "get-only"), ("POST", "any")] {
            let mut ex = Exchange::new(InboundRequest::new(method, "/x"));
            chain.execute(&mut ex).await;
            assert_eq!(matched(&ex).as_deref(), Some(expected), "{method} /x");
        }

        assert_eq!(store.lookups.load(Ordering::SeqCst), 4);
        assert_eq!(chain.cache().len("route"), 0);
    }

    #[tokio::test]
    async fn test_invalidation_during_lookup_is_not_undone() {
        let log = new_log();
        let store = Arc::new(ReloadingStore {
            cache: std::sync::OnceLock::new(),
            selector: Arc::new(SelectorData::new("old", "route").with_rule(RuleData::new("r"))),
        });
        let chain = PluginChain::new(
            Arc::new(MatchCache::new(CapacityPolicy::Memory)),
            Arc::clone(&store) as Arc<dyn ConfigStore>,
            Arc::new(MetricsRegistry::new()),
            ChainSettings::default(),
        );
        store.attach_cache(Arc::clone(chain.cache()));
        chain.set_plugins(vec![Arc::new(
            TestPlugin::new("route", 1, Behavior::Respond(200), &log).needing_selector(),
        )]);

        let outcome = finish(&chain, &mut exchange("/a")).await;
        assert_eq!(outcome.outcome(), ExchangeOutcome::Terminated);
        assert!(chain.cache().get("route", "/a").is_none());
    }

    #[tokio::test]
    async fn test_absent_selector_is_not_cached() {
        let log = new_log();
        let (chain, store) = chain_with(TestStore::default(), ChainSettings::default());
        chain.set_plugins(vec![Arc::new(
            TestPlugin::new("route", 1, Behavior::Respond(200), &log).needing_selector(),
        )]);

        for _ in 0..2 {
            chain.execute(&mut exchange("/x")).await;
        }
        assert_eq!(store.lookups.load(Ordering::SeqCst), 2);
        assert_eq!(chain.cache().len("route"), 0);
    }

    #[tokio::test]
    async fn test_selector_without_continue_uses_default_rule() {
        let log = new_log();
        let mut selector = SelectorData::new("s1", "route").with_rule(RuleData::new("never").with_condition(
            Condition::new(Field::Path, Operator::Equals, "/nope"),
        ));
        selector.continued = false;
        let (chain, _) = chain_with(TestStore::default().with_selector(selector), ChainSettings::default());
        chain.set_plugins(vec![Arc::new(
            TestPlugin::new("route", 1, Behavior::Respond(200), &log).needing_selector(),
        )]);

        let mut ex = exchange("/any");
        chain.execute(&mut ex).await;
        assert_eq!(
            ex.attributes().get::<Option<String>>("seen.route"),
            Some(&Some("s1#default".to_string()))
        );
    }

    #[tokio::test]
    async fn test_handoff_suspends_then_resumes_with_its_response() {
        let log = new_log();
        let (chain, after_calls) = handoff_chain(|| Ok(GatewayResponse::text(202, "later")), &log);

        let mut ex = exchange("/slow");
        let suspended = match chain.execute(&mut ex).await {
            ChainRun::Suspended(suspended) => suspended,
            ChainRun::Finished(outcome) => panic!("expected a handoff, got {outcome:?}"),
        };
        assert_eq!(suspended.plugin(), "upstream");
        assert_eq!(ex.state(), ExchangeState::Suspended(1));
        assert_eq!(ex.chain_position(), 2);

        let outcome = chain.resume(&mut ex, suspended).await;
        assert!(matches!(&outcome, ChainOutcome::Terminated { plugin, .. } if plugin == "upstream"));
        assert_eq!(outcome.response().status, 202);
        assert_eq!(outcome.response().headers.get("x-path").map(String::as_str), Some("/slow"));
        assert_eq!(ex.state(), ExchangeState::Terminated);
        assert_eq!(after_calls.load(Ordering::SeqCst), 0);
        assert_eq!(*log.lock().expect("log lock"), vec!["before"]);
    }

    #[tokio::test]
    async fn test_failed_handoff_becomes_500() {
        let log = new_log();
        let (chain, _) = handoff_chain(|| Err(PluginError::failed("upstream refused")), &log);

        let mut ex = exchange("/slow");
        let Some(suspended) = into_suspended(chain.execute(&mut ex).await) else {
            panic!("expected a handoff");
        };
        let outcome = chain.resume(&mut ex, suspended).await;
        assert!(matches!(&outcome, ChainOutcome::Failed { plugin, .. } if plugin == "upstream"));
        assert_eq!(outcome.response().status, 500);
        assert_eq!(ex.state(), ExchangeState::Failed);
    }

    #[tokio::test]
    async fn test_panicking_handoff_is_contained() {
        let log = new_log();
        let (chain, _) = handoff_chain(|| panic!("handoff bug"), &log);

        let mut ex = exchange("/slow");
        let Some(suspended) = into_suspended(chain.execute(&mut ex).await) else {
            panic!("expected a handoff");
        };
        let outcome = chain.resume(&mut ex, suspended).await;
        assert!(matches!(
            &outcome,
            ChainOutcome::Failed { error: PluginError::Panicked(msg), .. } if msg == "handoff bug"
        ));
    }

    fn into_suspended(run: ChainRun) -> Option<Suspended> {
        match run {
            ChainRun::Suspended(suspended) => Some(suspended),
            ChainRun::Finished(_) => None,
        }
    }

    #[tokio::test]
    async fn test_stamped_exchange_ignores_hot_swap() {
        let log = new_log();
        let (chain, _) = chain_with(TestStore::default(), ChainSettings::default());
        chain.set_plugins(vec![Arc::new(TestPlugin::new("old", 1, Behavior::Respond(200), &log))]);

        let mut ex = exchange("/");
        chain.stamp(&mut ex);
        chain.set_plugins(vec![Arc::new(TestPlugin::new("new", 1, Behavior::Respond(201), &log))]);

        let outcome = finish(&chain, &mut ex).await;
        assert_eq!(outcome.response().status, 200);
        assert!(chain.plugin_named("new").is_some());
        assert!(chain.plugin_named("old").is_none());
    }
}
