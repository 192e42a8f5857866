//! Prometheus metrics registry.

use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::Registry,
};

/// Duration histogram buckets (in seconds).
/// Plugins run in-process, so the range starts at 50µs.
const DURATION_BUCKETS: [f64; 12] = [
    0.00005, 0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.1, 0.5, 2.5,
];

/// How an exchange left the chain.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// A plugin produced the response.
    Terminated,
    /// Every plugin continued; the default response was used.
    Exhausted,
    /// A plugin failed or panicked.
    Failed,
}

impl ExchangeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeOutcome::Terminated => "terminated",
            ExchangeOutcome::Exhausted => "exhausted",
            ExchangeOutcome::Failed => "failed",
        }
    }
}

/// Result of a bus submission.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum SubmitResult {
    Accepted,
    Overloaded,
    ShuttingDown,
}

impl SubmitResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmitResult::Accepted => "accepted",
            SubmitResult::Overloaded => "overloaded",
            SubmitResult::ShuttingDown => "shutting_down",
        }
    }
}

/// Exchange labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ExchangeLabels {
    pub outcome: String,
}

/// Plugin labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PluginLabels {
    pub plugin: String,
}

/// Match cache lookup labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CacheLabels {
    pub plugin: String,
    pub result: String,
}

/// Bus submission labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SubmissionLabels {
    pub bus: String,
    pub result: String,
}

/// Bus labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BusLabels {
    pub bus: String,
}

/// Metrics registry holding all Rampart metrics.
pub struct MetricsRegistry {
    /// The prometheus-client registry for encoding.
    pub registry: Registry,

    // Exchange metrics
    pub exchanges_total: Family<ExchangeLabels, Counter>,

    // Plugin metrics
    pub plugin_duration_seconds: Family<PluginLabels, Histogram>,
    pub plugin_short_circuits_total: Family<PluginLabels, Counter>,
    pub plugin_faults_total: Family<PluginLabels, Counter>,
    pub plugin_handoffs_total: Family<PluginLabels, Counter>,

    // Match cache metrics
    pub match_cache_lookups_total: Family<CacheLabels, Counter>,

    // Bus metrics
    pub bus_submissions_total: Family<SubmissionLabels, Counter>,
    pub bus_processed_total: Family<BusLabels, Counter>,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all metrics registered.
    ///
    /// Counter names are registered without the `_total` suffix; the text
    /// encoder appends it.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let exchanges_total = Family::<ExchangeLabels, Counter>::default();
        registry.register(
            "rampart_exchanges",
            "Total number of exchanges that left the plugin chain",
            exchanges_total.clone(),
        );

        let plugin_duration_seconds =
            Family::<PluginLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(DURATION_BUCKETS.iter().cloned())
            });
        registry.register(
            "rampart_plugin_duration_seconds",
            "Plugin execution duration in seconds",
            plugin_duration_seconds.clone(),
        );

        let plugin_short_circuits_total = Family::<PluginLabels, Counter>::default();
        registry.register(
            "rampart_plugin_short_circuits",
            "Total number of exchanges terminated by a plugin",
            plugin_short_circuits_total.clone(),
        );

        let plugin_faults_total = Family::<PluginLabels, Counter>::default();
        registry.register(
            "rampart_plugin_faults",
            "Total number of plugin failures and panics",
            plugin_faults_total.clone(),
        );

        let plugin_handoffs_total = Family::<PluginLabels, Counter>::default();
        registry.register(
            "rampart_plugin_handoffs",
            "Total number of exchanges a plugin handed off the worker",
            plugin_handoffs_total.clone(),
        );

        let match_cache_lookups_total = Family::<CacheLabels, Counter>::default();
        registry.register(
            "rampart_match_cache_lookups",
            "Match cache lookups by plugin and result",
            match_cache_lookups_total.clone(),
        );

        let bus_submissions_total = Family::<SubmissionLabels, Counter>::default();
        registry.register(
            "rampart_bus_submissions",
            "Event bus submissions by bus and result",
            bus_submissions_total.clone(),
        );

        let bus_processed_total = Family::<BusLabels, Counter>::default();
        registry.register(
            "rampart_bus_processed",
            "Events handled by bus consumers",
            bus_processed_total.clone(),
        );

        Self {
            registry,
            exchanges_total,
            plugin_duration_seconds,
            plugin_short_circuits_total,
            plugin_faults_total,
            plugin_handoffs_total,
            match_cache_lookups_total,
            bus_submissions_total,
            bus_processed_total,
        }
    }

    /// Record an exchange leaving the chain.
    pub fn record_exchange(&self, outcome: ExchangeOutcome) {
        let labels = ExchangeLabels {
            outcome: outcome.as_str().to_string(),
        };
        self.exchanges_total.get_or_create(&labels).inc();
    }

    /// Record a plugin invocation.
    pub fn record_plugin(&self, plugin: &str, duration_secs: f64, short_circuit: bool) {
        let labels = PluginLabels {
            plugin: plugin.to_string(),
        };
        self.plugin_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
        if short_circuit {
            self.plugin_short_circuits_total
                .get_or_create(&labels)
                .inc();
        }
    }

    /// Record a plugin fault.
    pub fn record_plugin_fault(&self, plugin: &str) {
        let labels = PluginLabels {
            plugin: plugin.to_string(),
        };
        self.plugin_faults_total.get_or_create(&labels).inc();
    }

    /// Record an exchange handed off the worker while a plugin awaits a
    /// downstream call.
    pub fn record_handoff(&self, plugin: &str) {
        let labels = PluginLabels {
            plugin: plugin.to_string(),
        };
        self.plugin_handoffs_total.get_or_create(&labels).inc();
    }

    /// Record a match cache lookup.
    pub fn record_cache_lookup(&self, plugin: &str, hit: bool) {
        let labels = CacheLabels {
            plugin: plugin.to_string(),
            result: if hit { "hit" } else { "miss" }.to_string(),
        };
        self.match_cache_lookups_total.get_or_create(&labels).inc();
    }

    /// Record a bus submission attempt.
    pub fn record_submission(&self, bus: &str, result: SubmitResult) {
        let labels = SubmissionLabels {
            bus: bus.to_string(),
            result: result.as_str().to_string(),
        };
        self.bus_submissions_total.get_or_create(&labels).inc();
    }

    /// Record an event handled by a bus consumer.
    pub fn record_processed(&self, bus: &str) {
        let labels = BusLabels {
            bus: bus.to_string(),
        };
        self.bus_processed_total.get_or_create(&labels).inc();
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
