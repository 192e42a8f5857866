//! `access-log` plugin.
//!
//! Decides per exchange whether the request is sampled and, if so, records
//! the request line and masked headers in the exchange's attribute bag. The
//! response handler calls [`emit`] once the response is known. The plugin
//! instance itself holds only its options.

use std::collections::BTreeMap;
use std::time::Instant;

use rampart_chain::data::Handle;
use rampart_chain::{async_trait, keys, Exchange, Flow, GatewayResponse, Next, Plugin, PluginError, RuleData, SelectorData};
use rampart_telemetry::{events, ExchangeOutcome};

pub const NAME: &str = "access-log";

const MASK: &str = "******";

/// Per-exchange record kept under `plugin.access-log`.
#[derive(Debug, Clone)]
pub struct AccessLogState {
    pub method: String,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub started: Instant,
}

#[derive(Debug, Clone)]
pub struct AccessLogPlugin {
    priority: i32,
    sample_rate: f64,
    mask_keywords: Vec<String>,
}

impl Default for AccessLogPlugin {
    fn default() -> Self {
        Self {
            priority: 0,
            sample_rate: 1.0,
            mask_keywords: vec!["authorization".to_string(), "cookie".to_string()],
        }
    }
}

impl AccessLogPlugin {
    /// Options: `sample_rate` (0.0 to 1.0), `mask` (header name keywords)
    /// and `priority`.
    pub fn from_options(options: &Handle) -> Result<Self, PluginError> {
        let mut plugin = Self::default();

        if let Some(rate) = options.get("sample_rate") {
            let rate = rate
                .as_f64()
                .filter(|r| (0.0..=1.0).contains(r))
                .ok_or_else(|| PluginError::invalid_handle("sample_rate", "expected a number between 0 and 1"))?;
            plugin.sample_rate = rate;
        }

        if let Some(mask) = options.get("mask") {
            let keywords = mask
                .as_array()
                .and_then(|items| {
                    items
                        .iter()
                        .map(|k| k.as_str().map(str::to_ascii_lowercase))
                        .collect::<Option<Vec<_>>>()
                })
                .ok_or_else(|| PluginError::invalid_handle("mask", "expected a list of strings"))?;
            plugin.mask_keywords = keywords;
        }

        if let Some(priority) = options.get("priority") {
            plugin.priority = priority
                .as_i64()
                .and_then(|p| i32::try_from(p).ok())
                .ok_or_else(|| PluginError::invalid_handle("priority", "expected an integer"))?;
        }
        Ok(plugin)
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    fn sampled(&self) -> bool {
        self.sample_rate >= 1.0 || (self.sample_rate > 0.0 && rand::random::<f64>() < self.sample_rate)
    }

    fn masked(&self, headers: &std::collections::HashMap<String, String>) -> BTreeMap<String, String> {
        headers
            .iter()
            .map(|(name, value)| {
                let lowered = name.to_ascii_lowercase();
                if self.mask_keywords.iter().any(|k| lowered.contains(k.as_str())) {
                    (lowered, MASK.to_string())
                } else {
                    (lowered, value.clone())
                }
            })
            .collect()
    }
}

#[async_trait]
impl Plugin for AccessLogPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn requires_selector(&self) -> bool {
        false
    }

    async fn execute(
        &self,
        exchange: &mut Exchange,
        next: Next,
        _selector: Option<&SelectorData>,
        _rule: Option<&RuleData>,
    ) -> Result<Flow, PluginError> {
        if self.sampled() {
            let request = exchange.request();
            let state = AccessLogState {
                method: request.method.clone(),
                path: request.path.clone(),
                headers: self.masked(&request.headers),
                started: Instant::now(),
            };
            exchange
                .attributes_mut()
                .insert(keys::plugin_state(NAME), state);
        }
        Ok(next.proceed())
    }
}

/// Write the access log line for a sampled exchange. No-op otherwise.
pub fn emit(exchange: &mut Exchange, response: &GatewayResponse, outcome: ExchangeOutcome) {
    let Some(state) = exchange
        .attributes_mut()
        .take::<AccessLogState>(&keys::plugin_state(NAME))
    else {
        return;
    };
    tracing::info!(
        event = events::ACCESS_LOG,
        trace_id = %exchange.trace_id(),
        method = %state.method,
        path = %state.path,
        status = response.status,
        outcome = outcome.as_str(),
        duration_ms = state.started.elapsed().as_millis() as u64,
        headers = ?state.headers,
    );
}
