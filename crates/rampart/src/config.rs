//! Gateway configuration file (`rampart.toml`).
//!
//! Every section and field is optional; an empty file is a valid
//! configuration that listens on the default port with no selectors.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rampart_bus::BusConfig;
use rampart_cache::CapacityPolicy;
use rampart_chain::{ChainSettings, PluginData, SelectorData};
use rampart_telemetry::{LogFormat, TelemetryConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest accepted match cache budget (1 TiB, or that many entries).
pub const MAX_CACHE_BUDGET: u64 = 1 << 40;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("configuration rejected: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerSection,
    pub bus: BusSection,
    pub cache: CacheSection,
    pub shutdown: ShutdownSection,
    pub telemetry: TelemetrySection,
    pub plugins: Vec<PluginData>,
    pub selectors: Vec<SelectorData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub listen: String,
    /// Include error details in fault responses.
    pub dev: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:9195".to_string(),
            dev: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSection {
    pub request_partitions: usize,
    pub response_partitions: usize,
    /// Ring size of every partition; a power of two.
    pub capacity: usize,
    pub submit_wait_ms: u64,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            request_partitions: 4,
            response_partitions: 4,
            capacity: 1024,
            submit_wait_ms: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub policy: CapacityPolicy,
    /// Per-plugin budget for plugins without `cache_budget_bytes`.
    pub default_budget_bytes: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            policy: CapacityPolicy::Memory,
            default_budget_bytes: 1 << 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownSection {
    pub grace_period_ms: u64,
}

impl Default for ShutdownSection {
    fn default() -> Self {
        Self {
            grace_period_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
        }
    }
}

impl GatewayConfig {
    /// Read, parse and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: GatewayConfig = toml::from_str(content)?;
        config.selectors = config
            .selectors
            .into_iter()
            .map(SelectorData::normalized)
            .collect();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Validation(msg));

        if self.listen_addr().is_none() {
            return invalid(format!("server.listen is not a socket address: {}", self.server.listen));
        }
        if self.bus.request_partitions == 0 || self.bus.response_partitions == 0 {
            return invalid("bus partitions must be greater than zero".to_string());
        }
        if self.bus.capacity == 0 || !self.bus.capacity.is_power_of_two() {
            return invalid(format!(
                "bus.capacity must be a non-zero power of two, got {}",
                self.bus.capacity
            ));
        }
        if self.cache.default_budget_bytes == 0 {
            return invalid("cache.default_budget_bytes must be greater than zero".to_string());
        }
        if self.cache.default_budget_bytes > MAX_CACHE_BUDGET {
            return invalid(format!(
                "cache.default_budget_bytes must not exceed {MAX_CACHE_BUDGET}"
            ));
        }

        let mut plugin_names = HashSet::new();
        for plugin in &self.plugins {
            if plugin.name.is_empty() {
                return invalid("plugin entry without a name".to_string());
            }
            if !plugin_names.insert(plugin.name.as_str()) {
                return invalid(format!("plugin '{}' is configured twice", plugin.name));
            }
            match plugin.cache_budget_bytes {
                Some(0) => {
                    return invalid(format!("plugin '{}' has a zero cache budget", plugin.name))
                }
                Some(budget) if budget > MAX_CACHE_BUDGET => {
                    return invalid(format!(
                        "plugin '{}' cache budget must not exceed {MAX_CACHE_BUDGET}",
                        plugin.name
                    ))
                }
                _ => {}
            }
        }

        let mut selector_ids = HashSet::new();
        for selector in &self.selectors {
            if selector.id.is_empty() {
                return invalid("selector without an id".to_string());
            }
            if selector.plugin_name.is_empty() {
                return invalid(format!("selector '{}' names no plugin", selector.id));
            }
            if !selector_ids.insert(selector.id.as_str()) {
                return invalid(format!("selector id '{}' is used twice", selector.id));
            }
            let mut rule_ids = HashSet::new();
            for rule in &selector.rules {
                if rule.id.is_empty() || !rule_ids.insert(rule.id.as_str()) {
                    return invalid(format!(
                        "selector '{}' has a rule with a missing or duplicate id",
                        selector.id
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.server.listen.parse().ok()
    }

    pub fn request_bus(&self) -> BusConfig {
        BusConfig::new("rampart-req")
            .with_partitions(self.bus.request_partitions)
            .with_capacity(self.bus.capacity)
            .with_submit_wait(Duration::from_millis(self.bus.submit_wait_ms))
    }

    pub fn response_bus(&self) -> BusConfig {
        BusConfig::new("rampart-resp")
            .with_partitions(self.bus.response_partitions)
            .with_capacity(self.bus.capacity)
            .with_submit_wait(Duration::from_millis(self.bus.submit_wait_ms))
    }

    pub fn chain_settings(&self) -> ChainSettings {
        ChainSettings {
            default_budget: self.cache.default_budget_bytes,
            dev_mode: self.server.dev,
        }
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig::new()
            .with_log_level(self.telemetry.log_level.clone())
            .with_log_format(self.telemetry.log_format)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown.grace_period_ms)
    }

    /// Options of one configured plugin.
    pub fn plugin(&self, name: &str) -> Option<&PluginData> {
        self.plugins.iter().find(|p| p.name == name)
    }
}
