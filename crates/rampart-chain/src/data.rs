//! Configuration snapshots: selectors, rules and per-plugin data.
//!
//! These are immutable once published. The engine and the match cache hold
//! them behind `Arc`.

use crate::condition::{Condition, Field, MatchMode};
use crate::request::InboundRequest;
use rampart_cache::EstimateSize;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::mem::size_of;

/// String-keyed plugin options attached to a selector or rule.
pub type Handle = BTreeMap<String, Value>;

fn default_true() -> bool {
    true
}

/// Selects which requests a plugin cares about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorData {
    pub id: String,
    #[serde(default, alias = "plugin")]
    pub plugin_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub match_mode: MatchMode,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// When false the plugin runs with the selector's own handle and rule
    /// matching is skipped.
    #[serde(default = "default_true")]
    pub continued: bool,
    #[serde(default)]
    pub sort: i32,
    #[serde(default)]
    pub handle: Handle,
    #[serde(default)]
    pub rules: Vec<RuleData>,
}

impl SelectorData {
    pub fn new(id: impl Into<String>, plugin_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            plugin_name: plugin_name.into(),
            name: String::new(),
            match_mode: MatchMode::default(),
            conditions: Vec::new(),
            enabled: true,
            continued: true,
            sort: 0,
            handle: Handle::new(),
            rules: Vec::new(),
        }
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_rule(mut self, rule: RuleData) -> Self {
        self.rules.push(rule);
        self
    }

    /// Sort rules by `sort` (stable) and stamp every rule with this
    /// selector's id.
    pub fn normalized(mut self) -> Self {
        self.rules.sort_by_key(|r| r.sort);
        for rule in &mut self.rules {
            rule.selector_id = self.id.clone();
        }
        self
    }

    pub fn matches(&self, request: &InboundRequest) -> bool {
        self.match_mode.evaluate(&self.conditions, request)
    }

    /// Whether every condition looks at the request path only, so the
    /// outcome of [`matches`](Self::matches) is a function of the path.
    pub fn matches_on_path_only(&self) -> bool {
        self.conditions.iter().all(|c| c.field == Field::Path)
    }

    /// First enabled rule, by ascending `sort`, whose conditions hold.
    pub fn matching_rule(&self, request: &InboundRequest) -> Option<&RuleData> {
        self.matching_rule_index(request).and_then(|i| self.rules.get(i))
    }

    pub fn matching_rule_index(&self, request: &InboundRequest) -> Option<usize> {
        self.rules
            .iter()
            .enumerate()
            .filter(|(_, r)| r.enabled && r.matches(request))
            .min_by_key(|(_, r)| r.sort)
            .map(|(i, _)| i)
    }

    /// Rule standing in for the selector when rule matching is skipped.
    pub fn default_rule(&self) -> RuleData {
        RuleData {
            id: format!("{}#default", self.id),
            selector_id: self.id.clone(),
            name: self.name.clone(),
            match_mode: MatchMode::And,
            conditions: Vec::new(),
            enabled: true,
            sort: 0,
            handle: self.handle.clone(),
        }
    }

    pub fn handle_value(&self, key: &str) -> Option<&Value> {
        self.handle.get(key)
    }
}

/// A finer-grained match inside a selector, carrying the plugin's options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleData {
    pub id: String,
    #[serde(default)]
    pub selector_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub match_mode: MatchMode,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub sort: i32,
    #[serde(default)]
    pub handle: Handle,
}

impl RuleData {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            selector_id: String::new(),
            name: String::new(),
            match_mode: MatchMode::default(),
            conditions: Vec::new(),
            enabled: true,
            sort: 0,
            handle: Handle::new(),
        }
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_handle(mut self, key: &str, value: Value) -> Self {
        self.handle.insert(key.to_string(), value);
        self
    }

    pub fn with_sort(mut self, sort: i32) -> Self {
        self.sort = sort;
        self
    }

    pub fn matches(&self, request: &InboundRequest) -> bool {
        self.match_mode.evaluate(&self.conditions, request)
    }

    pub fn handle_value(&self, key: &str) -> Option<&Value> {
        self.handle.get(key)
    }

    pub fn handle_str(&self, key: &str) -> Option<&str> {
        self.handle.get(key)?.as_str()
    }

    pub fn handle_u64(&self, key: &str) -> Option<u64> {
        self.handle.get(key)?.as_u64()
    }
}

/// Live per-plugin configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginData {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Match cache budget; the gateway default applies when unset.
    #[serde(default)]
    pub cache_budget_bytes: Option<u64>,
    #[serde(default)]
    pub options: Handle,
}

impl PluginData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            cache_budget_bytes: None,
            options: Handle::new(),
        }
    }

    pub fn cache_budget(&self, default: u64) -> u64 {
        self.cache_budget_bytes.unwrap_or(default)
    }
}

fn json_size(value: &Value) -> usize {
    size_of::<Value>()
        + match value {
            Value::String(s) => s.capacity(),
            Value::Array(items) => items.iter().map(json_size).sum(),
            Value::Object(map) => map.iter().map(|(k, v)| k.capacity() + json_size(v)).sum(),
            Value::Null | Value::Bool(_) | Value::Number(_) => 0,
        }
}

fn handle_size(handle: &Handle) -> usize {
    handle
        .iter()
        .map(|(k, v)| k.estimated_size() + json_size(v))
        .sum()
}

fn conditions_size(conditions: &[Condition]) -> usize {
    conditions
        .iter()
        .map(|c| size_of::<Condition>() + c.value.capacity() + c.key.as_ref().map_or(0, String::capacity))
        .sum()
}

impl EstimateSize for RuleData {
    fn estimated_size(&self) -> usize {
        size_of::<Self>()
            + self.id.capacity()
            + self.selector_id.capacity()
            + self.name.capacity()
            + conditions_size(&self.conditions)
            + handle_size(&self.handle)
    }
}

impl EstimateSize for SelectorData {
    fn estimated_size(&self) -> usize {
        size_of::<Self>()
            + self.id.capacity()
            + self.plugin_name.capacity()
            + self.name.capacity()
            + conditions_size(&self.conditions)
            + handle_size(&self.handle)
            + self.rules.iter().map(EstimateSize::estimated_size).sum::<usize>()
    }
}
