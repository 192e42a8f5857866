//! Per-exchange attribute bag.
//!
//! Values are type-erased; lookups downcast to the requested type and
//! return `None` on a type mismatch.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

/// Well-known attribute keys.
pub mod keys {
    /// [`rampart_telemetry::TraceContext`] of the exchange.
    pub const TRACE: &str = "rampart.trace";

    /// Id of the selector matched by the last plugin that ran (`String`).
    pub const MATCHED_SELECTOR: &str = "rampart.matched_selector";

    /// Id of the rule matched by the last plugin that ran (`String`).
    pub const MATCHED_RULE: &str = "rampart.matched_rule";

    /// Completion sink installed by the front door.
    pub const COMPLETION: &str = "rampart.completion";

    /// Key under which a plugin keeps its own per-exchange state.
    pub fn plugin_state(plugin: &str) -> String {
        format!("plugin.{plugin}")
    }
}

#[derive(Default)]
pub struct Attributes {
    values: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, replacing any previous value under `key`.
    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Box::new(value));
    }

    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.values.get(key)?.downcast_ref::<T>()
    }

    pub fn get_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        self.values.get_mut(key)?.downcast_mut::<T>()
    }

    /// Remove and return a value. A value of another type stays in place.
    pub fn take<T: Any>(&mut self, key: &str) -> Option<T> {
        if !self.values.get(key)?.is::<T>() {
            return None;
        }
        let boxed = self.values.remove(key)?;
        boxed.downcast::<T>().ok().map(|b| *b)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.keys().collect();
        keys.sort_unstable();
        f.debug_struct("Attributes").field("keys", &keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_roundtrip() {
        let mut attrs = Attributes::new();
        attrs.insert("count", 3u32);
        assert_eq!(attrs.get::<u32>("count"), Some(&3));
        assert_eq!(attrs.get::<String>("count"), None);
    }

    #[test]
    fn test_get_mut() {
        let mut attrs = Attributes::new();
        attrs.insert("list", vec![1, 2]);
        if let Some(list) = attrs.get_mut::<Vec<i32>>("list") {
            list.push(3);
        }
        assert_eq!(attrs.get::<Vec<i32>>("list"), Some(&vec![1, 2, 3]));
    }

    #[test]
    fn test_take_wrong_type_keeps_value() {
        let mut attrs = Attributes::new();
        attrs.insert("id", "sel-1".to_string());
        assert_eq!(attrs.take::<u64>("id"), None);
        assert!(attrs.contains("id"));
        assert_eq!(attrs.take::<String>("id"), Some("sel-1".to_string()));
        assert!(attrs.is_empty());
    }

    #[test]
    fn test_plugin_state_key() {
        assert_eq!(keys::plugin_state("access-log"), "plugin.access-log");
    }
}
