//! Entry weighing.
//!
//! A cache instance runs under exactly one [`CapacityPolicy`]. Under
//! `Memory` every entry weighs its estimated byte size and the budget is a
//! byte count; under `Entries` every entry weighs 1 and the budget is an
//! entry count.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::mem::size_of;
use std::sync::Arc;

/// Fixed per-entry bookkeeping cost added to the key and value estimates.
///
/// Accounts for the policy node, the segment slot and the map slot.
pub const ENTRY_OVERHEAD: usize = 64;

/// How a cache measures its footprint against its budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapacityPolicy {
    /// Budget is bytes; weight is the estimated size of key + value.
    #[default]
    Memory,
    /// Budget is an entry count; every entry weighs 1.
    Entries,
}

impl CapacityPolicy {
    /// Parse from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "entries" => Some(Self::Entries),
            _ => None,
        }
    }

    /// Weight of one entry under this policy.
    pub fn weigh<K, V>(&self, key: &K, value: &V) -> u64
    where
        K: EstimateSize + ?Sized,
        V: EstimateSize + ?Sized,
    {
        match self {
            CapacityPolicy::Memory => {
                (key.estimated_size() + value.estimated_size() + ENTRY_OVERHEAD) as u64
            }
            CapacityPolicy::Entries => 1,
        }
    }
}

/// Approximate memory footprint of a value, in bytes.
///
/// Estimates include the inline size of the value plus whatever it owns on
/// the heap. They do not need to be exact, only stable for a given value.
pub trait EstimateSize {
    fn estimated_size(&self) -> usize;
}

macro_rules! inline_size {
    ($($t:ty),*) => {
        $(impl EstimateSize for $t {
            fn estimated_size(&self) -> usize {
                size_of::<$t>()
            }
        })*
    };
}

inline_size!(bool, u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, f32, f64, char);

impl EstimateSize for str {
    fn estimated_size(&self) -> usize {
        self.len()
    }
}

impl EstimateSize for String {
    fn estimated_size(&self) -> usize {
        size_of::<String>() + self.capacity()
    }
}

impl<T: EstimateSize> EstimateSize for Vec<T> {
    fn estimated_size(&self) -> usize {
        size_of::<Vec<T>>()
            + self.iter().map(EstimateSize::estimated_size).sum::<usize>()
            + (self.capacity() - self.len()) * size_of::<T>()
    }
}

impl<T: EstimateSize> EstimateSize for Option<T> {
    fn estimated_size(&self) -> usize {
        match self {
            Some(v) => v.estimated_size().max(size_of::<Self>()),
            None => size_of::<Self>(),
        }
    }
}

impl<T: EstimateSize + ?Sized> EstimateSize for Arc<T> {
    fn estimated_size(&self) -> usize {
        // strong + weak counts
        2 * size_of::<usize>() + self.as_ref().estimated_size()
    }
}

impl<T: EstimateSize + ?Sized> EstimateSize for Box<T> {
    fn estimated_size(&self) -> usize {
        size_of::<usize>() + self.as_ref().estimated_size()
    }
}

impl<K: EstimateSize, V: EstimateSize, S> EstimateSize for HashMap<K, V, S> {
    fn estimated_size(&self) -> usize {
        size_of::<Self>()
            + self
                .iter()
                .map(|(k, v)| k.estimated_size() + v.estimated_size())
                .sum::<usize>()
    }
}

impl<K: EstimateSize, V: EstimateSize> EstimateSize for BTreeMap<K, V> {
    fn estimated_size(&self) -> usize {
        size_of::<Self>()
            + self
                .iter()
                .map(|(k, v)| k.estimated_size() + v.estimated_size())
                .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_parse() {
        assert_eq!(CapacityPolicy::parse("memory"), Some(CapacityPolicy::Memory));
        assert_eq!(CapacityPolicy::parse("Entries"), Some(CapacityPolicy::Entries));
        assert_eq!(CapacityPolicy::parse("slots"), None);
    }

    #[test]
    fn test_entries_policy_weighs_one() {
        let key = "x".repeat(500);
        let value = "y".repeat(500);
        assert_eq!(CapacityPolicy::Entries.weigh(&key, &value), 1);
    }

    #[test]
    fn test_memory_policy_grows_with_content() {
        let small = CapacityPolicy::Memory.weigh("/a", &"v".to_string());
        let large = CapacityPolicy::Memory.weigh("/a", &"v".repeat(256));
        assert!(small >= ENTRY_OVERHEAD as u64);
        assert!(large >= small + 255);
    }

    #[test]
    fn test_map_estimate_counts_entries() {
        let mut map = HashMap::new();
        let empty = map.estimated_size();
        map.insert("status".to_string(), "200".to_string());
        assert!(map.estimated_size() > empty);
    }
}
