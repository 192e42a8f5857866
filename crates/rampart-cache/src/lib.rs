//! Match cache for the Rampart gateway.
//!
//! Selector lookups on the request path are answered from a per-plugin
//! Window TinyLFU cache whose footprint is bounded by a byte budget (or an
//! entry count, see [`CapacityPolicy`]).
//!
//! # Usage
//!
//! ```ignore
//! use rampart_cache::{CapacityPolicy, MatchCache};
//!
//! let cache = MatchCache::new(CapacityPolicy::Memory);
//! cache.put("auth", "/login", Arc::new(selector), 1 << 20);
//! let hit = cache.get("auth", "/login");
//! ```

pub mod match_cache;
mod policy;
pub mod sketch;
pub mod tinylfu;
pub mod weigh;

pub use match_cache::MatchCache;
pub use sketch::FrequencySketch;
pub use tinylfu::{CacheStats, TinyLfuCache};
pub use weigh::{CapacityPolicy, EstimateSize, ENTRY_OVERHEAD};
