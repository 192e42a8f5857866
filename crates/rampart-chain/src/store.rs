//! Configuration store seam.

use crate::data::{PluginData, SelectorData};
use crate::request::InboundRequest;
use rampart_cache::MatchCache;
use std::sync::Arc;

/// Read side of the routing configuration.
///
/// Consulted by the engine on match cache misses. Implementations must be
/// cheap to call from many workers at once.
pub trait ConfigStore: Send + Sync {
    /// Live configuration of one plugin, if known.
    fn plugin(&self, name: &str) -> Option<Arc<PluginData>>;

    /// The selector of `plugin` with the lowest `sort` that matches
    /// `request`, if any.
    fn selector_for(&self, plugin: &str, request: &InboundRequest) -> Option<Arc<SelectorData>>;

    /// Whether the selector chosen for `plugin` depends on the request path
    /// alone. Only then may the engine cache it by path; a plugin with a
    /// selector on method, header or query is always resolved here.
    fn path_keyed(&self, _plugin: &str) -> bool {
        false
    }

    /// Hand the store the cache it must invalidate whenever the selectors
    /// or data of a plugin change. Called once by the gateway at startup.
    fn attach_cache(&self, _cache: Arc<MatchCache<SelectorData>>) {}
}
