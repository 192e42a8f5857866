//! The plugin seam.

use crate::data::{RuleData, SelectorData};
use crate::error::PluginError;
use crate::exchange::Exchange;
use crate::response::GatewayResponse;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// A policy handler in the chain.
///
/// Implementations must not keep per-request state on `self`; anything an
/// exchange needs across calls goes into its attribute bag.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Stable name, used to look up plugin data, selectors and the cache.
    fn name(&self) -> &str;

    /// Execution order; lower runs first.
    fn priority(&self) -> i32;

    /// Cheap pre-check; returning false skips the plugin.
    fn applies_to(&self, _exchange: &Exchange) -> bool {
        true
    }

    /// Whether the plugin only runs with a matched selector and rule.
    fn requires_selector(&self) -> bool {
        true
    }

    /// Handle the exchange.
    ///
    /// Continue by returning `next.proceed()` (or `next.skip()`), or stop the
    /// chain with [`Flow::Respond`]. A plugin that has to wait on a
    /// downstream call returns [`Flow::Handoff`] instead of awaiting it here,
    /// which would stall every exchange queued on the same partition.
    async fn execute(
        &self,
        exchange: &mut Exchange,
        next: Next,
        selector: Option<&SelectorData>,
        rule: Option<&RuleData>,
    ) -> Result<Flow, PluginError>;
}

/// Continuation token for one plugin invocation.
///
/// Only the engine creates these, so a plugin can only continue the chain
/// by handing back the token it was given.
#[derive(Debug)]
pub struct Next {
    position: usize,
}

impl Next {
    pub(crate) fn new(position: usize) -> Self {
        Self { position }
    }

    /// Continue with the next plugin.
    pub fn proceed(self) -> Flow {
        Flow::Continue(self)
    }

    /// Continue, recording that this plugin did nothing.
    pub fn skip(self) -> Flow {
        Flow::Skip(self)
    }

    /// Index of the plugin this token was issued to.
    pub fn position(&self) -> usize {
        self.position
    }
}

/// What a plugin decided.
#[derive(Debug)]
pub enum Flow {
    Continue(Next),
    Skip(Next),
    Respond(GatewayResponse),
    /// Stop the chain; the response is produced later by the future.
    Handoff(Handoff),
}

impl Flow {
    pub fn respond(response: GatewayResponse) -> Self {
        Flow::Respond(response)
    }

    pub fn handoff<F>(future: F) -> Self
    where
        F: Future<Output = Result<GatewayResponse, PluginError>> + Send + 'static,
    {
        Flow::Handoff(Handoff::new(future))
    }
}

/// Downstream work that finishes off the partition worker.
///
/// The future owns everything it needs: it cannot borrow the exchange,
/// which stays with the gateway until the response is delivered.
pub struct Handoff(BoxFuture<'static, Result<GatewayResponse, PluginError>>);

impl Handoff {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<GatewayResponse, PluginError>> + Send + 'static,
    {
        Self(Box::pin(future))
    }

    pub fn into_future(self) -> BoxFuture<'static, Result<GatewayResponse, PluginError>> {
        self.0
    }
}

impl fmt::Debug for Handoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Handoff(..)")
    }
}

/// An immutable, priority-ordered plugin list.
#[derive(Clone, Default)]
pub struct PluginList {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginList {
    /// Order by ascending priority; equal priorities keep their
    /// registration order.
    pub fn new(mut plugins: Vec<Arc<dyn Plugin>>) -> Self {
        plugins.sort_by_key(|p| p.priority());
        Self { plugins }
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<dyn Plugin>> {
        self.plugins.get(index)
    }

    pub fn named(&self, name: &str) -> Option<&Arc<dyn Plugin>> {
        self.plugins.iter().find(|p| p.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Plugin>> {
        self.plugins.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name().to_string()).collect()
    }
}

impl fmt::Debug for PluginList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.plugins.iter().map(|p| (p.name(), p.priority())))
            .finish()
    }
}
