//! The unit of work flowing through the chain.

use crate::attributes::{keys, Attributes};
use crate::plugin::PluginList;
use crate::request::InboundRequest;
use rampart_telemetry::TraceContext;
use std::fmt;
use std::sync::Arc;

/// Where an exchange is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Pending,
    /// Resolving selector and rule for the plugin at this index.
    Matching(usize),
    /// Running the plugin at this index.
    Executing(usize),
    /// The plugin at this index handed off a downstream call.
    Suspended(usize),
    /// A plugin produced the response.
    Terminated,
    /// Every plugin continued.
    Exhausted,
    /// A plugin failed or panicked.
    Failed,
}

impl ExchangeState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            ExchangeState::Terminated | ExchangeState::Exhausted | ExchangeState::Failed
        )
    }
}

/// An inbound request plus everything the chain accumulates for it.
///
/// Owned by one worker at a time and moved, never shared.
pub struct Exchange {
    request: InboundRequest,
    attributes: Attributes,
    plugins: Arc<PluginList>,
    stamped: bool,
    position: usize,
    state: ExchangeState,
}

impl Exchange {
    /// Wrap a request. Its trace context is derived from the headers.
    pub fn new(request: InboundRequest) -> Self {
        let mut attributes = Attributes::new();
        attributes.insert(keys::TRACE, TraceContext::from_headers(&request.headers));
        Self {
            request,
            attributes,
            plugins: Arc::new(PluginList::default()),
            stamped: false,
            position: 0,
            state: ExchangeState::Pending,
        }
    }

    pub fn request(&self) -> &InboundRequest {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut InboundRequest {
        &mut self.request
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut Attributes {
        &mut self.attributes
    }

    pub fn trace(&self) -> Option<&TraceContext> {
        self.attributes.get::<TraceContext>(keys::TRACE)
    }

    pub fn trace_id(&self) -> &str {
        self.trace().map_or("-", |t| t.trace_id.as_str())
    }

    /// The plugin snapshot this exchange runs against.
    pub fn plugins(&self) -> &Arc<PluginList> {
        &self.plugins
    }

    pub fn has_plugins(&self) -> bool {
        self.stamped
    }

    /// Pin the plugin list for this exchange. Later hot swaps do not affect
    /// it.
    pub fn set_plugins(&mut self, plugins: Arc<PluginList>) {
        self.plugins = plugins;
        self.stamped = true;
    }

    /// Index of the next plugin to run.
    pub fn chain_position(&self) -> usize {
        self.position
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ExchangeState) {
        self.state = state;
    }

    pub(crate) fn advance_past(&mut self, index: usize) {
        self.position = index + 1;
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("method", &self.request.method)
            .field("path", &self.request.path)
            .field("trace_id", &self.trace_id())
            .field("position", &self.position)
            .field("state", &self.state)
            .field("attributes", &self.attributes)
            .finish()
    }
}
