//! Plugin chain engine for the Rampart gateway.
//!
//! An [`Exchange`] walks an ordered, prioritized list of [`Plugin`]s. For
//! each plugin the engine resolves the matching selector and rule (through
//! the [`MatchCache`](rampart_cache::MatchCache) and the [`ConfigStore`]),
//! invokes it, and either moves on or stops with the plugin's response.

pub mod attributes;
pub mod condition;
pub mod data;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod plugin;
pub mod request;
pub mod response;
pub mod store;

pub use attributes::{keys, Attributes};
pub use condition::{Condition, Field, MatchMode, Operator};
pub use data::{PluginData, RuleData, SelectorData};
pub use engine::{ChainOutcome, ChainRun, ChainSettings, PluginChain, Suspended};
pub use error::PluginError;
pub use exchange::{Exchange, ExchangeState};
pub use plugin::{Flow, Handoff, Next, Plugin, PluginList};
pub use request::InboundRequest;
pub use response::GatewayResponse;
pub use store::ConfigStore;

// Re-exported so plugin crates do not need a direct dependency.
pub use async_trait::async_trait;
