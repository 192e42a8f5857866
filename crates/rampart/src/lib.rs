//! Rampart gateway assembly: configuration, the static config store, the
//! request/response handlers, handed-off exchanges, built-in plugins, hot
//! reload and the HTTP front door.

pub mod config;
pub mod gateway;
pub mod handlers;
pub mod handoff;
pub mod hot_reload;
pub mod plugins;
pub mod server;
pub mod store;

pub use config::{ConfigError, GatewayConfig};
pub use gateway::{Gateway, GatewayError};
pub use handlers::{Completion, CompletionSink, TransportError};
pub use handoff::Handoffs;
pub use store::StaticConfigStore;
