//! Structured logging with JSON output.
//!
//! Library crates only emit `tracing` events; the binary calls
//! [`init_logging`] exactly once at process start.

use crate::{LogFormat, TelemetryConfig, TelemetryError};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber.
///
/// Fails if the level directives do not parse or a subscriber is already
/// installed.
pub fn init_logging(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level)
            .map_err(|e| TelemetryError::InvalidFilter(e.to_string()))?,
    };

    tracing_subscriber::registry()
        .with(format_layer(config).with_filter(filter))
        .try_init()
        .map_err(|e| TelemetryError::LoggingInit(e.to_string()))
}

fn format_layer(config: &TelemetryConfig) -> BoxedLayer {
    match config.log_format {
        LogFormat::Json => fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .with_thread_names(config.thread_names)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .with_thread_names(config.thread_names)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_names(config.thread_names)
            .boxed(),
    }
}

/// Standard log event names.
///
/// Every structured event carries one of these in its `event` field so that
/// log pipelines can filter without parsing messages.
pub mod events {
    /// Gateway is starting up.
    pub const STARTUP: &str = "startup";

    /// Gateway is shutting down.
    pub const SHUTDOWN: &str = "shutdown";

    /// Gateway is listening on a port.
    pub const LISTENING: &str = "listening";

    /// Configuration was loaded or reloaded.
    pub const CONFIG_LOADED: &str = "config_loaded";

    /// Configuration reload was rejected; the previous config stays active.
    pub const CONFIG_RELOAD_FAILED: &str = "config_reload_failed";

    /// The plugin list was replaced.
    pub const PLUGINS_SWAPPED: &str = "plugins_swapped";

    /// A plugin terminated the exchange with a response.
    pub const PLUGIN_SHORT_CIRCUIT: &str = "plugin_short_circuit";

    /// A plugin failed or panicked while executing.
    pub const PLUGIN_FAULT: &str = "plugin_fault";

    /// A plugin handed a downstream call off the partition worker.
    pub const PLUGIN_HANDOFF: &str = "plugin_handoff";

    /// A handed-off exchange was dropped by a forced shutdown.
    pub const HANDOFF_ABANDONED: &str = "handoff_abandoned";

    /// No plugin produced a response.
    pub const CHAIN_EXHAUSTED: &str = "chain_exhausted";

    /// A per-plugin match cache was dropped.
    pub const MATCH_CACHE_INVALIDATED: &str = "match_cache_invalidated";

    /// All match caches were dropped.
    pub const MATCH_CACHE_CLEARED: &str = "match_cache_cleared";

    /// A bus partition rejected a submission because its ring was full.
    pub const BUS_OVERLOADED: &str = "bus_overloaded";

    /// A bus worker thread started.
    pub const BUS_WORKER_STARTED: &str = "bus_worker_started";

    /// A bus worker thread stopped.
    pub const BUS_WORKER_STOPPED: &str = "bus_worker_stopped";

    /// A response could not be handed to the response bus.
    pub const RESPONSE_ABANDONED: &str = "response_abandoned";

    /// A response was written back to the front door.
    pub const RESPONSE_WRITTEN: &str = "response_written";

    /// The client went away before its response was written.
    pub const CLIENT_DISCONNECTED: &str = "client_disconnected";

    /// A sampled request finished; emitted by the access-log plugin.
    pub const ACCESS_LOG: &str = "access_log";

    /// Shutdown finished (drained, forced or timed out).
    pub const SHUTDOWN_COMPLETE: &str = "shutdown_complete";
}

/// Helper macros for structured logging with standard fields.
///
/// These wrap the tracing macros to ensure consistent field naming.
#[macro_export]
macro_rules! log_startup {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::STARTUP,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_shutdown {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::SHUTDOWN,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_listening {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::LISTENING,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_plugin_short_circuit {
    ($($field:tt)*) => {
        tracing::debug!(
            event = $crate::logging::events::PLUGIN_SHORT_CIRCUIT,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_plugin_fault {
    ($($field:tt)*) => {
        tracing::error!(
            event = $crate::logging::events::PLUGIN_FAULT,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_bus_overloaded {
    ($($field:tt)*) => {
        tracing::warn!(
            event = $crate::logging::events::BUS_OVERLOADED,
            $($field)*
        )
    };
}
