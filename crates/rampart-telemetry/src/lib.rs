//! Observability for the Rampart gateway: structured logging with stable
//! event names, a Prometheus registry shared by the bus, the chain and the
//! front door, and per-exchange trace ids.
//!
//! ```ignore
//! use rampart_telemetry::{LogFormat, Telemetry, TelemetryConfig};
//!
//! let telemetry = Telemetry::init(TelemetryConfig::new().with_log_format(LogFormat::Pretty))?;
//! let bus_metrics = telemetry.metrics();
//! ```

pub mod config;
pub mod logging;
pub mod metrics;
pub mod prometheus;
pub mod trace;

pub use config::{LogFormat, TelemetryConfig, UnknownLogFormat};
pub use logging::events;
pub use metrics::{ExchangeOutcome, MetricsRegistry, SubmitResult};
pub use prometheus::PROMETHEUS_CONTENT_TYPE;
pub use trace::TraceContext;

use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid log level directives: {0}")]
    InvalidFilter(String),

    #[error("failed to initialize logging: {0}")]
    LoggingInit(String),
}

/// Process-wide telemetry: the installed subscriber plus one metrics
/// registry.
pub struct Telemetry {
    config: TelemetryConfig,
    metrics: Arc<MetricsRegistry>,
}

impl Telemetry {
    /// Install logging and create the registry. Call once per process.
    pub fn init(config: TelemetryConfig) -> Result<Self, TelemetryError> {
        logging::init_logging(&config)?;
        Ok(Self::without_logging(config))
    }

    /// Registry only; for tests and embedders that bring their own
    /// subscriber.
    pub fn without_logging(config: TelemetryConfig) -> Self {
        Self {
            config,
            metrics: Arc::new(MetricsRegistry::new()),
        }
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    /// A handle on the shared registry.
    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.metrics)
    }

    pub fn render(&self) -> String {
        prometheus::render_metrics(&self.metrics)
    }
}
