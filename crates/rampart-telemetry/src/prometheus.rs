//! Text exposition of the metrics registry, served at `/__rampart/metrics`.

use crate::MetricsRegistry;
use prometheus_client::encoding::text::encode;
use std::fmt;

pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Typical exposition size with a handful of plugins and two buses.
const RENDER_CAPACITY: usize = 8 * 1024;

/// Write every registered family to `out`, terminated by `# EOF`.
pub fn write_metrics<W: fmt::Write>(registry: &MetricsRegistry, out: &mut W) -> fmt::Result {
    encode(out, &registry.registry)
}

/// Render the registry for a scrape. An encoding failure is logged and
/// yields an empty body.
pub fn render_metrics(registry: &MetricsRegistry) -> String {
    let mut body = String::with_capacity(RENDER_CAPACITY);
    match write_metrics(registry, &mut body) {
        Ok(()) => body,
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode metrics");
            String::new()
        }
    }
}
