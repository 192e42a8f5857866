//! Per-exchange trace identity.
//!
//! Every exchange carries a request id and a trace id so that log lines
//! emitted on different bus workers can be correlated.

use std::collections::HashMap;
use uuid::Uuid;

/// Header carrying the caller-provided request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// W3C trace context header.
pub const TRACEPARENT_HEADER: &str = "traceparent";

/// Trace identity of a single exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    /// Request ID (X-Request-Id header or generated UUID).
    pub request_id: String,

    /// Trace ID, taken from `traceparent` when present and well formed.
    pub trace_id: String,
}

impl TraceContext {
    /// Build a context from inbound request headers.
    ///
    /// Header names are expected in lowercase.
    pub fn from_headers(headers: &HashMap<String, String>) -> Self {
        let request_id = headers
            .get(REQUEST_ID_HEADER)
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| Uuid::now_v7().to_string());

        let trace_id = headers
            .get(TRACEPARENT_HEADER)
            .and_then(|v| parse_traceparent(v))
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        Self {
            request_id,
            trace_id,
        }
    }

    /// Create a fresh root context.
    pub fn new_root() -> Self {
        Self {
            request_id: Uuid::now_v7().to_string(),
            trace_id: Uuid::new_v4().simple().to_string(),
        }
    }

    /// Headers to attach to a response or an upstream call.
    pub fn propagation_headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert(REQUEST_ID_HEADER.to_string(), self.request_id.clone());
        headers
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new_root()
    }
}

/// Extract the trace-id field of a `version-traceid-parentid-flags` header.
fn parse_traceparent(value: &str) -> Option<String> {
    let mut parts = value.trim().split('-');
    let _version = parts.next()?;
    let trace_id = parts.next()?;
    let _parent = parts.next()?;
    let _flags = parts.next()?;

    let valid = trace_id.len() == 32
        && trace_id.chars().all(|c| c.is_ascii_hexdigit())
        && trace_id.chars().any(|c| c != '0');
    valid.then(|| trace_id.to_ascii_lowercase())
}
