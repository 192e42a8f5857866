//! Responses produced by the chain.

use bytes::Bytes;
use std::collections::HashMap;

/// A complete response ready to be written by the front door.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl GatewayResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: Bytes::new(),
        }
    }

    /// JSON response with `content-type: application/json`.
    pub fn json(status: u16, body: &serde_json::Value) -> Self {
        Self::new(status)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
    }

    pub fn text(status: u16, body: impl Into<Bytes>) -> Self {
        Self::new(status)
            .with_header("content-type", "text/plain; charset=utf-8")
            .with_body(body)
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Default response when no plugin answered.
    pub fn no_route(path: &str) -> Self {
        Self::json(
            404,
            &serde_json::json!({
                "error": "no route",
                "path": path,
            }),
        )
    }

    /// 500 returned when a plugin fails. `detail` is only set in dev mode.
    pub fn plugin_fault(trace_id: &str, detail: Option<&str>) -> Self {
        let mut body = serde_json::json!({
            "error": "internal server error",
            "trace_id": trace_id,
        });
        if let Some(detail) = detail {
            body["detail"] = serde_json::Value::String(detail.to_string());
        }
        Self::json(500, &body)
    }

    /// 503 returned when the gateway cannot accept more work.
    pub fn unavailable(reason: &str) -> Self {
        Self::json(
            503,
            &serde_json::json!({
                "error": "service unavailable",
                "reason": reason,
            }),
        )
        .with_header("retry-after", "1")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}
