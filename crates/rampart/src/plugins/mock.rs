//! `mock` plugin: answers with a canned response from the matched rule.
//!
//! Rule handle keys: `status` (default 200), `body` (string, or any JSON
//! value which is then sent as `application/json`), `content_type` and
//! `headers` (a table of strings).

use rampart_chain::{async_trait, Exchange, Flow, GatewayResponse, Next, Plugin, PluginError, RuleData, SelectorData};
use serde_json::Value;

pub const NAME: &str = "mock";

const DEFAULT_PRIORITY: i32 = 1_000;

pub struct MockPlugin {
    priority: i32,
}

impl MockPlugin {
    pub fn with_priority(priority: i32) -> Self {
        Self { priority }
    }

    fn build(rule: &RuleData) -> Result<GatewayResponse, PluginError> {
        let status = match rule.handle_value("status") {
            None => 200,
            Some(value) => value
                .as_u64()
                .filter(|s| (100..=599).contains(s))
                .map(|s| s as u16)
                .ok_or_else(|| {
                    PluginError::invalid_handle("status", format!("not an HTTP status: {value}"))
                })?,
        };

        let mut response = match rule.handle_value("body") {
            None | Some(Value::Null) => GatewayResponse::new(status),
            Some(Value::String(text)) => GatewayResponse::text(status, text.clone()),
            Some(other) => GatewayResponse::json(status, other),
        };

        if let Some(content_type) = rule.handle_str("content_type") {
            response = response.with_header("content-type", content_type);
        }

        match rule.handle_value("headers") {
            None => {}
            Some(Value::Object(headers)) => {
                for (name, value) in headers {
                    let value = value.as_str().ok_or_else(|| {
                        PluginError::invalid_handle("headers", format!("header '{name}' is not a string"))
                    })?;
                    response = response.with_header(name, value);
                }
            }
            Some(_) => return Err(PluginError::invalid_handle("headers", "expected a table")),
        }
        Ok(response)
    }
}

impl Default for MockPlugin {
    fn default() -> Self {
        Self::with_priority(DEFAULT_PRIORITY)
    }
}

#[async_trait]
impl Plugin for MockPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn execute(
        &self,
        _exchange: &mut Exchange,
        _next: Next,
        _selector: Option<&SelectorData>,
        rule: Option<&RuleData>,
    ) -> Result<Flow, PluginError> {
        let rule = rule.ok_or_else(|| PluginError::failed("mock plugin ran without a rule"))?;
        Ok(Flow::respond(Self::build(rule)?))
    }
}
