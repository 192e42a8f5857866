//! Error types for plugin execution.

use thiserror::Error;

/// Errors a plugin can fail an exchange with.
///
/// Any of these aborts the chain; the engine answers with a 500.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Generic failure raised by the plugin.
    #[error("plugin failed: {0}")]
    Failed(String),

    /// The selector or rule handle is missing a field or has a bad value.
    #[error("invalid handle field '{field}': {reason}")]
    InvalidHandle { field: String, reason: String },

    /// The plugin future panicked.
    #[error("plugin panicked: {0}")]
    Panicked(String),
}

impl PluginError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn invalid_handle(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidHandle {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
