//! Built-in plugins shipped with the gateway binary.

pub mod access_log;
pub mod mock;

use std::sync::Arc;

use rampart_chain::{Plugin, PluginError};

use crate::config::GatewayConfig;

pub use access_log::AccessLogPlugin;
pub use mock::MockPlugin;

/// Instantiate every built-in plugin from its configured options.
pub fn builtin_plugins(config: &GatewayConfig) -> Result<Vec<Arc<dyn Plugin>>, PluginError> {
    let access_log = match config.plugin(access_log::NAME) {
        Some(data) => AccessLogPlugin::from_options(&data.options)?,
        None => AccessLogPlugin::default(),
    };
    Ok(vec![Arc::new(access_log), Arc::new(MockPlugin::default())])
}
