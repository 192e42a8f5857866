//! Hot reload of plugins and selectors from the configuration file.
//!
//! A reload parses and validates the whole file first; a file that fails
//! either step leaves the running configuration untouched. Bus, cache
//! policy and server settings only take effect on restart.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use rampart_telemetry::events;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::config::GatewayConfig;
use crate::gateway::Gateway;
use crate::plugins::builtin_plugins;
use crate::store::StaticConfigStore;

/// Editors often emit several events per save.
const DEBOUNCE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadResult {
    Applied {
        changed_plugins: Vec<String>,
        selectors: usize,
    },
    Rejected {
        error: String,
    },
}

/// Applies a configuration file to a running gateway.
pub struct Reloader {
    path: PathBuf,
    store: Arc<StaticConfigStore>,
    gateway: Arc<Gateway>,
    lock: Mutex<()>,
}

impl Reloader {
    pub fn new(path: impl Into<PathBuf>, store: Arc<StaticConfigStore>, gateway: Arc<Gateway>) -> Self {
        Self {
            path: path.into(),
            store,
            gateway,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reload the file. Concurrent reloads run one after another.
    pub async fn reload(&self) -> ReloadResult {
        let _guard = self.lock.lock().await;

        let applied = GatewayConfig::load(&self.path)
            .map_err(|e| e.to_string())
            .and_then(|config| {
                let plugins = builtin_plugins(&config).map_err(|e| e.to_string())?;
                Ok((config, plugins))
            });
        let (config, plugins) = match applied {
            Ok(applied) => applied,
            Err(error) => {
                tracing::warn!(
                    event = events::CONFIG_RELOAD_FAILED,
                    path = %self.path.display(),
                    error = %error,
                    "keeping the current configuration"
                );
                return ReloadResult::Rejected { error };
            }
        };

        // The store invalidates the match cache of every changed plugin.
        let changed_plugins = self.store.resync(&config);
        self.gateway.set_plugins(plugins);

        let selectors = self.store.selector_count();
        tracing::info!(
            event = events::CONFIG_LOADED,
            path = %self.path.display(),
            changed = ?changed_plugins,
            selectors = selectors,
            "configuration reloaded"
        );
        ReloadResult::Applied {
            changed_plugins,
            selectors,
        }
    }
}

/// Keeps the file watcher and its reload task alive.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Watch the reloader's file and reload on every change.
///
/// The parent directory is watched so that editors replacing the file by
/// rename are still noticed.
pub fn watch(reloader: Arc<Reloader>) -> Result<ConfigWatcher, notify::Error> {
    let target = reloader.path().to_path_buf();
    let directory = match target.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = target.file_name().map(|n| n.to_os_string());

    let (tx, mut rx) = mpsc::unbounded_channel::<()>();
    let mut watcher = RecommendedWatcher::new(
        move |result: notify::Result<Event>| match result {
            Ok(event) => {
                let relevant = (event.kind.is_modify() || event.kind.is_create())
                    && event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                if relevant {
                    let _ = tx.send(());
                }
            }
            Err(error) => tracing::warn!(error = %error, "configuration watch error"),
        },
        notify::Config::default(),
    )?;
    watcher.watch(&directory, RecursiveMode::NonRecursive)?;
    tracing::info!(path = %target.display(), "watching configuration file");

    let task = tokio::spawn(async move {
        while rx.recv().await.is_some() {
            tokio::time::sleep(DEBOUNCE).await;
            while rx.try_recv().is_ok() {}
            reloader.reload().await;
        }
    });

    Ok(ConfigWatcher {
        _watcher: watcher,
        task,
    })
}
