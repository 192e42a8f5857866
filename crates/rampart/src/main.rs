//! Rampart gateway binary.
//!
//! `serve` runs the gateway from a configuration file; `check` validates a
//! file without starting anything.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rampart_bus::ShutdownOutcome;
use rampart_chain::ConfigStore;
use rampart_lib::hot_reload::{self, Reloader};
use rampart_lib::plugins::builtin_plugins;
use rampart_lib::{server, Gateway, GatewayConfig, StaticConfigStore};
use rampart_telemetry::{log_shutdown, LogFormat, Telemetry};
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(name = "rampart", about = "Rampart plugin-chain gateway", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway.
    Serve {
        /// Configuration file.
        #[arg(short, long, default_value = "rampart.toml")]
        config: PathBuf,

        /// Listen address, overriding `server.listen`.
        #[arg(long)]
        listen: Option<String>,

        /// Log level filter, overriding `telemetry.log_level`.
        #[arg(long)]
        log_level: Option<String>,

        /// Log format (json, pretty, compact).
        #[arg(long)]
        log_format: Option<LogFormat>,

        /// Include error details in fault responses.
        #[arg(long)]
        dev: bool,

        /// Do not reload the configuration file when it changes.
        #[arg(long)]
        no_watch: bool,
    },

    /// Validate a configuration file and exit.
    Check {
        /// Configuration file.
        #[arg(short, long, default_value = "rampart.toml")]
        config: PathBuf,
    },
}

struct Overrides {
    listen: Option<String>,
    log_level: Option<String>,
    log_format: Option<LogFormat>,
    dev: bool,
}

fn load_config(path: &Path, overrides: Overrides) -> anyhow::Result<GatewayConfig> {
    let mut config = GatewayConfig::load(path)?;
    if let Some(listen) = overrides.listen {
        config.server.listen = listen;
    }
    if let Some(level) = overrides.log_level {
        config.telemetry.log_level = level;
    }
    if let Some(format) = overrides.log_format {
        config.telemetry.log_format = format;
    }
    config.server.dev |= overrides.dev;
    config
        .validate()
        .with_context(|| format!("{} with command-line overrides", path.display()))?;
    Ok(config)
}

fn run_check(path: &Path) -> ExitCode {
    let config = match GatewayConfig::load(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(1);
        }
    };
    if let Err(e) = builtin_plugins(&config) {
        eprintln!("error: {}", e);
        return ExitCode::from(1);
    }
    println!(
        "{}: ok ({} plugin(s) configured, {} selector(s))",
        path.display(),
        config.plugins.len(),
        config.selectors.len()
    );
    ExitCode::SUCCESS
}

async fn run_serve(path: PathBuf, overrides: Overrides, watch: bool) -> ExitCode {
    let config = match load_config(&path, overrides) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return ExitCode::from(1);
        }
    };

    let telemetry = match Telemetry::init(config.telemetry_config()) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(1);
        }
    };

    let plugins = match builtin_plugins(&config) {
        Ok(plugins) => plugins,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(1);
        }
    };

    let store = Arc::new(StaticConfigStore::from_config(&config));
    let gateway = match Gateway::start(
        &config,
        Arc::clone(&store) as Arc<dyn ConfigStore>,
        plugins,
        telemetry.metrics(),
    ) {
        Ok(g) => Arc::new(g),
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(1);
        }
    };

    let listener = match TcpListener::bind(config.server.listen.as_str()).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("error: failed to bind to {}: {}", config.server.listen, e);
            gateway.shutdown(config.shutdown_timeout()).await;
            return ExitCode::from(1);
        }
    };

    let _watcher = if watch {
        let reloader = Arc::new(Reloader::new(path, store, Arc::clone(&gateway)));
        match hot_reload::watch(reloader) {
            Ok(w) => Some(w),
            Err(e) => {
                tracing::warn!(error = %e, "configuration hot reload disabled");
                None
            }
        }
    } else {
        None
    };

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
        }
    };
    if let Err(e) = server::serve(listener, Arc::clone(&gateway), shutdown_signal).await {
        eprintln!("error: front door failed: {}", e);
    }

    let grace = config.shutdown_timeout();
    log_shutdown!(grace_ms = grace.as_millis() as u64, "shutting down");
    let report = gateway.shutdown(grace).await;
    match report.outcome {
        ShutdownOutcome::Drained => ExitCode::SUCCESS,
        ShutdownOutcome::Forced { abandoned } => {
            eprintln!("warning: shutdown forced, {} event(s) abandoned", abandoned);
            ExitCode::from(2)
        }
        ShutdownOutcome::TimedOut { stuck_partitions } => {
            eprintln!(
                "warning: shutdown timed out, stuck partitions: {:?}",
                stuck_partitions
            );
            ExitCode::from(2)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config } => run_check(&config),
        Commands::Serve {
            config,
            listen,
            log_level,
            log_format,
            dev,
            no_watch,
        } => {
            let overrides = Overrides {
                listen,
                log_level,
                log_format,
                dev,
            };
            run_serve(config, overrides, !no_watch).await
        }
    }
}
