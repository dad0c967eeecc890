//! cdgridd — the cdgrid deployment coordinator daemon.
//!
//! Single binary that assembles:
//! - State store (redb): app registry and deployment jobs
//! - Docker executor
//! - Dispatcher, poller, and expiry reaper
//! - HTTP API
//!
//! # Usage
//!
//! ```text
//! cdgridd serve --config /etc/cdgrid/cdgridd.toml
//! cdgridd check-config --config /etc/cdgrid/cdgridd.toml
//! ```

mod config;
mod serve;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::CdgridConfig;
use crate::serve::ServeOptions;

const DEFAULT_LOG_FILTER: &str = "info,cdgridd=debug,cdgrid=debug";

#[derive(Parser)]
#[command(name = "cdgridd", version, about = "cdgrid deployment coordinator")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the coordinator.
    Serve {
        /// Configuration file. Defaults apply when omitted.
        #[arg(long, env = "CDGRID_CONFIG")]
        config: Option<PathBuf>,

        /// Override `server.port`.
        #[arg(long)]
        port: Option<u16>,

        /// Override `store.data_dir`.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Simulate deployments instead of starting containers.
        #[arg(long)]
        dry_run: bool,

        /// Registry user for pulling the automation image.
        #[arg(long, env = "CDGRID_REGISTRY_USERNAME")]
        registry_username: Option<String>,

        /// Registry password or token.
        #[arg(long, env = "CDGRID_REGISTRY_PASSWORD", hide_env_values = true)]
        registry_password: Option<String>,
    },

    /// Parse and validate a configuration file, then exit.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
            dry_run,
            registry_username,
            registry_password,
        } => {
            let mut config = CdgridConfig::load(config.as_deref())?;
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.store.data_dir = data_dir;
            }
            serve::run(
                config,
                ServeOptions {
                    dry_run,
                    registry_username,
                    registry_password,
                },
            )
            .await
        }
        Command::CheckConfig { config: path } => {
            let config = CdgridConfig::from_file(&path)?;
            info!(
                path = %path.display(),
                addr = %config.server.addr(),
                data_dir = %config.store.data_dir.display(),
                image = %config.executor.docker.image,
                trusted = config.access.trusted_networks.len(),
                monitoring = config.access.monitoring_networks.len(),
                "configuration is valid"
            );
            Ok(())
        }
    }
}
