//! ridegridd — the ridegrid daemon.
//!
//! Single binary that assembles the data plane:
//! - KV store (in-memory or Redis)
//! - Sample store (redb)
//! - Location ingestion pipeline
//! - Geo queries + ETA estimator
//! - Geocoding gateway behind a circuit breaker
//! - ETA tracker + publisher
//! - REST API
//!
//! # Usage
//!
//! ```text
//! ridegridd serve --config /etc/ridegrid/ridegrid.toml
//! ridegridd check-config --config ridegrid.toml
//! ridegridd default-config > ridegrid.toml
//! ```

mod data_plane;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use ridegrid_core::RidegridConfig;

#[derive(Parser)]
#[command(name = "ridegridd", about = "ridegrid data plane daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API and background workers.
    Serve {
        /// TOML config file. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override `server.listen`.
        #[arg(long)]
        listen: Option<String>,
    },
    /// Parse and validate a config file, then exit.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
    /// Print the default config as TOML.
    DefaultConfig,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,ridegrid=debug,ridegridd=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<RidegridConfig> {
    let mut config = match path {
        Some(path) => RidegridConfig::from_file(path)
            .map_err(|e| anyhow::anyhow!("loading {}: {e}", path.display()))?,
        None => RidegridConfig::default(),
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Serve { config, listen } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            data_plane::run(config).await
        }
        Command::CheckConfig { config } => {
            load_config(Some(&config))?;
            info!(path = %config.display(), "config ok");
            Ok(())
        }
        Command::DefaultConfig => {
            print!("{}", RidegridConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}
