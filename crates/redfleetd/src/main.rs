//! redfleetd — the RedFleet daemon.
//!
//! Single binary that assembles the control plane:
//! - State store (redb)
//! - Offer source (simulated cluster)
//! - Create / maintain / destroy loops
//! - REST API + Prometheus metrics
//!
//! # Usage
//!
//! ```text
//! redfleetd run --config /etc/redfleet/redfleet.toml
//! redfleetd dump-config > redfleet.toml
//! ```

mod daemon;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use redfleet_core::FleetConfig;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "redfleetd", about = "RedFleet daemon", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane.
    Run {
        /// Path to redfleet.toml. Defaults apply when the file is absent.
        #[arg(long, short, default_value = "redfleet.toml")]
        config: PathBuf,
    },
    /// Print the default configuration as TOML.
    DumpConfig,
}

fn init_tracing(log_format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,redfleetd=debug,redfleet=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if log_format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::DumpConfig => {
            print!("{}", FleetConfig::default().to_toml_string()?);
            Ok(())
        }
        Command::Run { config: path } => {
            let (mut config, found) = FleetConfig::load_or_default(&path)?;
            init_tracing(&config.log_format);
            if found {
                info!(path = %path.display(), "config loaded");
            } else {
                warn!(path = %path.display(), "config file not found, using defaults");
            }
            config.apply_env_overrides();
            daemon::run(config).await
        }
    }
}
