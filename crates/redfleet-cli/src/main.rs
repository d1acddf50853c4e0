use std::time::Duration;

use clap::{Parser, Subcommand};

mod client;
mod commands;

use client::ApiClient;

#[derive(Parser)]
#[command(
    name = "rfl",
    about = "RedFleet — managed Redis clusters",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Base URL of redfleetd.
    #[arg(
        long,
        global = true,
        env = "REDFLEET_ENDPOINT",
        default_value = "http://127.0.0.1:5656"
    )]
    endpoint: String,

    /// Seconds to wait for any single API response.
    #[arg(long, global = true, default_value = "10")]
    request_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a Redis instance (one master plus slaves).
    ///
    /// Memory below 100 MB is raised to 100; a slave count outside 0-100
    /// becomes 0.
    Create {
        #[arg(short, long)]
        name: String,
        /// Memory per task in MB.
        #[arg(short, long, default_value = "256", allow_negative_numbers = true)]
        memory: i64,
        /// Number of slaves.
        #[arg(short, long, default_value = "0", allow_negative_numbers = true)]
        slaves: i64,
        /// Block until the instance is running.
        #[arg(short, long)]
        wait: bool,
        /// Give up waiting after this many seconds (default: wait forever).
        #[arg(long, requires = "wait")]
        timeout: Option<u64>,
    },
    /// Show an instance's status.
    Status {
        #[arg(short, long)]
        name: String,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Delete an instance.
    Delete {
        #[arg(short, long)]
        name: String,
    },
    /// List all instances.
    List {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("rfl=warn".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = ApiClient::new(&cli.endpoint)?
        .with_request_timeout(Duration::from_secs(cli.request_timeout));

    match cli.command {
        Commands::Create {
            name,
            memory,
            slaves,
            wait,
            timeout,
        } => commands::create::create(&client, &name, memory, slaves, wait, timeout).await,
        Commands::Status { name, format } => {
            commands::instance::status(&client, &name, &format).await
        }
        Commands::Delete { name } => commands::instance::delete(&client, &name).await,
        Commands::List { format } => commands::instance::list(&client, &format).await,
    }
}
