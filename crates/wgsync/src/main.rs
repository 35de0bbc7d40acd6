mod commands;

use std::path::PathBuf;

use clap::Parser;
use tracing::debug;
use wgsync_core::Config;
use wgsync_core::config::DEFAULT_CONFIG_PATH;

use crate::commands::Command;

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout carries command output, logs go to stderr
    #[cfg(distribute)]
    {
        fmt()
            .json()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .init();
    }

    #[cfg(not(distribute))]
    {
        fmt()
            .pretty()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .init();
    }
}

#[derive(Debug, Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("GIT_VERSION"))]
#[command(about = "Address allocation and config sync for a WireGuard server")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dotenv = dotenvy::dotenv();
    init_tracing();
    let args = Args::parse();

    if let Ok(path) = dotenv {
        debug!(path = %path.display(), "loaded environment file");
    }
    debug!(commit = env!("GIT_COMMIT"), config = %args.config.display(), "starting wgsync");

    let config = Config::load_with_env(&args.config).await?;
    commands::run(args.command, &config).await
}
