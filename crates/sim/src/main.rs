// pagesync-sim: drive several in-process clients against the memory backend.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use pagesync_realtime::RealtimeConfig;

mod commands;
mod output;

#[derive(Parser)]
#[command(name = "pagesync-sim", about = "Simulate realtime clients sharing one in-memory backend")]
struct Cli {
    /// Force JSON output
    #[arg(long, global = true)]
    json: bool,
    /// Realtime config file (defaults to ~/.pagesync/realtime.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: commands::Command,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => RealtimeConfig::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => RealtimeConfig::load(),
    };
    let format = output::OutputFormat::detect(cli.json);
    commands::run(cli.command, config, format).await
}
