// Simulation scenarios.

use clap::Subcommand;

use pagesync_realtime::RealtimeConfig;

use crate::output::OutputFormat;

pub mod doc;
pub mod pages;

#[derive(Subcommand)]
pub enum Command {
    /// Concurrent optimistic page creates reconciled through the change feed
    Pages(pages::PagesArgs),
    /// Concurrent edits on one shared CRDT document
    Doc(doc::DocArgs),
}

pub async fn run(cmd: Command, config: RealtimeConfig, format: OutputFormat) -> anyhow::Result<()> {
    match cmd {
        Command::Pages(args) => pages::run(args, config, format).await,
        Command::Doc(args) => doc::run(args, config, format).await,
    }
}
