//! crawlbatch CLI: resumable batch runs against a remote crawl service.
//!
//! Imports keyword/blog tables as jobs, runs them one keyword at a time with
//! pause/resume, and exports the collected results.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
