mod cli;
mod config;
mod error;
mod models;
mod services;
mod utils;

#[cfg(test)]
mod test_support;

use anyhow::bail;
use clap::Parser;
use services::epub::EpubSink;
use services::source::Wenku8Source;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = cli::Cli::parse();
    let config = config::Config::resolve(cli.config.as_deref())?;

    if cli.rebuild_ledgers {
        let written = services::ledger::rebuild_ledgers(&config.download_root)?;
        tracing::info!("{} ledgers written under {}", written, config.download_root.display());
        return Ok(());
    }

    let titles = if cli.titles.is_empty() {
        config.novels.clone()
    } else {
        cli.titles.clone()
    };
    if titles.is_empty() {
        bail!("no novels given on the command line or in the config");
    }

    // One session for the whole batch
    let source = Wenku8Source::new(&config)?;
    let summary = services::pipeline::run_batch(&source, &EpubSink, &config, &titles).await?;

    tracing::info!(
        built = summary.built,
        failed = summary.failed,
        "all novels processed"
    );
    Ok(())
}
