use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use phishwatch_sync::{top_brands, FeedWatcher, SyncConfig};
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "phishwatch")]
#[command(about = "Polls a phishing-URL feed and records newly reported entries")]
struct Cli {
    /// Seconds to wait between polling cycles
    #[arg(long)]
    interval: Option<u64>,
    /// CSV file new reports are appended to
    #[arg(long)]
    output: Option<PathBuf>,
    /// Feed page to poll
    #[arg(long)]
    feed_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if let Some(interval) = cli.interval {
        config.interval_secs = interval;
    }
    if let Some(output) = cli.output {
        config.output_path = output;
    }
    if let Some(feed_url) = cli.feed_url {
        config.feed_url = feed_url;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("interrupt received; finishing current cycle");
            let _ = shutdown_tx.send(true);
        }
    });

    let mut watcher = FeedWatcher::new(config)?;
    watcher.run(shutdown_rx).await?;

    println!("\nTop 3 most-targeted brands:");
    for (brand, count) in top_brands(watcher.records(), 3) {
        println!("{brand}: {count} attacks");
    }

    Ok(())
}
