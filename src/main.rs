//! Intake daemon
//!
//! Watches a directory for delimited text files and ships parsed, optionally
//! enriched records to a bulk index endpoint.
//!
//! Usage:
//!     intake --config intake.toml

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use intake::alert::{Notifier, Side, Watchdog};
use intake::config::{apply_env_overrides, Config};
use intake::enrich::EnrichClient;
use intake::mail::MailNotifier;
use intake::pool::WorkerPool;
use intake::processor::FileProcessor;
use intake::sink::{BatchSink, BulkIndexer};
use intake::watcher::Watcher;
use intake::ActivityTracker;

#[derive(Parser, Debug)]
#[command(name = "intake", about = "Folder watching ingestion pipeline")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "intake.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "intake=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = Config::load_or_init(&args.config)?;
    for issue in apply_env_overrides(&mut config) {
        tracing::warn!(%issue, "environment override rejected");
    }
    let config = Arc::new(config);

    tracing::info!("Starting intake");
    tracing::info!("  Watch: {}", config.watch_dir);
    tracing::info!("  Done: {}", config.done_dir);
    tracing::info!("  Workers: {}", config.max_concurrent_files);

    std::fs::create_dir_all(&config.done_dir).context("creating done directory")?;

    let activity = Arc::new(ActivityTracker::new());
    let indexer = Arc::new(BulkIndexer::new(&config)?);
    let sink = Arc::new(BatchSink::new(&config, indexer, Arc::clone(&activity)));

    let enricher = if config.enricher.enabled {
        Some(EnrichClient::new(
            &config.enricher,
            config.accept_invalid_certs,
        )?)
    } else {
        None
    };

    let processor = Arc::new(FileProcessor::new(
        Arc::clone(&config),
        enricher,
        Arc::clone(&sink),
    ));
    let pool = WorkerPool::start(config.max_concurrent_files, processor);

    if config.input_alert.threshold_secs > 0 || config.output_alert.threshold_secs > 0 {
        let notifier: Arc<dyn Notifier> = Arc::new(MailNotifier::new(&config.mail)?);
        let alerts = [
            (Side::Input, &config.input_alert),
            (Side::Output, &config.output_alert),
        ];
        for (side, alert) in alerts {
            let watchdog = Watchdog::new(
                side,
                alert,
                &config.name,
                Arc::clone(&activity),
                Arc::clone(&notifier),
            );
            if let Some(watchdog) = watchdog {
                tokio::spawn(watchdog.run());
            }
        }
    }

    let watcher = Watcher::new(
        Arc::clone(&config),
        pool.queue(),
        Arc::clone(&activity),
        Arc::clone(&sink),
    );

    let sweeper = watcher.clone();
    tokio::spawn(async move { sweeper.initial_sweep().await });

    watcher.run().await?;
    pool.shutdown().await;

    Ok(())
}
