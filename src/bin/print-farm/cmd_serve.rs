use std::sync::Arc;

use anyhow::{Context, Result};
use print_farm::{
    bambu::{BambuConnector, BambuTransport, Publishers},
    cache::MemoryCache,
    config::Config,
    fleet::{Collaborators, Fleet},
    store::MemoryStore,
    transport::SlicedFilePreparer,
};

use super::Cli;

async fn handle_signals() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).map_err(|e| {
            tracing::error!(error = format!("{:?}", e), "Failed to set up SIGINT handler");
            e
        })?;
        let mut sigterm = signal(SignalKind::terminate()).map_err(|e| {
            tracing::error!(error = format!("{:?}", e), "Failed to set up SIGTERM handler");
            e
        })?;

        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("received SIGINT");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM");
            }
        }
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c().await.map_err(|e| {
            tracing::error!(error = format!("{:?}", e), "Failed to set up Ctrl+C handler");
            anyhow::Error::new(e)
        })?;

        tracing::info!("received Ctrl+C (SIGINT)");
    }

    Ok(())
}

pub async fn main(cli: &Cli) -> Result<()> {
    let config = Config::from_file(&cli.config)?;
    if config.printers.is_empty() {
        tracing::warn!(config = %cli.config.display(), "no printers configured");
    }

    let publishers = Publishers::default();
    let fleet = Fleet::new(
        config.clone(),
        Collaborators {
            store: Arc::new(MemoryStore::new()),
            cache: Arc::new(MemoryCache::new()),
            connector: Arc::new(BambuConnector::new(publishers.clone())),
            transport: Arc::new(BambuTransport::new(publishers)),
            preparer: Arc::new(SlicedFilePreparer),
        },
    );

    for printer in &config.printers {
        let printer = printer
            .to_printer()
            .with_context(|| format!("printer {} in {}", printer.serial, cli.config.display()))?;
        fleet.register_printer(printer).await?;
    }

    fleet.start().await?;
    handle_signals().await?;

    tracing::info!("triggering cleanup...");
    fleet.shutdown().await;
    tracing::debug!("final metrics:\n{}", fleet.metrics().encode()?);
    tracing::info!("all clean, exiting!");
    Ok(())
}
