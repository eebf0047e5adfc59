//! CLI entry point of the ingestion server.

use clap::Parser;
use color_eyre::eyre::{eyre, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "fleet-ingest",
    version,
    about = "Vehicle telemetry ingestion server"
)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long)]
    config: std::path::PathBuf,
}

fn main() -> Result<()> {
    init()?;

    let args = Args::parse();
    let config = config::Config::from_file(&args.config)?;

    if let Some(addr) = config.monitoring.prometheus_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| eyre!("prometheus exporter on {addr}: {e}"))?;
        tracing::info!(%addr, "prometheus scrape endpoint up");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let (ack_tx, ack_rx) = server::event_channel();
        let producers = backends::build_producers(&config, ack_tx).await?;
        let server = server::Server::new(config, producers, ack_rx)?;

        let shutdown = CancellationToken::new();
        let signal_token = shutdown.clone();
        let _signal_task = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
                signal_token.cancel();
            }
        });

        server.run(shutdown).await?;
        Ok::<(), color_eyre::eyre::Report>(())
    })?;

    Ok(())
}

/// Initializes error reporting, structured logging, and the TLS provider.
fn init() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Pin the process-wide TLS provider before any config is built.
    let _ = rustls::crypto::ring::default_provider().install_default();

    Ok(())
}
