//! Indexation lag monitor
//!
//! Main entry point: metrics endpoint plus one monitor per aggregator

use std::env;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use idxlag_core::Settings;
use idxlag_feeds::{build_monitors, MetricsSink, MonitorSet};
use idxlag_server::serve;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json = env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        }
        _ = terminate => {
            info!("Received termination signal");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    init_tracing();

    info!("Starting indexation lag monitor v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load().context("failed to load configuration")?;
    let addr = settings.metrics_addr()?;

    let sink = Arc::new(MetricsSink::new().context("failed to create metrics registry")?);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics endpoint on {addr}"))?;

    let server_sink = Arc::clone(&sink);
    let path = settings.metrics.path.clone();
    tokio::spawn(async move {
        if let Err(e) = serve(listener, &path, server_sink).await {
            error!("Metrics server error: {}", e);
        }
    });

    let monitors = MonitorSet::spawn(build_monitors(&settings, sink));
    if monitors.is_empty() {
        warn!("No aggregator enabled; serving an empty registry");
    }

    info!("Press Ctrl+C to shutdown");
    shutdown_signal().await;

    monitors.shutdown();
    for (aggregator, exit) in monitors.join().await {
        info!("[{}] exited: {:?}", aggregator.tag(), exit);
    }

    info!("Shutdown complete");
    Ok(())
}
