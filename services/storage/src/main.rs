use anyhow::{Context, Result};
use std::sync::Arc;
use storage_monitor::{Backends, Config, Monitor};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use usage_pipeline::{decode_notification, FanoutBus};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Storage Monitor"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    config
        .queue
        .validate()
        .context("Invalid queue configuration")?;

    // Initialize components
    let bus = Arc::new(FanoutBus::new());
    let backends = Backends::from_config(&config, bus.clone())
        .await
        .context("Failed to initialize backends")?;

    let monitor = Monitor::start(&config, &backends, &bus).context("Failed to start monitor")?;

    // Spawn stdin ingest task
    let ingest_shutdown = CancellationToken::new();
    let ingest_handle = config.service.ingest_stdin.then(|| {
        let bus = bus.clone();
        let shutdown = ingest_shutdown.clone();
        tokio::spawn(async move { ingest_stdin(bus, shutdown).await })
    });

    info!("Storage monitor started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down storage monitor");

    ingest_shutdown.cancel();
    if let Some(handle) = ingest_handle {
        if let Err(e) = handle.await {
            error!(error = %e, "Ingest task panicked");
        }
    }
    monitor.shutdown().await;

    info!("Storage monitor stopped");

    Ok(())
}

/// Publish newline-delimited notifications read from stdin
async fn ingest_stdin(bus: Arc<FanoutBus>, shutdown: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("Stdin closed, ingest finished");
                break;
            }
            Err(e) => {
                error!(error = %e, "Failed to read stdin");
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        match decode_notification(line.as_bytes()) {
            Ok(events) => {
                for event in events {
                    let report = bus.publish(&event).await;
                    debug!(
                        event_id = %event.event_id,
                        delivered = report.delivered.len(),
                        "Published lifecycle event"
                    );
                }
            }
            Err(e) => {
                warn!(error = %e, "Skipping undecodable notification");
                metrics::counter!("monitor.ingest.decode_errors").increment(1);
            }
        }
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
