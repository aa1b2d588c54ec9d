use anyhow::{Context, Result};
use sscan_intake::api::{start_api_server, AppState};
use sscan_intake::config::{Config, ServiceConfig};
use sscan_intake::{
    BarcodeVerifier, CameraScanner, FrameCapturer, ImageCompressor, LatestFrame,
    NotificationBoard, ScanController, ScanSettings, SubmissionPipeline, SupabaseStore,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service);

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        "Starting Sscan intake service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let frames = LatestFrame::new();
    let scanner = Arc::new(
        CameraScanner::new(frames.clone(), &config.scanner)
            .context("Failed to initialize camera scanner")?,
    );
    let store = Arc::new(
        SupabaseStore::new(&config.supabase).context("Failed to initialize Supabase store")?,
    );
    let notifications = Arc::new(NotificationBoard::new(
        config.notifications.display_duration(),
        config.notifications.capacity,
    ));

    let pipeline = SubmissionPipeline::new(
        FrameCapturer::new(Arc::new(frames), &config.capture),
        ImageCompressor::new(config.compression.clone()),
        store.clone(),
        notifications.clone(),
    );
    let controller = Arc::new(ScanController::new(
        scanner,
        BarcodeVerifier::new(store),
        pipeline,
        notifications.clone(),
        ScanSettings::from(&config.scanner),
    ));

    // Start scanning; a camera failure leaves the API up with an idle session
    let scan_handle = match controller.start().await {
        Ok(Some(events)) => {
            let controller = controller.clone();
            Some(tokio::spawn(async move { controller.run(events).await }))
        }
        Ok(None) => None,
        Err(e) => {
            error!(error = %e, "Scanning unavailable");
            None
        }
    };

    // Spawn API server task
    let api_state = AppState {
        controller: controller.clone(),
        notifications,
    };
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Intake service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down intake service");

    controller.shutdown().await;
    if let Some(handle) = scan_handle {
        handle.abort();
    }
    api_handle.abort();

    info!("Intake service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(config: &ServiceConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    match config.log_format.as_str() {
        "json" => registry.with(fmt::layer().json()).init(),
        _ => registry.with(fmt::layer().pretty()).init(),
    }
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
            error!(error = %e, "Failed to install Ctrl+C handler");
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
