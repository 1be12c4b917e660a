//! Ingress gateway for the vehicle pricing platform.
//!
//! Accepts file uploads over HTTP, stores them on the shared volume, and
//! queues the filenames for the processing workers. Also bridges prediction
//! requests through to the ML inference service.
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/gateway.toml, /etc/gateway/gateway.toml)
//! 2. Environment variables (prefixed with GATEWAY__)
//!
//! See `config.rs` for detailed configuration options.

mod api;
mod config;
mod inference;
mod publisher;
mod upload;

use anyhow::{Context, Result};
use api::AppState;
use config::Config;
use inference::InferenceClient;
use publisher::{MessagePublisher, QueuePublisher};
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use upload::FileStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        "Starting ingress gateway"
    );

    // Validate configuration
    config.validate().context("Invalid configuration")?;

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Prepare the upload directory
    let store = Arc::new(FileStore::new(&config.storage.upload_dir));
    if config.storage.create_dir {
        store.ensure_root().with_context(|| {
            format!(
                "Failed to create upload directory {}",
                config.storage.upload_dir
            )
        })?;
    }

    // Broker connectivity is required at startup
    let publisher = Arc::new(
        QueuePublisher::connect(&config.amqp.url, &config.amqp.queue)
            .await
            .context("Failed to connect to message broker")?,
    );

    let inference = Arc::new(InferenceClient::new(&config.inference)?);

    // Create API state
    let state = AppState {
        publisher: publisher.clone(),
        store,
        inference,
        queue: config.amqp.queue.clone(),
    };

    let router = api::create_router(state, &config.api);
    let addr = format!("{}:{}", config.api.host, config.api.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!(address = %addr, "Gateway API listening");

    serve_api(listener, router, publisher, shutdown_signal()).await?;

    info!("Gateway stopped");

    Ok(())
}

/// Serve the API until `shutdown` resolves, then release the broker
/// connection. The connection is closed whether the server exited
/// cleanly or with an error.
async fn serve_api(
    listener: tokio::net::TcpListener,
    router: axum::Router,
    publisher: Arc<dyn MessagePublisher>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await;

    publisher.close().await;

    served.context("API server error")
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
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
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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
