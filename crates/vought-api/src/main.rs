//! Axum API server binary.

use std::net::SocketAddr;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vought_api::{consume_encoded, create_router, metrics, ApiConfig, AppState};
use vought_queue::BrokerConfig;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let config = ApiConfig::from_env();
    init_tracing(config.dev_mode);

    info!("Starting vought-api");
    info!("API config: {:?}", config);

    if let Err(e) = run(config).await {
        error!("API server failed: {:#}", e);
        std::process::exit(1);
    }

    info!("Server shutdown complete");
}

async fn run(config: ApiConfig) -> anyhow::Result<()> {
    let state = AppState::new(config.clone(), BrokerConfig::from_env())
        .await
        .context("Failed to create application state")?;

    let metrics_handle = if config.metrics_enabled {
        match metrics::init_metrics() {
            Ok(handle) => {
                info!("Prometheus metrics enabled at /metrics");
                Some(handle)
            }
            Err(e) => {
                warn!("Failed to install metrics recorder: {}", e);
                None
            }
        }
    } else {
        None
    };

    let consumer = tokio::spawn({
        let broker = state.broker.clone();
        let videos = state.videos.clone();
        let shutdown = state.shutdown.clone();
        async move { consume_encoded(&broker, videos, &shutdown).await }
    });

    let shutdown = state.shutdown.clone();
    let app = create_router(state, metrics_handle);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("Invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("Server error")?;

    shutdown.cancel();
    let _ = consumer.await;
    Ok(())
}

/// Resolves on Ctrl+C and fires `shutdown`, which closes every socket.
async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received shutdown signal"),
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}

/// Colored output for dev, JSON when `LOG_FORMAT=json`.
fn init_tracing(dev_mode: bool) {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let default_level = if dev_mode {
        "vought=debug,tower_http=debug"
    } else {
        "vought=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(dev_mode)
                    .with_line_number(dev_mode),
            )
            .with(env_filter)
            .init();
    }
}
