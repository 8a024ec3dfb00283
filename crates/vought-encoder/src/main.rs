//! Encoder binary.

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vought_encoder::{consume_uploads, EncoderConfig, FfmpegEncoder};
use vought_queue::{Broker, BrokerConfig};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let config = EncoderConfig::from_env();
    init_tracing(config.dev_mode);

    info!("Starting vought-encoder");
    info!("Encoder config: {:?}", config);

    if let Err(e) = run(config).await {
        error!("Encoder failed: {:#}", e);
        std::process::exit(1);
    }

    info!("Encoder shutdown complete");
}

async fn run(config: EncoderConfig) -> anyhow::Result<()> {
    let encoder = FfmpegEncoder::new(&config).context("Failed to set up FFmpeg")?;
    let broker = Broker::connect(BrokerConfig::from_env())
        .await
        .context("Failed to connect to broker")?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        shutdown.cancel();
    });

    consume_uploads(&broker, encoder, &cancel).await;
    Ok(())
}

/// Colored output for dev, JSON when `LOG_FORMAT=json`.
fn init_tracing(dev_mode: bool) {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let default_level = if dev_mode { "vought=debug" } else { "vought=info" };
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
