//! Application state.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;
use vought_queue::{Broker, BrokerConfig, SharedClient};

use crate::config::ApiConfig;
use crate::error::ApiResult;
use crate::repository::{
    MemoryVideoRepository, RedisVideoRepository, RepositoryError, VideoRepository,
};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub broker: Broker,
    /// Long-lived handle for binds and ephemeral queues
    pub bus: SharedClient,
    pub videos: Arc<dyn VideoRepository>,
    /// Fires on shutdown; every socket and consumer derives from it
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Connect to the broker and the video store. Either failing is fatal.
    pub async fn new(config: ApiConfig, broker_config: BrokerConfig) -> ApiResult<Self> {
        let prefix = broker_config.key_prefix.clone();
        let broker = Broker::connect(broker_config).await?;

        let videos: Arc<dyn VideoRepository> = if config.video_store_url.starts_with("memory://") {
            info!("Using in-memory video store");
            Arc::new(MemoryVideoRepository::new())
        } else if config.video_store_url.starts_with("redis") {
            Arc::new(RedisVideoRepository::connect(&config.video_store_url, prefix).await?)
        } else {
            return Err(RepositoryError::InvalidUrl(config.video_store_url.clone()).into());
        };

        Ok(Self::from_parts(config, broker, videos, CancellationToken::new()))
    }

    pub fn from_parts(
        config: ApiConfig,
        broker: Broker,
        videos: Arc<dyn VideoRepository>,
        shutdown: CancellationToken,
    ) -> Self {
        let bus = SharedClient::spawn(&broker, &shutdown);
        Self {
            config,
            broker,
            bus,
            videos,
            shutdown,
        }
    }
}
