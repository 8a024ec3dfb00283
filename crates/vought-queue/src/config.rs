//! Broker configuration.

use std::time::Duration;

use uuid::Uuid;
use vought_models::{VIDEO_ENCODED_QUEUE, VIDEO_UPLOADED_QUEUE};

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Broker URL (`redis://...` or `memory://`)
    pub url: String,
    /// Prefix for every key the broker writes
    pub key_prefix: String,
    /// Consumer name inside the consumer group; stable for the process so
    /// unacknowledged entries are redelivered to it after a reconnect
    pub consumer_name: String,
    /// How long one fetch blocks waiting for new messages
    pub fetch_block: Duration,
    /// Max messages pulled per fetch
    pub fetch_batch: usize,
    /// Liveness check period for an idle handle
    pub ping_interval: Duration,
    /// First reconnect delay, doubled per failed attempt
    pub reconnect_base_delay: Duration,
    /// Reconnect delay ceiling (attempts never stop)
    pub reconnect_max_delay: Duration,
    /// Queues declared on every new connection
    pub durable_queues: Vec<String>,
    /// Lifetime of an ephemeral queue nobody consumes; each fetch by its
    /// owner renews it
    pub ephemeral_ttl: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "vought".to_string(),
            consumer_name: default_consumer_name(),
            fetch_block: Duration::from_millis(1000),
            fetch_batch: 10,
            ping_interval: Duration::from_secs(5),
            reconnect_base_delay: Duration::from_millis(200),
            reconnect_max_delay: Duration::from_secs(10),
            durable_queues: vec![
                VIDEO_UPLOADED_QUEUE.to_string(),
                VIDEO_ENCODED_QUEUE.to_string(),
            ],
            ephemeral_ttl: Duration::from_secs(60),
        }
    }
}

impl BrokerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("BROKER_URL").unwrap_or(defaults.url),
            key_prefix: std::env::var("BROKER_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            consumer_name: std::env::var("BROKER_CONSUMER_NAME")
                .unwrap_or(defaults.consumer_name),
            fetch_block: Duration::from_millis(
                std::env::var("BROKER_FETCH_BLOCK_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1000),
            ),
            fetch_batch: std::env::var("BROKER_FETCH_BATCH")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            ping_interval: Duration::from_secs(
                std::env::var("BROKER_PING_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),
            reconnect_base_delay: Duration::from_millis(
                std::env::var("BROKER_RECONNECT_BASE_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(200),
            ),
            reconnect_max_delay: Duration::from_millis(
                std::env::var("BROKER_RECONNECT_MAX_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10_000),
            ),
            durable_queues: defaults.durable_queues,
            ephemeral_ttl: Duration::from_secs(
                std::env::var("BROKER_EPHEMERAL_TTL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
            ),
        }
    }

    /// Config for an in-process broker.
    pub fn memory() -> Self {
        Self {
            url: "memory://".to_string(),
            fetch_block: Duration::from_millis(50),
            reconnect_base_delay: Duration::from_millis(10),
            reconnect_max_delay: Duration::from_millis(100),
            ..Self::default()
        }
    }

    pub fn with_ping_interval(mut self, ping_interval: Duration) -> Self {
        self.ping_interval = ping_interval;
        self
    }
}

fn default_consumer_name() -> String {
    format!("consumer-{}", Uuid::new_v4().simple())
}
