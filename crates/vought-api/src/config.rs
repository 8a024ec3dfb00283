//! API configuration.

use std::time::Duration;

/// API server configuration.
#[derive(Clone)]
pub struct ApiConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// CORS origins
    pub cors_origins: Vec<String>,
    /// Expected socket credential user
    pub user_auth: String,
    /// Expected socket credential password
    pub pwd_auth: String,
    /// Heartbeat period: a socket silent for longer is torn down
    pub ws_heartbeat: Duration,
    /// Outgoing frames buffered per socket before senders wait
    pub ws_send_buffer: usize,
    /// Verbose logging
    pub dev_mode: bool,
    /// Serve Prometheus metrics at `/metrics`
    pub metrics_enabled: bool,
    /// Video record store (`redis://...` or `memory://`)
    pub video_store_url: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cors_origins: vec!["*".to_string()],
            user_auth: String::new(),
            pwd_auth: String::new(),
            ws_heartbeat: Duration::from_secs(5),
            ws_send_buffer: 32,
            dev_mode: false,
            metrics_enabled: true,
            video_store_url: "redis://localhost:6379".to_string(),
        }
    }
}

impl ApiConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("API_HOST").unwrap_or(defaults.host),
            port: std::env::var("API_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(8080),
            cors_origins: std::env::var("CORS_ORIGINS")
                .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or(defaults.cors_origins),
            user_auth: std::env::var("USER_AUTH").unwrap_or_default(),
            pwd_auth: std::env::var("PWD_AUTH").unwrap_or_default(),
            ws_heartbeat: Duration::from_secs(
                std::env::var("WS_HEARTBEAT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .filter(|secs| *secs > 0)
                    .unwrap_or(5),
            ),
            ws_send_buffer: std::env::var("WS_SEND_BUFFER")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|size| *size > 0)
                .unwrap_or(32),
            dev_mode: std::env::var("DEV_MODE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            metrics_enabled: std::env::var("METRICS_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(true),
            video_store_url: std::env::var("VIDEO_STORE_URL")
                .or_else(|_| std::env::var("BROKER_URL"))
                .unwrap_or(defaults.video_store_url),
        }
    }
}

// Keeps the socket password out of logs.
impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("cors_origins", &self.cors_origins)
            .field("user_auth", &self.user_auth)
            .field("ws_heartbeat", &self.ws_heartbeat)
            .field("ws_send_buffer", &self.ws_send_buffer)
            .field("dev_mode", &self.dev_mode)
            .field("metrics_enabled", &self.metrics_enabled)
            .field("video_store_url", &self.video_store_url)
            .finish_non_exhaustive()
    }
}
