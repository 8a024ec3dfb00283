//! Prometheus metrics for the API server.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use vought_models::VideoStatus;

/// Initialize the Prometheus metrics recorder.
/// Returns a handle that can be used to render metrics.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Metric names as constants for consistency.
pub mod names {
    // Pipeline metrics
    pub const VIDEOS_ENCODED_TOTAL: &str = "vought_videos_encoded_total";

    // WebSocket metrics
    pub const WS_CONNECTIONS_TOTAL: &str = "vought_ws_connections_total";
    pub const WS_CONNECTIONS_ACTIVE: &str = "vought_ws_connections_active";
    pub const WS_MESSAGES_SENT: &str = "vought_ws_messages_sent_total";
    pub const WS_SUBSCRIPTIONS_TOTAL: &str = "vought_ws_subscriptions_total";
}

/// Record an encode result applied to a video record.
pub fn record_video_encoded(status: VideoStatus) {
    counter!(names::VIDEOS_ENCODED_TOTAL, "status" => status.as_str()).increment(1);
}

/// Record WebSocket connection.
pub fn record_ws_connection() {
    counter!(names::WS_CONNECTIONS_TOTAL).increment(1);
}

/// Update active WebSocket connections gauge.
pub fn set_ws_active_connections(count: i64) {
    gauge!(names::WS_CONNECTIONS_ACTIVE).set(count as f64);
}

/// Record WebSocket message sent.
pub fn record_ws_message_sent(message_type: &'static str) {
    counter!(names::WS_MESSAGES_SENT, "type" => message_type).increment(1);
}

/// Record a socket subscribing to a video.
pub fn record_ws_subscription() {
    counter!(names::WS_SUBSCRIPTIONS_TOTAL).increment(1);
}
