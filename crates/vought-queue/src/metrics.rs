//! Broker metrics.

use metrics::counter;

/// Metric name constants for consistency.
pub mod names {
    pub const RECONNECTS_TOTAL: &str = "vought_broker_reconnects_total";
    pub const PUBLISHED_TOTAL: &str = "vought_broker_published_total";
    pub const SETTLED_TOTAL: &str = "vought_broker_settled_total";
}

/// Record a session reconnect.
pub fn record_reconnect() {
    counter!(names::RECONNECTS_TOTAL).increment(1);
}

/// Record a publish with the number of queues it reached.
pub fn record_published(routed: usize) {
    let outcome = if routed == 0 { "unrouted" } else { "routed" };
    counter!(names::PUBLISHED_TOTAL, "outcome" => outcome).increment(1);
}

/// Record a delivery being acked, rejected, or requeued.
pub fn record_settled(outcome: &'static str) {
    counter!(names::SETTLED_TOTAL, "outcome" => outcome).increment(1);
}
