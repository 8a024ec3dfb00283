//! Transport seam between the broker client and a concrete message store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::QueueResult;

/// A message as stored by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Transport-assigned message id
    pub id: String,
    /// Routing key the message was published with
    pub routing_key: String,
    pub body: Vec<u8>,
    /// Set when the message was delivered before and not settled
    pub redelivered: bool,
}

/// Opens connections to a broker.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self) -> QueueResult<Arc<dyn Connection>>;
}

/// One live connection to a broker.
///
/// Routing is direct: a publish with routing key `K` reaches the declared
/// queue named `K` plus every queue bound to `K`.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn ping(&self) -> QueueResult<()>;

    /// Create the queue if it does not exist yet.
    async fn declare_queue(&self, queue: &str) -> QueueResult<()>;

    /// Create a queue that only lives while it is being consumed.
    ///
    /// Not a target of direct addressing. The default declares an ordinary
    /// queue.
    async fn declare_ephemeral_queue(&self, queue: &str) -> QueueResult<()> {
        self.declare_queue(queue).await
    }

    /// Remove the queue, its pending messages, and its bindings.
    async fn delete_queue(&self, queue: &str) -> QueueResult<()>;

    async fn bind(&self, queue: &str, routing_key: &str) -> QueueResult<()>;

    /// Returns the number of queues the message was routed to.
    async fn publish(&self, routing_key: &str, body: &[u8]) -> QueueResult<usize>;

    /// Pull up to `max` messages, waiting at most `block` when none are ready.
    ///
    /// Messages this consumer received earlier and never settled come first.
    async fn fetch(&self, queue: &str, max: usize, block: Duration) -> QueueResult<Vec<RawMessage>>;

    async fn ack(&self, queue: &str, message: &RawMessage) -> QueueResult<()>;

    /// Settle negatively: requeue for another delivery or move to the dead-letter store.
    async fn reject(&self, queue: &str, message: &RawMessage, requeue: bool) -> QueueResult<()>;

    /// Release the connection; unsettled messages become deliverable again.
    async fn close(&self);
}
