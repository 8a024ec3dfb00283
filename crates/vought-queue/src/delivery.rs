//! Deliveries handed out by a consumer stream.

use crate::client::BrokerClient;
use crate::error::QueueResult;

/// One message delivered to a consumer.
///
/// Settling consumes the envelope, so a delivery is acked or nacked at most
/// once through it. Settling after the owning handle closed fails with
/// [`QueueError::Closed`](crate::QueueError::Closed); the broker then
/// redelivers the message to the next handle.
#[derive(Debug)]
pub struct Envelope {
    pub body: Vec<u8>,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    /// Queue the message was consumed from
    pub queue: String,
    client: BrokerClient,
}

impl Envelope {
    pub(crate) fn new(
        client: BrokerClient,
        queue: String,
        delivery_tag: u64,
        routing_key: String,
        body: Vec<u8>,
        redelivered: bool,
    ) -> Self {
        Self {
            body,
            routing_key,
            delivery_tag,
            redelivered,
            queue,
            client,
        }
    }

    pub async fn ack(self) -> QueueResult<()> {
        self.client.ack(self.delivery_tag, false).await
    }

    /// Negative acknowledgement. Without `requeue` the message is dead-lettered.
    pub async fn nack(self, requeue: bool) -> QueueResult<()> {
        self.client.nack(self.delivery_tag, false, requeue).await
    }
}
