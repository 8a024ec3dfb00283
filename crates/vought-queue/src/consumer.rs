//! Long-running consume loop over a redialing session.

use std::ops::ControlFlow;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::BrokerClient;
use crate::delivery::Envelope;
use crate::error::QueueResult;
use crate::session::Session;

/// Processes deliveries from one queue.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one delivery. The handler owns settling it.
    ///
    /// `client` is the handle the delivery came from; publishes made while
    /// handling should go through it. Returning `Break` stops the loop.
    async fn handle(&self, client: &BrokerClient, envelope: Envelope) -> ControlFlow<()>;

    /// Set up broker state on a fresh handle before consuming from it, such
    /// as re-declaring a queue and its bindings. An error drops the handle.
    async fn prepare(&self, _client: &BrokerClient) -> QueueResult<()> {
        Ok(())
    }
}

/// Consume `queue` through every handle `session` yields until `cancel` fires
/// or the handler breaks.
///
/// When a handle's delivery stream ends the handle is closed and the loop
/// waits for the next one; unsettled deliveries are then redelivered.
pub async fn run_consumer<H>(
    session: &mut Session,
    queue: &str,
    handler: &H,
    cancel: &CancellationToken,
) where
    H: MessageHandler + ?Sized,
{
    loop {
        let client = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            client = session.next() => match client {
                Some(client) => client,
                None => break,
            },
        };

        if let Err(e) = handler.prepare(&client).await {
            warn!(queue, client = client.id(), error = %e, "Could not prepare broker handle");
            client.close().await;
            if cancel.is_cancelled() {
                break;
            }
            continue;
        }

        let mut stopped = false;
        match client.consume(queue).await {
            Ok(mut deliveries) => loop {
                let envelope = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    envelope = deliveries.next() => envelope,
                };
                let Some(envelope) = envelope else {
                    break;
                };
                if handler.handle(&client, envelope).await.is_break() {
                    stopped = true;
                    break;
                }
            },
            Err(e) => {
                warn!(queue, client = client.id(), error = %e, "Could not start consuming");
            }
        }

        client.close().await;
        if stopped || cancel.is_cancelled() {
            break;
        }
        debug!(queue, "Delivery stream ended, waiting for a new broker handle");
    }
}
