//! Upload consumer: encodes each uploaded video and reports the result.

use std::ops::ControlFlow;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vought_models::{
    decode_video, encode_video, PipelineEvent, Video, VideoStatus, VIDEO_ENCODED_QUEUE,
    VIDEO_UPLOADED_QUEUE,
};
use vought_queue::{
    run_consumer, Broker, BrokerClient, Envelope, MessageHandler, QueueError, QueueResult,
    SharedClient,
};

use crate::encoder::VideoEncoder;

/// How long a result waits for a live broker handle once the consuming one
/// has broken.
const PUBLISHER_WAIT: Duration = Duration::from_secs(5);

/// Handles deliveries from the upload queue.
pub struct EncodeHandler<E> {
    encoder: E,
    /// Carries results the consuming handle can no longer publish
    publisher: SharedClient,
}

impl<E: VideoEncoder> EncodeHandler<E> {
    pub fn new(encoder: E, publisher: SharedClient) -> Self {
        Self { encoder, publisher }
    }

    /// Best effort: a lost result is logged, not retried.
    ///
    /// Goes out through `client` while it is open, otherwise through the
    /// shared publisher.
    async fn publish_result(&self, client: &BrokerClient, video: &Video) {
        let body = encode_video(video);
        let published = if client.is_closed() {
            debug!(
                video_id = %video.id,
                "Consuming handle closed, publishing result through shared handle"
            );
            self.publish_fallback(&body).await
        } else {
            client.publish(VIDEO_ENCODED_QUEUE, &body).await
        };

        match published {
            Ok(()) => debug!(video_id = %video.id, status = %video.status, "Published encode result"),
            Err(e) => error!(
                video_id = %video.id,
                status = %video.status,
                error = %e,
                "Failed to publish encode result"
            ),
        }
    }

    /// Publish through the shared handle. A handle found broken on first use
    /// is replaced once.
    async fn publish_fallback(&self, body: &[u8]) -> QueueResult<()> {
        let mut last_error = QueueError::Closed;
        for _ in 0..2 {
            let client = tokio::time::timeout(PUBLISHER_WAIT, self.publisher.get())
                .await
                .map_err(|_| QueueError::connection_lost("no live broker handle to publish with"))??;
            match client.publish(VIDEO_ENCODED_QUEUE, body).await {
                Err(e) if e.is_connection_error() => last_error = e,
                other => return other,
            }
        }
        Err(last_error)
    }
}

/// Move `video` along the lifecycle, forcing `fallback` if the table has no
/// such transition.
fn advance(video: &mut Video, event: PipelineEvent, fallback: VideoStatus) {
    if let Err(e) = video.apply(event) {
        warn!(video_id = %video.id, error = %e, "Unexpected status transition");
        video.status = fallback;
    }
}

#[async_trait]
impl<E: VideoEncoder> MessageHandler for EncodeHandler<E> {
    async fn handle(&self, client: &BrokerClient, envelope: Envelope) -> ControlFlow<()> {
        let mut video = match decode_video(&envelope.body) {
            Ok(video) => video,
            Err(e) => {
                // Left unsettled: the broker redelivers it to a later handle.
                error!(
                    delivery_tag = envelope.delivery_tag,
                    error = %e,
                    "Failed to decode upload event"
                );
                return ControlFlow::Continue(());
            }
        };

        advance(&mut video, PipelineEvent::EncodeStarted, VideoStatus::Encoding);
        info!(
            video_id = %video.id,
            redelivered = envelope.redelivered,
            "Starting encoding"
        );

        if let Err(e) = self.encoder.encode(&video).await {
            error!(video_id = %video.id, error = %e, "Failed to encode video");
            if let Err(e) = envelope.nack(false).await {
                error!(video_id = %video.id, error = %e, "Failed to nack upload event");
            }
            advance(&mut video, PipelineEvent::EncodeFailed, VideoStatus::FailEncode);
            self.publish_result(client, &video).await;
            return ControlFlow::Continue(());
        }

        if let Err(e) = envelope.ack().await {
            error!(video_id = %video.id, error = %e, "Failed to ack upload event");
            advance(&mut video, PipelineEvent::AckFailed, VideoStatus::FailEncode);
            self.publish_result(client, &video).await;
            return ControlFlow::Continue(());
        }

        advance(&mut video, PipelineEvent::EncodeSucceeded, VideoStatus::Complete);
        video.normalize_cover_path();
        self.publish_result(client, &video).await;
        ControlFlow::Continue(())
    }
}

/// Consume the upload queue until `cancel` fires, redialing the broker as
/// needed.
pub async fn consume_uploads<E: VideoEncoder>(
    broker: &Broker,
    encoder: E,
    cancel: &CancellationToken,
) {
    let publisher = SharedClient::spawn(broker, cancel);
    let handler = EncodeHandler::new(encoder, publisher.clone());
    let mut session = broker.with_redial(cancel);

    info!(queue = VIDEO_UPLOADED_QUEUE, "Consuming upload events");
    run_consumer(&mut session, VIDEO_UPLOADED_QUEUE, &handler, cancel).await;
    publisher.close();
    info!(queue = VIDEO_UPLOADED_QUEUE, "Upload consumer stopped");
}
