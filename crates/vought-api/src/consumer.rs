//! Encode-result consumer: persists each result and notifies subscribers.

use std::ops::ControlFlow;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vought_models::{decode_video, encode_video, PipelineEvent, VideoStatus, VIDEO_ENCODED_QUEUE};
use vought_queue::{run_consumer, Broker, BrokerClient, Envelope, MessageHandler};

use crate::metrics;
use crate::repository::VideoRepository;

/// Handles deliveries from the encoded-videos queue.
pub struct StatusHandler {
    videos: Arc<dyn VideoRepository>,
}

impl StatusHandler {
    pub fn new(videos: Arc<dyn VideoRepository>) -> Self {
        Self { videos }
    }
}

#[async_trait]
impl MessageHandler for StatusHandler {
    async fn handle(&self, client: &BrokerClient, envelope: Envelope) -> ControlFlow<()> {
        let result = match decode_video(&envelope.body) {
            Ok(video) => video,
            Err(e) => {
                // Left unsettled: the broker redelivers it to a later handle.
                error!(
                    delivery_tag = envelope.delivery_tag,
                    error = %e,
                    "Failed to decode encode result"
                );
                return ControlFlow::Continue(());
            }
        };
        debug!(video_id = %result.id, status = %result.status, "Encode result received");

        let mut record = match self.videos.get_video(&result.id).await {
            Ok(record) => record,
            Err(e) => {
                error!(video_id = %result.id, error = %e, "Failed to get video record");
                if let Err(e) = envelope.nack(false).await {
                    error!(video_id = %result.id, error = %e, "Failed to nack encode result");
                }

                // Without a record there is no title; subscribers keyed on
                // the id still learn the video failed.
                let mut failed = result;
                failed.status = VideoStatus::FailEncode;
                metrics::record_video_encoded(failed.status);
                if let Err(e) = client.publish(failed.id.as_str(), &encode_video(&failed)).await {
                    error!(video_id = %failed.id, error = %e, "Failed to publish status update");
                }
                return ControlFlow::Continue(());
            }
        };

        let outcome = PipelineEvent::result_of(result.status);
        if let Err(e) = record.apply(outcome) {
            warn!(video_id = %record.id, error = %e, "Unexpected status transition");
            record.status = if result.status == VideoStatus::Complete {
                VideoStatus::Complete
            } else {
                VideoStatus::FailEncode
            };
        }
        record.cover_path = result.cover_path;

        // Not retried; the result is still acked and announced.
        if let Err(e) = self.videos.update_video(&record).await {
            error!(
                video_id = %record.id,
                status = %record.status,
                error = %e,
                "Failed to update video record"
            );
        }

        metrics::record_video_encoded(record.status);

        // Subscribers bind on the routing key, which is the record's title.
        if let Err(e) = client.publish(&record.title, &encode_video(&record)).await {
            error!(video_id = %record.id, error = %e, "Failed to publish status update");
        }

        if let Err(e) = envelope.ack().await {
            error!(video_id = %record.id, error = %e, "Failed to ack encode result");
        }
        ControlFlow::Continue(())
    }
}

/// Consume the encoded-videos queue until `cancel` fires.
pub async fn consume_encoded(
    broker: &Broker,
    videos: Arc<dyn VideoRepository>,
    cancel: &CancellationToken,
) {
    let handler = StatusHandler::new(videos);
    let mut session = broker.with_redial(cancel);

    info!(queue = VIDEO_ENCODED_QUEUE, "Consuming encode results");
    run_consumer(&mut session, VIDEO_ENCODED_QUEUE, &handler, cancel).await;
    info!(queue = VIDEO_ENCODED_QUEUE, "Encode result consumer stopped");
}
