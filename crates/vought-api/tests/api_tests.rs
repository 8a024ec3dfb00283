//! Encode-result consumer and HTTP surface tests.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use futures_util::StreamExt;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use vought_api::auth::encode_cookie_value;
use vought_api::{
    consume_encoded, create_router, ApiConfig, ApiError, AppState, MemoryVideoRepository,
    RepositoryError, VideoRepository,
};
use vought_models::{
    decode_video, encode_video, Video, VideoId, VideoStatus, VIDEO_ENCODED_QUEUE,
};
use vought_queue::{Broker, BrokerClient, BrokerConfig, MemoryTransport};

struct Harness {
    transport: MemoryTransport,
    broker: Broker,
    videos: Arc<MemoryVideoRepository>,
    cancel: CancellationToken,
}

impl Harness {
    fn new() -> Self {
        let transport = MemoryTransport::new();
        let broker = Broker::new(Arc::new(transport.clone()), BrokerConfig::memory());
        Self {
            transport,
            broker,
            videos: Arc::new(MemoryVideoRepository::new()),
            cancel: CancellationToken::new(),
        }
    }

    fn start_consumer(&self) {
        let broker = self.broker.clone();
        let videos: Arc<dyn VideoRepository> = self.videos.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move { consume_encoded(&broker, videos, &cancel).await });
    }

    /// A queue receiving everything published on `routing_key`.
    async fn watch(&self, routing_key: &str) -> (BrokerClient, String) {
        let client = self.broker.client().await.unwrap();
        let queue = client.random_queue_name().await.unwrap();
        client.queue_bind(&queue, routing_key).await.unwrap();
        (client, queue)
    }

    async fn publish_result(&self, body: &[u8]) {
        let client = self.broker.client().await.unwrap();
        client.publish(VIDEO_ENCODED_QUEUE, body).await.unwrap();
        client.close().await;
    }

    async fn record(&self, id: &str) -> Video {
        self.videos.get_video(&VideoId::from(id)).await.unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn drain(client: &BrokerClient, queue: &str) -> Vec<Video> {
    let mut deliveries = client.consume(queue).await.unwrap();
    let mut videos = Vec::new();
    while let Ok(Some(envelope)) =
        tokio::time::timeout(Duration::from_millis(200), deliveries.next()).await
    {
        videos.push(decode_video(&envelope.body).unwrap());
        envelope.ack().await.unwrap();
    }
    videos
}

fn encoding(id: &str) -> Video {
    Video::new(VideoId::from(id), id, format!("{id}/in.mp4")).with_status(VideoStatus::Encoding)
}

#[tokio::test]
async fn test_complete_result_is_persisted_and_announced() {
    let harness = Harness::new();
    assert_ok!(harness.videos.create_video(&encoding("v3")).await);
    let (watcher, queue) = harness.watch("v3").await;
    harness.start_consumer();

    let result = encoding("v3")
        .with_status(VideoStatus::Complete)
        .with_cover_path("v3/cover.jpeg");
    harness.publish_result(&encode_video(&result)).await;

    let notifications = drain(&watcher, &queue).await;
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].status, VideoStatus::Complete);
    assert_eq!(notifications[0].cover_path, "v3/cover.jpeg");

    let record = harness.record("v3").await;
    assert_eq!(record.status, VideoStatus::Complete);
    assert_eq!(record.cover_path, "v3/cover.jpeg");
    assert_eq!(record.source_path, "v3/in.mp4");

    wait_until(|| harness.transport.unsettled() == 0).await;
    assert_eq!(harness.transport.queue_len(VIDEO_ENCODED_QUEUE), 0);
    watcher.close().await;
}

#[tokio::test]
async fn test_failed_result_marks_record_failed() {
    let harness = Harness::new();
    let original = encoding("v4").with_cover_path("v4/cover.png");
    assert_ok!(harness.videos.create_video(&original).await);
    let (watcher, queue) = harness.watch("v4").await;
    harness.start_consumer();

    let result = original.clone().with_status(VideoStatus::FailEncode);
    harness.publish_result(&encode_video(&result)).await;

    let notifications = drain(&watcher, &queue).await;
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].status, VideoStatus::FailEncode);

    let record = harness.record("v4").await;
    assert_eq!(record.status, VideoStatus::FailEncode);
    assert_eq!(record.cover_path, "v4/cover.png");
    watcher.close().await;
}

#[tokio::test]
async fn test_unknown_video_is_rejected_and_reported_failed() {
    let harness = Harness::new();
    let (watcher, queue) = harness.watch("ghost").await;
    harness.start_consumer();

    let result = encoding("ghost").with_status(VideoStatus::Complete);
    harness.publish_result(&encode_video(&result)).await;

    wait_until(|| harness.transport.dead_letters(VIDEO_ENCODED_QUEUE).len() == 1).await;
    let notifications = drain(&watcher, &queue).await;
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].id.as_str(), "ghost");
    assert_eq!(notifications[0].status, VideoStatus::FailEncode);

    // Nothing was created for it.
    assert!(matches!(
        harness.videos.get_video(&VideoId::from("ghost")).await,
        Err(RepositoryError::NotFound(_))
    ));
    watcher.close().await;
}

#[tokio::test]
async fn test_malformed_result_is_left_unsettled() {
    let harness = Harness::new();
    harness.start_consumer();

    harness.publish_result(b"\xff\xfe not a video").await;

    wait_until(|| {
        harness.transport.queue_len(VIDEO_ENCODED_QUEUE) == 0 && harness.transport.unsettled() == 1
    })
    .await;
    assert!(harness.transport.dead_letters(VIDEO_ENCODED_QUEUE).is_empty());
}

fn http_state(harness: &Harness) -> AppState {
    let config = ApiConfig {
        user_auth: "admin".to_string(),
        pwd_auth: "pw".to_string(),
        ..ApiConfig::default()
    };
    AppState::from_parts(
        config,
        harness.broker.clone(),
        harness.videos.clone(),
        harness.cancel.child_token(),
    )
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_endpoints() {
    let harness = Harness::new();
    let app = create_router(http_state(&harness), None);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "healthy");

    let response = app
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["broker"]["status"], "ok");
}

#[tokio::test]
async fn test_socket_requires_credential() {
    let harness = Harness::new();
    let app = create_router(http_state(&harness), None);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["detail"], "Unauthorized");

    let wrong = format!("Authorization={}", encode_cookie_value("admin", "nope"));
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/ws")
                .header(header::COOKIE, wrong)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // A valid credential gets past the check; the plain request then fails
    // the upgrade itself.
    let right = format!("Authorization={}", encode_cookie_value("admin", "pw"));
    let response = app
        .oneshot(
            Request::builder()
                .uri("/ws")
                .header(header::COOKIE, right)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_ne!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn test_state_from_urls() {
    let config = ApiConfig {
        video_store_url: "memory://".to_string(),
        ..ApiConfig::default()
    };
    let state = assert_ok!(AppState::new(config, BrokerConfig::memory()).await);
    state.shutdown.cancel();

    let config = ApiConfig {
        video_store_url: "ftp://videos".to_string(),
        ..ApiConfig::default()
    };
    assert!(matches!(
        AppState::new(config, BrokerConfig::memory()).await,
        Err(ApiError::Repository(RepositoryError::InvalidUrl(_)))
    ));
}
