//! Redis Streams transport integration tests.

use std::time::Duration;

use futures_util::StreamExt;
use redis::AsyncCommands;
use uuid::Uuid;
use vought_queue::{Broker, BrokerConfig};

fn isolated_config() -> BrokerConfig {
    dotenvy::dotenv().ok();

    BrokerConfig {
        key_prefix: format!("vought-test-{}", Uuid::new_v4().simple()),
        ..BrokerConfig::from_env()
    }
}

/// Test publish, consume, and ack through a durable queue.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_publish_consume_ack() {
    let broker = Broker::connect(isolated_config())
        .await
        .expect("Failed to connect to Redis");
    let client = broker.client().await.expect("Failed to open handle");

    client
        .publish("video-uploaded", b"payload")
        .await
        .expect("Failed to publish");

    let mut deliveries = client.consume("video-uploaded").await.expect("Failed to consume");
    let envelope = deliveries.next().await.expect("No delivery");
    assert_eq!(envelope.body, b"payload");
    assert_eq!(envelope.routing_key, "video-uploaded");
    envelope.ack().await.expect("Failed to ack");

    client.close().await;
}

/// Test that a delivery left unsettled is replayed by the next handle.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_unsettled_delivery_replayed() {
    let broker = Broker::connect(isolated_config())
        .await
        .expect("Failed to connect to Redis");

    let first = broker.client().await.expect("Failed to open handle");
    first
        .publish("video-encoded", b"pending")
        .await
        .expect("Failed to publish");
    let mut deliveries = first.consume("video-encoded").await.expect("Failed to consume");
    let _unsettled = deliveries.next().await.expect("No delivery");
    first.close().await;

    let second = broker.client().await.expect("Failed to open handle");
    let mut deliveries = second.consume("video-encoded").await.expect("Failed to consume");
    let envelope = deliveries.next().await.expect("No redelivery");
    assert_eq!(envelope.body, b"pending");
    assert!(envelope.redelivered);
    envelope.ack().await.expect("Failed to ack");

    second.close().await;
}

/// Test routing through a bound ephemeral queue.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_bound_ephemeral_queue() {
    let broker = Broker::connect(isolated_config())
        .await
        .expect("Failed to connect to Redis");
    let client = broker.client().await.expect("Failed to open handle");

    let queue = client.random_queue_name().await.expect("Failed to declare queue");
    client.queue_bind(&queue, "my-title").await.expect("Failed to bind");
    client
        .publish("my-title", b"update")
        .await
        .expect("Failed to publish");

    let mut deliveries = client.consume(&queue).await.expect("Failed to consume");
    let envelope = deliveries.next().await.expect("No delivery");
    assert_eq!(envelope.routing_key, "my-title");
    envelope.nack(false).await.expect("Failed to nack");

    client.close().await;
}

/// Test that an unsettled replayed entry does not hold back newer ones.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_unsettled_replay_does_not_block_new_entries() {
    let broker = Broker::connect(isolated_config())
        .await
        .expect("Failed to connect to Redis");

    let first = broker.client().await.expect("Failed to open handle");
    first
        .publish("video-encoded", b"stuck")
        .await
        .expect("Failed to publish");
    let mut deliveries = first.consume("video-encoded").await.expect("Failed to consume");
    let _unsettled = deliveries.next().await.expect("No delivery");
    first.close().await;

    let second = broker.client().await.expect("Failed to open handle");
    second
        .publish("video-encoded", b"fresh")
        .await
        .expect("Failed to publish");
    let mut deliveries = second.consume("video-encoded").await.expect("Failed to consume");

    // The replayed entry is left unsettled, as a consumer does with a body
    // it cannot decode.
    let replayed = deliveries.next().await.expect("No redelivery");
    assert_eq!(replayed.body, b"stuck");
    assert!(replayed.redelivered);

    let fresh = tokio::time::timeout(Duration::from_secs(5), deliveries.next())
        .await
        .expect("New entry held back by the backlog")
        .expect("No delivery");
    assert_eq!(fresh.body, b"fresh");
    assert!(!fresh.redelivered);

    let more = tokio::time::timeout(Duration::from_millis(1500), deliveries.next()).await;
    assert!(more.is_err(), "Backlog entry replayed twice");
    assert_eq!(second.unsettled(), 2);

    fresh.ack().await.expect("Failed to ack");
    replayed.ack().await.expect("Failed to ack");
    second.close().await;
}

/// Test that an ephemeral queue expires and its bindings are pruned.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_ephemeral_queue_expires_and_binding_pruned() {
    let config = isolated_config();
    let prefix = config.key_prefix.clone();
    let mut raw = redis::Client::open(config.url.as_str())
        .expect("Invalid Redis URL")
        .get_multiplexed_async_connection()
        .await
        .expect("Failed to connect to Redis");
    let broker = Broker::connect(config).await.expect("Failed to connect to Redis");
    let client = broker.client().await.expect("Failed to open handle");

    let queue = client.allocate_queue().await.expect("Failed to declare queue");
    client.queue_bind(&queue, "my-title").await.expect("Failed to bind");

    let stream_key = format!("{prefix}:queue:{queue}");
    let bindings_key = format!("{prefix}:queue:{queue}:bindings");
    let binding_key = format!("{prefix}:binding:my-title");

    let stream_ttl: i64 = raw.pttl(&stream_key).await.expect("PTTL failed");
    let bindings_ttl: i64 = raw.pttl(&bindings_key).await.expect("PTTL failed");
    assert!(stream_ttl > 0, "stream has no TTL");
    assert!(bindings_ttl > 0, "bindings have no TTL");

    // The owner is gone and the queue ran out its TTL.
    raw.del::<_, ()>(&stream_key).await.expect("DEL failed");

    client
        .publish("my-title", b"update")
        .await
        .expect("Failed to publish");

    let still_bound: bool = raw.sismember(&binding_key, &queue).await.expect("SISMEMBER failed");
    let recreated: bool = raw.exists(&stream_key).await.expect("EXISTS failed");
    assert!(!still_bound);
    assert!(!recreated);

    client.close().await;
}
