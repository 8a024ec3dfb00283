//! Socket bridge scenarios over in-process sockets and the in-memory broker.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, PollSender};
use vought_api::{serve_socket, ApiConfig, AppState, MemoryVideoRepository, CONNECTION_ACK};
use vought_models::{encode_video, Video, VideoId, VideoStatus};
use vought_queue::{Broker, BrokerConfig, MemoryTransport};

const HEARTBEAT: Duration = Duration::from_secs(5);

fn app_state() -> (MemoryTransport, AppState) {
    let transport = MemoryTransport::new();
    let broker = Broker::new(Arc::new(transport.clone()), BrokerConfig::memory());
    let config = ApiConfig {
        ws_heartbeat: HEARTBEAT,
        ..ApiConfig::default()
    };
    let state = AppState::from_parts(
        config,
        broker,
        Arc::new(MemoryVideoRepository::new()),
        CancellationToken::new(),
    );
    (transport, state)
}

/// The browser end of an in-process socket.
struct Browser {
    frames: mpsc::Receiver<Message>,
    input: mpsc::UnboundedSender<Result<Message, Infallible>>,
    task: JoinHandle<()>,
}

impl Browser {
    fn connect(state: &AppState) -> Self {
        let (out_tx, frames) = mpsc::channel(64);
        let (input, in_rx) = mpsc::unbounded_channel();
        let stream = futures_util::stream::unfold(in_rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        });
        let task = tokio::spawn(serve_socket(state.clone(), PollSender::new(out_tx), stream));
        Self {
            frames,
            input,
            task,
        }
    }

    fn send(&self, message: Message) {
        self.input.send(Ok(message)).unwrap();
    }

    fn subscribe(&self, video_id: &str) {
        self.send(Message::Text(video_id.to_string()));
    }

    /// Next text frame, skipping pings. `None` once the socket is closed or
    /// nothing arrives within `wait`.
    async fn next_text(&mut self, wait: Duration) -> Option<String> {
        tokio::time::timeout(wait, async {
            loop {
                match self.frames.recv().await? {
                    Message::Text(text) => return Some(text),
                    _ => continue,
                }
            }
        })
        .await
        .ok()
        .flatten()
    }

    async fn expect_ack(&mut self) {
        assert_eq!(
            self.next_text(Duration::from_secs(5)).await.as_deref(),
            Some(CONNECTION_ACK)
        );
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

async fn publish_status(state: &AppState, routing_key: &str, video: &Video) {
    let client = state.bus.get().await.unwrap();
    client.publish(routing_key, &encode_video(video)).await.unwrap();
}

#[tokio::test]
async fn test_subscribed_socket_receives_one_frame() {
    let (transport, state) = app_state();
    let mut browser = Browser::connect(&state);
    browser.expect_ack().await;

    browser.subscribe("v7");
    wait_until(|| transport.bindings_of("v7").len() == 1).await;

    let video = Video::new(VideoId::from("v7"), "Holiday", "v7/in.mp4")
        .with_status(VideoStatus::Complete)
        .with_cover_path("v7/cover.jpeg");
    publish_status(&state, "v7", &video).await;

    let frame = browser.next_text(Duration::from_secs(5)).await.unwrap();
    let json: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(json["id"], "v7");
    assert_eq!(json["status"], "COMPLETE");
    assert_eq!(json["coverPath"], "v7/cover.jpeg");
    assert_eq!(json["source"], "v7/in.mp4");
    // The routing key stands in for the title.
    assert_eq!(json["title"], "v7");

    assert!(browser.next_text(Duration::from_millis(200)).await.is_none());
    wait_until(|| transport.unsettled() == 0).await;

    state.shutdown.cancel();
    browser.task.await.unwrap();
}

#[tokio::test]
async fn test_two_sockets_each_get_the_update() {
    let (transport, state) = app_state();
    let mut first = Browser::connect(&state);
    let mut second = Browser::connect(&state);
    first.expect_ack().await;
    second.expect_ack().await;

    first.subscribe("v2");
    second.subscribe("v2");
    // Repeated subscriptions are ignored.
    second.subscribe("v2");
    wait_until(|| transport.bindings_of("v2").len() == 2).await;

    let video = Video::new(VideoId::from("v2"), "v2", "v2/in.mp4")
        .with_status(VideoStatus::FailEncode);
    publish_status(&state, "v2", &video).await;

    for browser in [&mut first, &mut second] {
        let frame = browser.next_text(Duration::from_secs(5)).await.unwrap();
        assert!(frame.contains("FAIL_ENCODE"), "unexpected frame {frame}");
        assert!(browser.next_text(Duration::from_millis(200)).await.is_none());
    }

    state.shutdown.cancel();
    first.task.await.unwrap();
    second.task.await.unwrap();
}

#[tokio::test]
async fn test_unsubscribed_socket_receives_nothing() {
    let (transport, state) = app_state();
    let mut watcher = Browser::connect(&state);
    let mut idle = Browser::connect(&state);
    watcher.expect_ack().await;
    idle.expect_ack().await;

    watcher.subscribe("v5");
    wait_until(|| transport.bindings_of("v5").len() == 1).await;

    for status in [VideoStatus::Encoding, VideoStatus::Complete] {
        let video = Video::new(VideoId::from("v5"), "v5", "v5/in.mp4").with_status(status);
        publish_status(&state, "v5", &video).await;
    }

    assert!(watcher.next_text(Duration::from_secs(5)).await.is_some());
    assert!(watcher.next_text(Duration::from_secs(5)).await.is_some());
    assert!(idle.next_text(Duration::from_millis(300)).await.is_none());

    state.shutdown.cancel();
    watcher.task.await.unwrap();
    idle.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_silent_socket_torn_down_by_heartbeat() {
    let (_transport, state) = app_state();
    let started = Instant::now();
    let mut browser = Browser::connect(&state);

    let mut pings = 0;
    let mut acked = false;
    while let Some(frame) = browser.frames.recv().await {
        match frame {
            Message::Ping(_) => pings += 1,
            Message::Text(text) => {
                assert_eq!(text, CONNECTION_ACK);
                acked = true;
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    let elapsed = started.elapsed();
    assert!(acked);
    // Pings at 0 and 0.9P, teardown at the 1.8P check.
    assert_eq!(pings, 2);
    assert!(elapsed > HEARTBEAT, "torn down too early: {elapsed:?}");
    assert!(elapsed <= HEARTBEAT.mul_f64(1.9), "torn down too late: {elapsed:?}");

    browser.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_pong_keeps_socket_alive() {
    let (transport, state) = app_state();
    let started = Instant::now();
    let mut browser = Browser::connect(&state);
    browser.subscribe("v9");

    let mut pings = 0;
    while started.elapsed() < HEARTBEAT * 5 {
        match browser.frames.recv().await {
            Some(Message::Ping(payload)) => {
                pings += 1;
                browser.send(Message::Pong(payload));
            }
            Some(_) => {}
            None => panic!("socket closed while answering pings"),
        }
    }
    assert!(pings >= 5);
    assert_eq!(transport.bindings_of("v9").len(), 1);

    browser.send(Message::Close(None));
    while browser.frames.recv().await.is_some() {}
    browser.task.await.unwrap();

    // The socket's queue goes with it.
    assert!(transport.bindings_of("v9").is_empty());
}

#[tokio::test]
async fn test_dropped_client_stream_closes_socket() {
    let (transport, state) = app_state();
    let mut browser = Browser::connect(&state);
    browser.expect_ack().await;
    browser.subscribe("v4");
    wait_until(|| transport.bindings_of("v4").len() == 1).await;

    let Browser {
        mut frames,
        input,
        task,
    } = browser;
    drop(input);

    tokio::time::timeout(Duration::from_secs(5), async {
        while frames.recv().await.is_some() {}
    })
    .await
    .expect("socket not closed");
    task.await.unwrap();
    assert!(transport.bindings_of("v4").is_empty());
}

#[tokio::test]
async fn test_socket_queue_survives_bus_reconnect() {
    let (transport, state) = app_state();
    let mut browser = Browser::connect(&state);
    browser.expect_ack().await;
    browser.subscribe("v7");
    wait_until(|| transport.bindings_of("v7").len() == 1).await;
    let queue = transport.bindings_of("v7")[0].clone();

    let bus = state.bus.get().await.unwrap();
    bus.mark_broken();
    bus.close().await;
    let replacement = tokio::time::timeout(Duration::from_secs(5), state.bus.get())
        .await
        .unwrap()
        .unwrap();
    assert_ne!(bus.id(), replacement.id());

    assert!(transport.queue_exists(&queue));
    assert_eq!(transport.bindings_of("v7"), vec![queue]);

    let video = Video::new(VideoId::from("v7"), "v7", "v7/in.mp4")
        .with_status(VideoStatus::Complete);
    publish_status(&state, "v7", &video).await;
    let frame = browser.next_text(Duration::from_secs(5)).await.unwrap();
    assert!(frame.contains("COMPLETE"), "unexpected frame {frame}");

    state.shutdown.cancel();
    browser.task.await.unwrap();
}

#[tokio::test]
async fn test_lost_socket_queue_is_restored_with_bindings() {
    let (transport, state) = app_state();
    let mut browser = Browser::connect(&state);
    browser.expect_ack().await;
    browser.subscribe("v8");
    browser.subscribe("v9");
    wait_until(|| {
        transport.bindings_of("v8").len() == 1 && transport.bindings_of("v9").len() == 1
    })
    .await;
    let queue = transport.bindings_of("v8")[0].clone();

    // The broker loses the queue; the forwarding loop's handle breaks on it
    // and the next one declares and binds it again.
    let admin = state.bus.get().await.unwrap();
    admin.delete_queue(&queue).await.unwrap();
    assert!(!transport.queue_exists(&queue));
    wait_until(|| {
        transport.queue_exists(&queue)
            && transport.bindings_of("v8") == vec![queue.clone()]
            && transport.bindings_of("v9") == vec![queue.clone()]
    })
    .await;

    let video = Video::new(VideoId::from("v9"), "v9", "v9/in.mp4")
        .with_status(VideoStatus::FailEncode);
    publish_status(&state, "v9", &video).await;
    let frame = browser.next_text(Duration::from_secs(5)).await.unwrap();
    assert!(frame.contains("FAIL_ENCODE"), "unexpected frame {frame}");

    browser.send(Message::Close(None));
    while browser.frames.recv().await.is_some() {}
    browser.task.await.unwrap();
    assert!(!transport.queue_exists(&queue));
    assert!(transport.bindings_of("v8").is_empty());
}
