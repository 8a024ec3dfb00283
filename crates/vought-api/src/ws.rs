//! Real-time status bridge.
//!
//! Each socket gets an ephemeral broker queue. Text frames from the browser
//! are video ids to bind to that queue; status updates routed to it are
//! forwarded as JSON text frames. Three loops run per socket (client reads,
//! forwarding, heartbeat) and stop together on one cancellation token.
//!
//! The queue belongs to the socket, not to any broker handle: it survives
//! reconnects of the shared bus and of the forwarding session, which
//! re-declares it and its bindings on every new handle. It is deleted only
//! when the socket goes away.

use std::collections::HashSet;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum_extra::headers::Cookie;
use axum_extra::TypedHeader;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vought_models::{decode_video, StatusNotification};
use vought_queue::{
    run_consumer, BrokerClient, Envelope, MessageHandler, QueueResult, SharedClient,
};

use crate::auth::{authorize, AUTH_COOKIE};
use crate::metrics;
use crate::state::AppState;

/// First frame sent on every accepted socket.
pub const CONNECTION_ACK: &str = "Connection is a success";

/// Upper bound on releasing the ephemeral queue at teardown.
const QUEUE_RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Global counter for active WebSocket connections.
static ACTIVE_WS_CONNECTIONS: AtomicI64 = AtomicI64::new(0);

/// Send a WebSocket message with backpressure handling.
async fn send_ws_message(tx: &mpsc::Sender<Message>, msg: Message) -> bool {
    match tx.try_send(msg) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(msg)) => {
            debug!("WebSocket send buffer full, applying backpressure");
            tx.send(msg).await.is_ok()
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

/// `GET /ws`. The credential is checked before the upgrade is accepted.
pub async fn ws_handler(
    State(state): State<AppState>,
    cookie: Option<TypedHeader<Cookie>>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let credential = cookie
        .as_ref()
        .and_then(|TypedHeader(cookie)| cookie.get(AUTH_COOKIE));
    if let Err(e) = authorize(credential, &state.config) {
        warn!(error = %e, "Rejected socket upgrade");
        return e.into_response();
    }

    let ws = match upgrade {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    metrics::record_ws_connection();
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        serve_socket(state, sink, stream).await;
    })
}

/// Per-socket state shared by the three loops.
struct ConnectionContext {
    queue: String,
    cancel: CancellationToken,
    last_heartbeat: Mutex<Instant>,
    subscriptions: Mutex<HashSet<String>>,
}

impl ConnectionContext {
    fn new(queue: String, cancel: CancellationToken) -> Self {
        Self {
            queue,
            cancel,
            last_heartbeat: Mutex::new(Instant::now()),
            subscriptions: Mutex::new(HashSet::new()),
        }
    }

    fn touch(&self) {
        *self
            .last_heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn since_heartbeat(&self) -> Duration {
        self.last_heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    fn is_subscribed(&self, routing_key: &str) -> bool {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(routing_key)
    }

    fn add_subscription(&self, routing_key: &str) {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(routing_key.to_string());
    }

    fn subscriptions(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

/// Drive one accepted socket until it closes, times out, or the server
/// shuts down. The sink is closed exactly once, on the way out.
pub async fn serve_socket<S, R, E>(state: AppState, sink: S, stream: R)
where
    S: Sink<Message> + Send + 'static,
    R: Stream<Item = Result<Message, E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let count = ACTIVE_WS_CONNECTIONS.fetch_add(1, Ordering::SeqCst) + 1;
    metrics::set_ws_active_connections(count);

    let (tx, mut rx) = mpsc::channel::<Message>(state.config.ws_send_buffer);

    // Sole owner of the sink.
    let send_task = tokio::spawn(async move {
        let mut sink = Box::pin(sink);
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    if send_ws_message(&tx, Message::Text(CONNECTION_ACK.to_string())).await {
        bridge(&state, &tx, stream).await;
    }

    drop(tx);
    let _ = send_task.await;

    let count = ACTIVE_WS_CONNECTIONS.fetch_sub(1, Ordering::SeqCst) - 1;
    metrics::set_ws_active_connections(count);
}

async fn bridge<R, E>(state: &AppState, tx: &mpsc::Sender<Message>, stream: R)
where
    R: Stream<Item = Result<Message, E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let queue = match allocate_queue(&state.bus).await {
        Ok(queue) => queue,
        Err(e) => {
            warn!(error = %e, "Could not allocate a queue for socket");
            return;
        }
    };
    info!(queue = %queue, "Socket connected");

    let ctx = Arc::new(ConnectionContext::new(queue, state.shutdown.child_token()));

    let client_loop = tokio::spawn(read_client(ctx.clone(), state.bus.clone(), stream));
    let forward_loop = tokio::spawn({
        let ctx = ctx.clone();
        let broker = state.broker.clone();
        let handler = ForwardHandler {
            ctx: ctx.clone(),
            tx: tx.clone(),
        };
        async move {
            let mut session = broker.with_redial(&ctx.cancel);
            run_consumer(&mut session, &ctx.queue, &handler, &ctx.cancel).await;
        }
    });

    heartbeat(&ctx, tx, state.config.ws_heartbeat).await;

    ctx.cancel.cancel();
    let _ = client_loop.await;
    let _ = forward_loop.await;

    release_queue(&state.bus, &ctx.queue).await;
    info!(queue = %ctx.queue, "Socket disconnected");
}

async fn allocate_queue(bus: &SharedClient) -> QueueResult<String> {
    bus.get().await?.allocate_queue().await
}

async fn release_queue(bus: &SharedClient, queue: &str) {
    let released = tokio::time::timeout(QUEUE_RELEASE_TIMEOUT, async {
        bus.get().await?.delete_queue(queue).await
    })
    .await;
    match released {
        Ok(Ok(())) => debug!(queue, "Released socket queue"),
        Ok(Err(e)) => warn!(queue, error = %e, "Could not release socket queue"),
        Err(_) => warn!(queue, "Timed out releasing socket queue"),
    }
}

/// Client-message loop: text frames subscribe, pongs refresh the heartbeat,
/// a close frame ends the connection.
async fn read_client<R, E>(ctx: Arc<ConnectionContext>, bus: SharedClient, stream: R)
where
    R: Stream<Item = Result<Message, E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let mut stream = Box::pin(stream);
    loop {
        let frame = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                let routing_key = text.trim();
                if routing_key.is_empty() || ctx.is_subscribed(routing_key) {
                    continue;
                }
                match subscribe(&bus, &ctx.queue, routing_key).await {
                    Ok(()) => {
                        ctx.add_subscription(routing_key);
                        metrics::record_ws_subscription();
                        debug!(queue = %ctx.queue, video_id = routing_key, "Socket subscribed");
                    }
                    Err(e) => {
                        warn!(queue = %ctx.queue, video_id = routing_key, error = %e, "Subscribe failed");
                    }
                }
            }
            Some(Ok(Message::Pong(_))) => ctx.touch(),
            Some(Ok(Message::Close(_))) | None => {
                debug!(queue = %ctx.queue, "Client closed connection");
                ctx.cancel.cancel();
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(queue = %ctx.queue, error = %e, "Socket read error");
            }
        }
    }
}

async fn subscribe(bus: &SharedClient, queue: &str, routing_key: &str) -> QueueResult<()> {
    bus.get().await?.queue_bind(queue, routing_key).await
}

/// Update-forwarding loop body.
struct ForwardHandler {
    ctx: Arc<ConnectionContext>,
    tx: mpsc::Sender<Message>,
}

#[async_trait]
impl MessageHandler for ForwardHandler {
    /// Restore the socket's queue and bindings on a fresh handle, in case
    /// they were lost with the previous one.
    async fn prepare(&self, client: &BrokerClient) -> QueueResult<()> {
        client.declare_ephemeral_queue(&self.ctx.queue).await?;
        let subscriptions = self.ctx.subscriptions();
        for routing_key in &subscriptions {
            client.queue_bind(&self.ctx.queue, routing_key).await?;
        }
        debug!(
            queue = %self.ctx.queue,
            client = client.id(),
            bindings = subscriptions.len(),
            "Socket queue ready on broker handle"
        );
        Ok(())
    }

    async fn handle(&self, _client: &BrokerClient, envelope: Envelope) -> ControlFlow<()> {
        let mut video = match decode_video(&envelope.body) {
            Ok(video) => video,
            Err(e) => {
                warn!(delivery_tag = envelope.delivery_tag, error = %e, "Failed to decode status update");
                return ControlFlow::Continue(());
            }
        };
        // Subscribers know a video by the key they bound.
        video.title = envelope.routing_key.clone();

        let json = match StatusNotification::from(&video).to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(video_id = %video.id, error = %e, "Failed to serialize status update");
                return ControlFlow::Continue(());
            }
        };

        if !send_ws_message(&self.tx, Message::Text(json)).await {
            warn!(video_id = %video.id, "WebSocket send failed, client disconnected");
            return ControlFlow::Break(());
        }
        metrics::record_ws_message_sent("status");

        if let Err(e) = envelope.ack().await {
            warn!(video_id = %video.id, error = %e, "Failed to ack status update");
        }
        ControlFlow::Continue(())
    }
}

/// Heartbeat loop. Checks run every 0.9 of `period`, the first one at once.
async fn heartbeat(ctx: &ConnectionContext, tx: &mpsc::Sender<Message>, period: Duration) {
    let mut ticker = interval(period.mul_f64(0.9));
    loop {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let silent_for = ctx.since_heartbeat();
        if silent_for > period {
            info!(
                queue = %ctx.queue,
                silent_ms = silent_for.as_millis() as u64,
                "Heartbeat timed out"
            );
            ctx.cancel.cancel();
            return;
        }

        if !send_ws_message(tx, Message::Ping(Vec::new())).await {
            warn!(queue = %ctx.queue, "Heartbeat failed, client disconnected");
            ctx.cancel.cancel();
            return;
        }
        metrics::record_ws_message_sent("ping");
    }
}
