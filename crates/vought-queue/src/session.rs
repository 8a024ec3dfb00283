//! Broker entry point and self-healing sessions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::client::BrokerClient;
use crate::config::BrokerConfig;
use crate::error::{QueueError, QueueResult};
use crate::memory::MemoryTransport;
use crate::metrics;
use crate::redis_transport::RedisTransport;
use crate::transport::Transport;

/// Failed connection attempts logged before the redial loop goes quiet.
const MAX_LOGGED_CONNECT_FAILURES: u32 = 5;

/// A configured broker that hands out client handles.
#[derive(Clone)]
pub struct Broker {
    transport: Arc<dyn Transport>,
    config: Arc<BrokerConfig>,
}

impl Broker {
    /// Build the transport named by `config.url` and check it is reachable.
    ///
    /// Unlike [`Broker::with_redial`], failure here is returned to the
    /// caller; a process that cannot reach its broker at startup should exit.
    pub async fn connect(config: BrokerConfig) -> QueueResult<Self> {
        let transport: Arc<dyn Transport> = if config.url.starts_with("memory://") {
            Arc::new(MemoryTransport::new())
        } else if config.url.starts_with("redis://") || config.url.starts_with("rediss://") {
            Arc::new(RedisTransport::new(&config)?)
        } else {
            return Err(QueueError::InvalidUrl(config.url));
        };

        let broker = Self::new(transport, config);
        let first = broker.client().await?;
        first.close().await;

        info!(prefix = %broker.config.key_prefix, "Broker reachable");
        Ok(broker)
    }

    pub fn new(transport: Arc<dyn Transport>, config: BrokerConfig) -> Self {
        Self {
            transport,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Open one handle with the durable queues declared.
    pub async fn client(&self) -> QueueResult<BrokerClient> {
        let conn = self.transport.connect().await?;
        for queue in &self.config.durable_queues {
            if let Err(e) = conn.declare_queue(queue).await {
                conn.close().await;
                return Err(e);
            }
        }
        Ok(BrokerClient::new(conn, self.config.clone()))
    }

    /// Start a session that keeps delivering live handles.
    ///
    /// Each time the current handle closes, for whatever reason, a new one is
    /// dialed (with backoff, without limit) and delivered. A handle that
    /// closes within one ping interval of connecting does not reset the
    /// backoff, so a broker that accepts and then drops connections is
    /// redialed at the backed-off pace. The session stops
    /// when `cancel` fires or the [`Session`] is dropped.
    pub fn with_redial(&self, cancel: &CancellationToken) -> Session {
        let cancel = cancel.child_token();
        let (tx, rx) = mpsc::channel(1);
        let state = Arc::new(SessionState::default());

        tokio::spawn(redial(self.clone(), tx, state.clone(), cancel.clone()));

        Session {
            handles: rx,
            state,
            cancel,
        }
    }
}

#[derive(Default)]
struct SessionState {
    current: RwLock<Option<BrokerClient>>,
    reconnects: AtomicU64,
}

impl SessionState {
    fn set_current(&self, client: Option<BrokerClient>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = client;
    }
}

/// Sequence of broker handles; at most one is live at a time.
pub struct Session {
    handles: mpsc::Receiver<BrokerClient>,
    state: Arc<SessionState>,
    cancel: CancellationToken,
}

impl Session {
    /// Wait for the next live handle. `None` once the session is cancelled.
    pub async fn next(&mut self) -> Option<BrokerClient> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            client = self.handles.recv() => client,
        }
    }

    /// The handle currently being supervised, if any.
    pub fn current(&self) -> Option<BrokerClient> {
        self.state
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Connections established after the first one.
    pub fn reconnects(&self) -> u64 {
        self.state.reconnects.load(Ordering::Relaxed)
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop redialing and close the current handle.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn redial(
    broker: Broker,
    tx: mpsc::Sender<BrokerClient>,
    state: Arc<SessionState>,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(
        broker.config.reconnect_base_delay,
        broker.config.reconnect_max_delay,
    );
    let mut failed_connects: u32 = 0;
    let mut connected_once = false;

    loop {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => break,
            attempt = broker.client() => attempt,
        };

        let client = match attempt {
            Ok(client) => client,
            Err(e) => {
                let delay = backoff.next_delay();
                failed_connects = failed_connects.saturating_add(1);
                let retry_in_ms = delay.as_millis() as u64;
                if failed_connects <= MAX_LOGGED_CONNECT_FAILURES {
                    warn!(
                        error = %e,
                        attempt = failed_connects,
                        retry_in_ms,
                        "Broker connection failed, retrying"
                    );
                } else if failed_connects == MAX_LOGGED_CONNECT_FAILURES + 1 {
                    warn!(
                        error = %e,
                        attempt = failed_connects,
                        "Broker still unreachable, suppressing further connection failure logs"
                    );
                } else {
                    debug!(
                        error = %e,
                        attempt = failed_connects,
                        retry_in_ms,
                        "Broker connection failed, retrying"
                    );
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };

        if failed_connects > MAX_LOGGED_CONNECT_FAILURES {
            info!(failed_attempts = failed_connects, "Broker reachable again");
        }
        failed_connects = 0;
        let connected_at = Instant::now();
        if connected_once {
            state.reconnects.fetch_add(1, Ordering::Relaxed);
            metrics::record_reconnect();
            info!(client = client.id(), "Reconnected to broker");
        } else {
            debug!(client = client.id(), "Connected to broker");
        }
        connected_once = true;
        state.set_current(Some(client.clone()));

        let delivered = tokio::select! {
            _ = cancel.cancelled() => false,
            sent = tx.send(client.clone()) => sent.is_ok(),
        };
        if delivered {
            supervise(&client, broker.config.ping_interval, &cancel).await;
        }

        state.set_current(None);
        client.close().await;

        if !delivered || cancel.is_cancelled() {
            break;
        }

        if connected_at.elapsed() >= broker.config.ping_interval {
            backoff.reset();
        } else {
            let delay = backoff.next_delay();
            debug!(
                client = client.id(),
                retry_in_ms = delay.as_millis() as u64,
                "Broker handle closed soon after connecting, backing off"
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    debug!("Broker session stopped");
}

/// Watch a delivered handle until it closes, pinging it while idle.
async fn supervise(client: &BrokerClient, ping_interval: Duration, cancel: &CancellationToken) {
    let mut ticker = tokio::time::interval(ping_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = client.closed() => return,
            _ = ticker.tick() => {
                if let Err(e) = client.ping().await {
                    warn!(client = client.id(), error = %e, "Broker handle failed liveness check");
                    client.mark_broken();
                    return;
                }
            }
        }
    }
}

/// A long-lived handle for request-scoped work, replaced behind the scenes
/// whenever its connection breaks.
#[derive(Clone)]
pub struct SharedClient {
    rx: watch::Receiver<Option<BrokerClient>>,
    cancel: CancellationToken,
}

impl SharedClient {
    pub fn spawn(broker: &Broker, cancel: &CancellationToken) -> Self {
        let mut session = broker.with_redial(cancel);
        let cancel = session.cancellation();
        let (tx, rx) = watch::channel(None);

        tokio::spawn(async move {
            while let Some(client) = session.next().await {
                tx.send_replace(Some(client.clone()));
                client.closed().await;
            }
            tx.send_replace(None);
        });

        Self { rx, cancel }
    }

    /// The live handle, waiting for a reconnect if the last one broke.
    pub async fn get(&self) -> QueueResult<BrokerClient> {
        let mut rx = self.rx.clone();
        let guard = rx
            .wait_for(|client| client.as_ref().is_some_and(|c| !c.is_closed()))
            .await
            .map_err(|_| QueueError::Closed)?;
        let client = (*guard).clone();
        drop(guard);
        client.ok_or(QueueError::Closed)
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}
