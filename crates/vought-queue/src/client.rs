//! Broker client handle.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::stream::{self, BoxStream, StreamExt};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::delivery::Envelope;
use crate::error::{QueueError, QueueResult};
use crate::metrics;
use crate::transport::{Connection, RawMessage};

/// Stream of deliveries from one queue.
///
/// Ends when the handle closes or the connection fails.
pub type Deliveries = BoxStream<'static, Envelope>;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// A live connection to the broker.
///
/// Cheap to clone; clones share the connection and its delivery tags. Once
/// closed (explicitly or because the connection broke) a handle stays
/// closed: obtain a fresh one from a [`Session`](crate::Session).
#[derive(Clone)]
pub struct BrokerClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    id: u64,
    conn: Arc<dyn Connection>,
    config: Arc<BrokerConfig>,
    closed: CancellationToken,
    released: AtomicBool,
    next_tag: AtomicU64,
    unacked: Mutex<BTreeMap<u64, Pending>>,
    ephemeral: Mutex<HashSet<String>>,
}

struct Pending {
    queue: String,
    message: RawMessage,
}

#[derive(Clone, Copy)]
enum Settlement {
    Ack,
    Reject { requeue: bool },
}

impl Settlement {
    fn outcome(self) -> &'static str {
        match self {
            Settlement::Ack => "ack",
            Settlement::Reject { requeue: true } => "requeue",
            Settlement::Reject { requeue: false } => "reject",
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BrokerClient {
    pub(crate) fn new(conn: Arc<dyn Connection>, config: Arc<BrokerConfig>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
                conn,
                config,
                closed: CancellationToken::new(),
                released: AtomicBool::new(false),
                next_tag: AtomicU64::new(1),
                unacked: Mutex::new(BTreeMap::new()),
                ephemeral: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Process-unique handle id, for logs.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the handle is closed or broken.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.inner.closed.cancelled()
    }

    /// Flag the handle as unusable without releasing it yet.
    pub fn mark_broken(&self) {
        if !self.inner.closed.is_cancelled() {
            debug!(client = self.inner.id, "Broker handle marked broken");
            self.inner.closed.cancel();
        }
    }

    fn ensure_open(&self) -> QueueResult<()> {
        if self.is_closed() {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }

    /// Pass an operation's result through, marking the handle broken when
    /// the connection itself failed.
    fn observe<T>(&self, result: QueueResult<T>) -> QueueResult<T> {
        if let Err(e) = &result {
            if e.is_connection_error() {
                warn!(client = self.inner.id, error = %e, "Broker connection failed");
                self.mark_broken();
            }
        }
        result
    }

    pub async fn ping(&self) -> QueueResult<()> {
        self.ensure_open()?;
        self.observe(self.inner.conn.ping().await)
    }

    /// Publish `body` with `routing_key`.
    ///
    /// A message no queue is bound to is dropped, as with a direct exchange.
    pub async fn publish(&self, routing_key: &str, body: &[u8]) -> QueueResult<()> {
        self.ensure_open()?;
        let routed = self.observe(self.inner.conn.publish(routing_key, body).await)?;
        metrics::record_published(routed);
        if routed == 0 {
            debug!(routing_key, "Published message reached no queue");
        }
        Ok(())
    }

    /// Make `queue` receive messages published with `routing_key`.
    pub async fn queue_bind(&self, queue: &str, routing_key: &str) -> QueueResult<()> {
        self.ensure_open()?;
        self.observe(self.inner.conn.bind(queue, routing_key).await)
    }

    /// Declare a fresh uniquely named queue owned by this handle.
    ///
    /// The queue is deleted when the handle closes.
    pub async fn random_queue_name(&self) -> QueueResult<String> {
        let name = self.allocate_queue().await?;
        lock(&self.inner.ephemeral).insert(name.clone());
        Ok(name)
    }

    /// Declare a fresh uniquely named ephemeral queue owned by the caller.
    ///
    /// It outlives this handle: the caller deletes it, or it expires once
    /// nothing consumes it.
    pub async fn allocate_queue(&self) -> QueueResult<String> {
        let name = format!("{}.gen-{}", self.inner.config.key_prefix, Uuid::new_v4().simple());
        self.declare_ephemeral_queue(&name).await?;
        debug!(client = self.inner.id, queue = %name, "Declared ephemeral queue");
        Ok(name)
    }

    /// Declare `queue` ephemeral, or take over an existing one so that
    /// consuming it through this handle keeps it alive.
    pub async fn declare_ephemeral_queue(&self, queue: &str) -> QueueResult<()> {
        self.ensure_open()?;
        self.observe(self.inner.conn.declare_ephemeral_queue(queue).await)
    }

    pub async fn delete_queue(&self, queue: &str) -> QueueResult<()> {
        self.ensure_open()?;
        self.observe(self.inner.conn.delete_queue(queue).await)?;
        lock(&self.inner.ephemeral).remove(queue);
        Ok(())
    }

    /// Start consuming `queue`. Every delivery must be acked or nacked.
    pub async fn consume(&self, queue: &str) -> QueueResult<Deliveries> {
        self.ensure_open()?;

        struct State {
            client: BrokerClient,
            queue: String,
            buffer: VecDeque<RawMessage>,
        }

        let state = State {
            client: self.clone(),
            queue: queue.to_string(),
            buffer: VecDeque::new(),
        };

        let deliveries = stream::unfold(state, |mut state| async move {
            let inner = state.client.inner.clone();
            loop {
                if inner.closed.is_cancelled() {
                    return None;
                }
                if let Some(message) = state.buffer.pop_front() {
                    let envelope = state.client.track(&state.queue, message);
                    return Some((envelope, state));
                }

                let fetched = tokio::select! {
                    _ = inner.closed.cancelled() => return None,
                    fetched = inner.conn.fetch(
                        &state.queue,
                        inner.config.fetch_batch,
                        inner.config.fetch_block,
                    ) => fetched,
                };

                match fetched {
                    Ok(batch) => state.buffer.extend(batch),
                    Err(e) => {
                        warn!(
                            client = inner.id,
                            queue = %state.queue,
                            error = %e,
                            "Consume failed, closing delivery stream"
                        );
                        state.client.mark_broken();
                        return None;
                    }
                }
            }
        });

        Ok(deliveries.boxed())
    }

    fn track(&self, queue: &str, message: RawMessage) -> Envelope {
        let tag = self.inner.next_tag.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope::new(
            self.clone(),
            queue.to_string(),
            tag,
            message.routing_key.clone(),
            message.body.clone(),
            message.redelivered,
        );
        lock(&self.inner.unacked).insert(
            tag,
            Pending {
                queue: queue.to_string(),
                message,
            },
        );
        envelope
    }

    /// Acknowledge `tag`, or every outstanding tag up to it with `multiple`.
    pub async fn ack(&self, tag: u64, multiple: bool) -> QueueResult<()> {
        self.settle(tag, multiple, Settlement::Ack).await
    }

    /// Reject `tag`, or every outstanding tag up to it with `multiple`.
    pub async fn nack(&self, tag: u64, multiple: bool, requeue: bool) -> QueueResult<()> {
        self.settle(tag, multiple, Settlement::Reject { requeue })
            .await
    }

    async fn settle(&self, tag: u64, multiple: bool, settlement: Settlement) -> QueueResult<()> {
        self.ensure_open()?;

        let pending: Vec<(u64, Pending)> = {
            let mut unacked = lock(&self.inner.unacked);
            if !unacked.contains_key(&tag) {
                return Err(QueueError::UnknownDeliveryTag(tag));
            }
            if multiple {
                let rest = unacked.split_off(&(tag + 1));
                std::mem::replace(&mut *unacked, rest).into_iter().collect()
            } else {
                unacked.remove_entry(&tag).into_iter().collect()
            }
        };

        let mut pending = pending.into_iter();
        while let Some((tag, entry)) = pending.next() {
            let result = match settlement {
                Settlement::Ack => self.inner.conn.ack(&entry.queue, &entry.message).await,
                Settlement::Reject { requeue } => {
                    self.inner
                        .conn
                        .reject(&entry.queue, &entry.message, requeue)
                        .await
                }
            };
            if let Err(e) = self.observe(result) {
                // The failed tag and everything after it stay outstanding.
                let mut unacked = lock(&self.inner.unacked);
                unacked.insert(tag, entry);
                unacked.extend(pending);
                return Err(e);
            }
            metrics::record_settled(settlement.outcome());
        }
        Ok(())
    }

    /// Deliveries handed out through this handle and not settled yet.
    pub fn unsettled(&self) -> usize {
        lock(&self.inner.unacked).len()
    }

    /// Release the handle: ephemeral queues are deleted, unsettled
    /// deliveries go back to the broker. Safe to call more than once.
    pub async fn close(&self) {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.closed.cancel();

        let ephemeral: Vec<String> = lock(&self.inner.ephemeral).drain().collect();
        for queue in ephemeral {
            if let Err(e) = self.inner.conn.delete_queue(&queue).await {
                debug!(queue = %queue, error = %e, "Could not delete ephemeral queue");
            }
        }

        lock(&self.inner.unacked).clear();
        self.inner.conn.close().await;
        debug!(client = self.inner.id, "Broker handle closed");
    }
}

impl fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerClient")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
