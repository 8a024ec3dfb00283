//! In-process transport.
//!
//! Used for local development (`BROKER_URL=memory://`) and tests. State is
//! shared by every clone of a [`MemoryTransport`], so several sessions can
//! talk to the same broker, and faults can be injected from the outside.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{QueueError, QueueResult};
use crate::transport::{Connection, RawMessage, Transport};

/// Broker living inside the current process.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, MemoryQueue>,
    /// routing key -> bound queues
    bindings: HashMap<String, BTreeSet<String>>,
    dead: HashMap<String, Vec<RawMessage>>,
    /// connection id -> deliveries not yet settled
    open: HashMap<u64, Vec<(String, RawMessage)>>,
    next_message_id: u64,
    next_connection_id: u64,
    failing_connects: usize,
    /// Successful acks left before one drops its connection
    acks_before_failure: Option<usize>,
}

#[derive(Default)]
struct MemoryQueue {
    /// Declared queues receive messages addressed to their own name
    declared: bool,
    ready: VecDeque<RawMessage>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BrokerState {
    /// Put every unsettled delivery of a connection back in front of its queue.
    fn release(&mut self, connection: u64) -> usize {
        let Some(inflight) = self.open.remove(&connection) else {
            return 0;
        };
        let count = inflight.len();
        for (queue, mut message) in inflight.into_iter().rev() {
            if let Some(q) = self.queues.get_mut(&queue) {
                message.redelivered = true;
                q.ready.push_front(message);
            }
        }
        count
    }

    fn take_inflight(&mut self, connection: u64, id: &str) -> Option<(String, RawMessage)> {
        let inflight = self.open.get_mut(&connection)?;
        let pos = inflight.iter().position(|(_, m)| m.id == id)?;
        Some(inflight.remove(pos))
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every open connection, as if the broker restarted.
    ///
    /// Unsettled deliveries go back to their queues marked redelivered.
    pub fn sever_connections(&self) {
        let mut state = self.shared.lock();
        let ids: Vec<u64> = state.open.keys().copied().collect();
        let requeued: usize = ids.into_iter().map(|id| state.release(id)).sum();
        drop(state);
        debug!(requeued, "Severed all in-memory broker connections");
        self.shared.notify.notify_waiters();
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.shared.lock().failing_connects = count;
    }

    /// Let `successes` more acks through, then drop the connection of the
    /// next one mid-ack. Its unsettled deliveries are requeued.
    pub fn fail_ack_after(&self, successes: usize) {
        self.shared.lock().acks_before_failure = Some(successes);
    }

    pub fn open_connections(&self) -> usize {
        self.shared.lock().open.len()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.shared.lock().queues.contains_key(queue)
    }

    /// Messages ready for delivery (not counting unsettled ones).
    pub fn queue_len(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Deliveries handed out and not yet settled, across all connections.
    pub fn unsettled(&self) -> usize {
        self.shared.lock().open.values().map(Vec::len).sum()
    }

    /// Bodies of messages rejected without requeue from `queue`.
    pub fn dead_letters(&self, queue: &str) -> Vec<Vec<u8>> {
        self.shared
            .lock()
            .dead
            .get(queue)
            .map(|messages| messages.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn bindings_of(&self, routing_key: &str) -> Vec<String> {
        self.shared
            .lock()
            .bindings
            .get(routing_key)
            .map(|queues| queues.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> QueueResult<Arc<dyn Connection>> {
        let mut state = self.shared.lock();
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(QueueError::connection_failed("in-memory broker refused connection"));
        }
        state.next_connection_id += 1;
        let id = state.next_connection_id;
        state.open.insert(id, Vec::new());

        Ok(Arc::new(MemoryConnection {
            id,
            shared: self.shared.clone(),
        }))
    }
}

struct MemoryConnection {
    id: u64,
    shared: Arc<Shared>,
}

impl MemoryConnection {
    fn lock_open(&self) -> QueueResult<MutexGuard<'_, BrokerState>> {
        let state = self.shared.lock();
        if state.open.contains_key(&self.id) {
            Ok(state)
        } else {
            Err(QueueError::connection_lost(format!(
                "in-memory connection {} is gone",
                self.id
            )))
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn ping(&self) -> QueueResult<()> {
        self.lock_open().map(|_| ())
    }

    async fn declare_queue(&self, queue: &str) -> QueueResult<()> {
        let mut state = self.lock_open()?;
        state.queues.entry(queue.to_string()).or_default().declared = true;
        Ok(())
    }

    async fn declare_ephemeral_queue(&self, queue: &str) -> QueueResult<()> {
        let mut state = self.lock_open()?;
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> QueueResult<()> {
        let mut state = self.lock_open()?;
        state.queues.remove(queue);
        state.bindings.retain(|_, queues| {
            queues.remove(queue);
            !queues.is_empty()
        });
        for inflight in state.open.values_mut() {
            inflight.retain(|(q, _)| q != queue);
        }
        Ok(())
    }

    async fn bind(&self, queue: &str, routing_key: &str) -> QueueResult<()> {
        let mut state = self.lock_open()?;
        state.queues.entry(queue.to_string()).or_default();
        state
            .bindings
            .entry(routing_key.to_string())
            .or_default()
            .insert(queue.to_string());
        Ok(())
    }

    async fn publish(&self, routing_key: &str, body: &[u8]) -> QueueResult<usize> {
        let mut state = self.lock_open()?;

        let mut targets: BTreeSet<String> =
            state.bindings.get(routing_key).cloned().unwrap_or_default();
        if state.queues.get(routing_key).is_some_and(|q| q.declared) {
            targets.insert(routing_key.to_string());
        }

        let mut routed = 0;
        for queue in targets {
            state.next_message_id += 1;
            let id = state.next_message_id.to_string();
            if let Some(q) = state.queues.get_mut(&queue) {
                q.ready.push_back(RawMessage {
                    id,
                    routing_key: routing_key.to_string(),
                    body: body.to_vec(),
                    redelivered: false,
                });
                routed += 1;
            }
        }
        drop(state);

        if routed > 0 {
            self.shared.notify.notify_waiters();
        }
        Ok(routed)
    }

    async fn fetch(&self, queue: &str, max: usize, block: Duration) -> QueueResult<Vec<RawMessage>> {
        let deadline = Instant::now() + block;

        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock_open()?;
                let q = state
                    .queues
                    .get_mut(queue)
                    .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;
                let count = q.ready.len().min(max.max(1));
                let batch: Vec<RawMessage> = q.ready.drain(..count).collect();
                if !batch.is_empty() {
                    if let Some(inflight) = state.open.get_mut(&self.id) {
                        inflight.extend(batch.iter().map(|m| (queue.to_string(), m.clone())));
                    }
                    return Ok(batch);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, _queue: &str, message: &RawMessage) -> QueueResult<()> {
        let mut state = self.lock_open()?;
        if let Some(remaining) = state.acks_before_failure {
            if remaining == 0 {
                state.acks_before_failure = None;
                let requeued = state.release(self.id);
                drop(state);
                debug!(connection = self.id, requeued, "Dropped in-memory connection during ack");
                self.shared.notify.notify_waiters();
                return Err(QueueError::connection_lost(format!(
                    "in-memory connection {} dropped during ack",
                    self.id
                )));
            }
            state.acks_before_failure = Some(remaining - 1);
        }
        state.take_inflight(self.id, &message.id);
        Ok(())
    }

    async fn reject(&self, queue: &str, message: &RawMessage, requeue: bool) -> QueueResult<()> {
        let mut state = self.lock_open()?;
        let Some((_, mut message)) = state.take_inflight(self.id, &message.id) else {
            return Ok(());
        };

        if requeue {
            if let Some(q) = state.queues.get_mut(queue) {
                message.redelivered = true;
                q.ready.push_front(message);
            }
            drop(state);
            self.shared.notify.notify_waiters();
        } else {
            state.dead.entry(queue.to_string()).or_default().push(message);
        }
        Ok(())
    }

    async fn close(&self) {
        let requeued = self.shared.lock().release(self.id);
        if requeued > 0 {
            self.shared.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn test_direct_and_bound_routing() {
        let transport = MemoryTransport::new();
        let conn = transport.connect().await.unwrap();

        conn.declare_queue("video-uploaded").await.unwrap();
        conn.bind("watcher", "cats").await.unwrap();

        assert_eq!(conn.publish("video-uploaded", b"a").await.unwrap(), 1);
        assert_eq!(conn.publish("cats", b"b").await.unwrap(), 1);
        assert_eq!(conn.publish("nobody", b"c").await.unwrap(), 0);

        let got = conn.fetch("watcher", 10, BLOCK).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].routing_key, "cats");
        assert_eq!(transport.queue_len("video-uploaded"), 1);
    }

    #[tokio::test]
    async fn test_fetch_times_out_empty() {
        let transport = MemoryTransport::new();
        let conn = transport.connect().await.unwrap();
        conn.declare_queue("q").await.unwrap();

        assert!(conn.fetch("q", 10, BLOCK).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_wakes_on_publish() {
        let transport = MemoryTransport::new();
        let consumer = transport.connect().await.unwrap();
        let producer = transport.connect().await.unwrap();
        consumer.declare_queue("q").await.unwrap();

        let fetch = tokio::spawn(async move {
            consumer.fetch("q", 10, Duration::from_secs(5)).await
        });
        tokio::task::yield_now().await;
        producer.publish("q", b"hello").await.unwrap();

        let got = fetch.await.unwrap().unwrap();
        assert_eq!(got[0].body, b"hello");
    }

    #[tokio::test]
    async fn test_sever_requeues_unsettled() {
        let transport = MemoryTransport::new();
        let conn = transport.connect().await.unwrap();
        conn.declare_queue("q").await.unwrap();
        conn.publish("q", b"m").await.unwrap();

        let first = conn.fetch("q", 10, BLOCK).await.unwrap();
        assert!(!first[0].redelivered);
        assert_eq!(transport.unsettled(), 1);

        transport.sever_connections();
        assert!(conn.ping().await.unwrap_err().is_connection_error());
        assert_eq!(transport.open_connections(), 0);

        let again = transport.connect().await.unwrap();
        let second = again.fetch("q", 10, BLOCK).await.unwrap();
        assert_eq!(second[0].body, b"m");
        assert!(second[0].redelivered);
    }

    #[tokio::test]
    async fn test_reject_without_requeue_dead_letters() {
        let transport = MemoryTransport::new();
        let conn = transport.connect().await.unwrap();
        conn.declare_queue("q").await.unwrap();
        conn.publish("q", b"bad").await.unwrap();

        let got = conn.fetch("q", 1, BLOCK).await.unwrap();
        conn.reject("q", &got[0], false).await.unwrap();

        assert_eq!(transport.queue_len("q"), 0);
        assert_eq!(transport.dead_letters("q"), vec![b"bad".to_vec()]);
    }

    #[tokio::test]
    async fn test_delete_queue_drops_bindings() {
        let transport = MemoryTransport::new();
        let conn = transport.connect().await.unwrap();
        conn.bind("tmp", "cats").await.unwrap();
        conn.bind("other", "cats").await.unwrap();

        conn.delete_queue("tmp").await.unwrap();

        assert!(!transport.queue_exists("tmp"));
        assert_eq!(transport.bindings_of("cats"), vec!["other".to_string()]);
        assert_eq!(conn.publish("cats", b"x").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ack_fault_drops_connection() {
        let transport = MemoryTransport::new();
        let conn = transport.connect().await.unwrap();
        conn.declare_queue("q").await.unwrap();
        conn.publish("q", b"one").await.unwrap();
        conn.publish("q", b"two").await.unwrap();
        let got = conn.fetch("q", 10, BLOCK).await.unwrap();

        transport.fail_ack_after(1);
        conn.ack("q", &got[0]).await.unwrap();
        let err = conn.ack("q", &got[1]).await.unwrap_err();

        assert!(err.is_connection_error());
        assert_eq!(transport.open_connections(), 0);
        assert_eq!(transport.queue_len("q"), 1);
    }

    #[tokio::test]
    async fn test_ephemeral_queue_not_directly_addressed() {
        let transport = MemoryTransport::new();
        let conn = transport.connect().await.unwrap();
        conn.declare_ephemeral_queue("tmp").await.unwrap();

        assert!(transport.queue_exists("tmp"));
        assert_eq!(conn.publish("tmp", b"x").await.unwrap(), 0);
        conn.bind("tmp", "cats").await.unwrap();
        assert_eq!(conn.publish("cats", b"x").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fail_next_connects() {
        let transport = MemoryTransport::new();
        transport.fail_next_connects(2);

        assert!(transport.connect().await.is_err());
        assert!(transport.connect().await.is_err());
        assert!(transport.connect().await.is_ok());
    }
}
