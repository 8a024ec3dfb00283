//! Redis Streams transport.
//!
//! Key layout under the configured prefix:
//! - `{prefix}:queue:{name}`: stream holding the queue's messages
//! - `{prefix}:queue:{name}:dead`: dead-letter stream for rejected messages
//! - `{prefix}:queue:{name}:bindings`: routing keys bound to the queue
//! - `{prefix}:binding:{routing_key}`: queues bound to a routing key
//! - `{prefix}:queues`: declared queues (targets of direct addressing)
//!
//! Ephemeral queues carry a TTL on their stream and bindings keys, renewed
//! by every fetch of the connection that declared them. A crashed owner's
//! queue expires; stale references to it are pruned on publish.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::StreamReadReply;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::error::{QueueError, QueueResult};
use crate::transport::{Connection, RawMessage, Transport};

const FIELD_ROUTING_KEY: &str = "rk";
const FIELD_BODY: &str = "body";
const FIELD_REDELIVERED: &str = "redelivered";

/// Opens Redis connections that behave like broker channels.
pub struct RedisTransport {
    client: redis::Client,
    prefix: String,
    consumer: String,
    ephemeral_ttl: Duration,
}

impl RedisTransport {
    pub fn new(config: &BrokerConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        Ok(Self {
            client,
            prefix: config.key_prefix.clone(),
            consumer: config.consumer_name.clone(),
            ephemeral_ttl: config.ephemeral_ttl,
        })
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn connect(&self) -> QueueResult<Arc<dyn Connection>> {
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))?;

        debug!(consumer = %self.consumer, "Opened Redis broker connection");

        Ok(Arc::new(RedisConnection {
            conn,
            keys: Keys {
                prefix: self.prefix.clone(),
            },
            group: format!("{}:consumers", self.prefix),
            consumer: self.consumer.clone(),
            ephemeral_ttl: self.ephemeral_ttl,
            backlog: Mutex::new(HashMap::new()),
            expiring: Mutex::new(HashSet::new()),
        }))
    }
}

struct Keys {
    prefix: String,
}

impl Keys {
    fn queue(&self, queue: &str) -> String {
        format!("{}:queue:{}", self.prefix, queue)
    }

    fn dead_letters(&self, queue: &str) -> String {
        format!("{}:queue:{}:dead", self.prefix, queue)
    }

    fn queue_bindings(&self, queue: &str) -> String {
        format!("{}:queue:{}:bindings", self.prefix, queue)
    }

    fn binding(&self, routing_key: &str) -> String {
        format!("{}:binding:{}", self.prefix, routing_key)
    }

    fn queues(&self) -> String {
        format!("{}:queues", self.prefix)
    }
}

/// Progress through the entries a queue's consumer left pending.
enum Backlog {
    /// Next replay reads pending entries after this id
    Replaying(String),
    Drained,
}

/// One XREADGROUP reply.
struct Batch {
    messages: Vec<RawMessage>,
    /// Id of the last entry returned, including dropped ones
    last_id: Option<String>,
}

struct RedisConnection {
    conn: MultiplexedConnection,
    keys: Keys,
    group: String,
    consumer: String,
    ephemeral_ttl: Duration,
    /// Per-queue replay cursor; a queue with no entry has not been read yet
    backlog: Mutex<HashMap<String, Backlog>>,
    /// Ephemeral queues this connection declared and keeps alive
    expiring: Mutex<HashSet<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RedisConnection {
    /// Where the next replay of `queue` starts, or `None` once it is drained.
    fn replay_cursor(&self, queue: &str) -> Option<String> {
        match lock(&self.backlog).get(queue) {
            None => Some("0".to_string()),
            Some(Backlog::Replaying(id)) => Some(id.clone()),
            Some(Backlog::Drained) => None,
        }
    }

    fn set_backlog(&self, queue: &str, backlog: Backlog) {
        lock(&self.backlog).insert(queue.to_string(), backlog);
    }

    fn ttl_millis(&self) -> u64 {
        self.ephemeral_ttl.as_millis().max(1) as u64
    }

    async fn create_group(&self, queue: &str) -> QueueResult<()> {
        let mut conn = self.conn.clone();

        // Start at 0 so messages routed before the group existed are not skipped.
        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(self.keys.queue(queue))
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => info!(queue, "Declared queue"),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(queue, "Queue already declared");
            }
            Err(e) => return Err(QueueError::Redis(e)),
        }
        Ok(())
    }

    /// Push back the expiry of an ephemeral queue and its bindings.
    async fn renew(&self, queue: &str) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let ttl = self.ttl_millis();
        redis::pipe()
            .cmd("PEXPIRE")
            .arg(self.keys.queue(queue))
            .arg(ttl)
            .ignore()
            .cmd("PEXPIRE")
            .arg(self.keys.queue_bindings(queue))
            .arg(ttl)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn read_group(
        &self,
        queue: &str,
        max: usize,
        block: Option<Duration>,
        start: &str,
    ) -> QueueResult<Batch> {
        let mut conn = self.conn.clone();
        let key = self.keys.queue(queue);

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(max);
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block.as_millis().max(1) as u64);
        }
        cmd.arg("STREAMS").arg(&key).arg(start);

        let reply: Option<StreamReadReply> = cmd.query_async(&mut conn).await?;
        let replayed = start != ">";

        let mut messages = Vec::new();
        let mut last_id = None;
        for stream_key in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in stream_key.ids {
                last_id = Some(entry.id.clone());
                let Some(body) = entry.get::<Vec<u8>>(FIELD_BODY) else {
                    // Entry vanished from the stream but is still pending; settle it.
                    warn!(queue, id = %entry.id, "Dropping pending entry without body");
                    redis::cmd("XACK")
                        .arg(&key)
                        .arg(&self.group)
                        .arg(&entry.id)
                        .query_async::<()>(&mut conn)
                        .await?;
                    continue;
                };
                messages.push(RawMessage {
                    routing_key: entry.get(FIELD_ROUTING_KEY).unwrap_or_default(),
                    redelivered: replayed || entry.get::<String>(FIELD_REDELIVERED).is_some(),
                    id: entry.id,
                    body,
                });
            }
        }
        Ok(Batch { messages, last_id })
    }

    async fn append(
        &self,
        stream: &str,
        routing_key: &str,
        body: &[u8],
        redelivered: bool,
    ) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream)
            .arg("*")
            .arg(FIELD_ROUTING_KEY)
            .arg(routing_key)
            .arg(FIELD_BODY)
            .arg(body);
        if redelivered {
            cmd.arg(FIELD_REDELIVERED).arg(1);
        }
        cmd.query_async::<()>(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl Connection for RedisConnection {
    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> QueueResult<()> {
        self.create_group(queue).await?;
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(self.keys.queues(), queue).await?;
        Ok(())
    }

    async fn declare_ephemeral_queue(&self, queue: &str) -> QueueResult<()> {
        self.create_group(queue).await?;
        self.renew(queue).await?;
        lock(&self.expiring).insert(queue.to_string());
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let routing_keys: Vec<String> = conn.smembers(self.keys.queue_bindings(queue)).await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for routing_key in &routing_keys {
            pipe.srem(self.keys.binding(routing_key), queue).ignore();
        }
        pipe.del(self.keys.queue_bindings(queue))
            .ignore()
            .del(self.keys.queue(queue))
            .ignore()
            .srem(self.keys.queues(), queue)
            .ignore();
        pipe.query_async::<()>(&mut conn).await?;

        lock(&self.backlog).remove(queue);
        lock(&self.expiring).remove(queue);

        debug!(queue, bindings = routing_keys.len(), "Deleted queue");
        Ok(())
    }

    async fn bind(&self, queue: &str, routing_key: &str) -> QueueResult<()> {
        let mut conn = self.conn.clone();

        // The bindings key of an expiring queue expires with it.
        let ttl: i64 = redis::cmd("PTTL")
            .arg(self.keys.queue(queue))
            .query_async(&mut conn)
            .await?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .sadd(self.keys.binding(routing_key), queue)
            .ignore()
            .sadd(self.keys.queue_bindings(queue), routing_key)
            .ignore();
        if ttl > 0 {
            pipe.cmd("PEXPIRE")
                .arg(self.keys.queue_bindings(queue))
                .arg(ttl)
                .ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn publish(&self, routing_key: &str, body: &[u8]) -> QueueResult<usize> {
        let mut conn = self.conn.clone();

        let bound: HashSet<String> = conn.smembers(self.keys.binding(routing_key)).await?;
        let direct: bool = conn.sismember(self.keys.queues(), routing_key).await?;

        let mut routed = 0;
        for queue in &bound {
            let key = self.keys.queue(queue);
            let live: bool = conn.exists(&key).await?;
            if !live {
                debug!(queue = %queue, routing_key, "Pruning binding to expired queue");
                conn.srem::<_, _, ()>(self.keys.binding(routing_key), queue)
                    .await?;
                continue;
            }
            self.append(&key, routing_key, body, false).await?;
            routed += 1;
        }
        if direct && !bound.contains(routing_key) {
            self.append(&self.keys.queue(routing_key), routing_key, body, false)
                .await?;
            routed += 1;
        }
        Ok(routed)
    }

    async fn fetch(&self, queue: &str, max: usize, block: Duration) -> QueueResult<Vec<RawMessage>> {
        let expiring = lock(&self.expiring).contains(queue);
        if expiring {
            self.renew(queue).await?;
        }

        // Pending entries are replayed once each, oldest first, walking the
        // cursor forward; new entries are read only after the backlog is done.
        if let Some(cursor) = self.replay_cursor(queue) {
            let batch = self.read_group(queue, max, None, &cursor).await?;
            match batch.last_id {
                Some(last_id) => {
                    debug!(queue, count = batch.messages.len(), "Replaying unsettled messages");
                    self.set_backlog(queue, Backlog::Replaying(last_id));
                    return Ok(batch.messages);
                }
                None => self.set_backlog(queue, Backlog::Drained),
            }
        }
        Ok(self.read_group(queue, max, Some(block), ">").await?.messages)
    }

    async fn ack(&self, queue: &str, message: &RawMessage) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let key = self.keys.queue(queue);
        redis::pipe()
            .cmd("XACK")
            .arg(&key)
            .arg(&self.group)
            .arg(&message.id)
            .ignore()
            .cmd("XDEL")
            .arg(&key)
            .arg(&message.id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn reject(&self, queue: &str, message: &RawMessage, requeue: bool) -> QueueResult<()> {
        let target = if requeue {
            self.keys.queue(queue)
        } else {
            self.keys.dead_letters(queue)
        };
        self.append(&target, &message.routing_key, &message.body, requeue)
            .await?;
        self.ack(queue, message).await
    }

    async fn close(&self) {
        // Pending entries stay with this consumer name and are replayed by
        // the next connection's first fetch. Ephemeral queues this
        // connection kept alive now run out their TTL unless another
        // connection takes them over.
        debug!(consumer = %self.consumer, "Closed Redis broker connection");
    }
}
