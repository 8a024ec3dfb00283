//! Message broker access for the Vought video pipeline.
//!
//! This crate provides:
//! - A [`Transport`] seam with Redis Streams and in-memory implementations
//! - [`BrokerClient`] handles: publish, consume, bind, ack/nack
//! - Self-healing [`Session`]s that redial with backoff when a handle breaks
//! - [`run_consumer`], the consume loop the pipeline services are built on

pub mod backoff;
pub mod client;
pub mod config;
pub mod consumer;
pub mod delivery;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod redis_transport;
pub mod session;
pub mod transport;

pub use client::{BrokerClient, Deliveries};
pub use config::BrokerConfig;
pub use consumer::{run_consumer, MessageHandler};
pub use delivery::Envelope;
pub use error::{QueueError, QueueResult};
pub use memory::MemoryTransport;
pub use redis_transport::RedisTransport;
pub use session::{Broker, Session, SharedClient};
pub use transport::{Connection, RawMessage, Transport};
