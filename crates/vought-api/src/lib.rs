//! Vought API server.
//!
//! This crate provides:
//! - The encode-result consumer that persists video status
//! - The WebSocket bridge pushing status updates to browsers
//! - Health and Prometheus endpoints

pub mod auth;
pub mod config;
pub mod consumer;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod repository;
pub mod routes;
pub mod state;
pub mod ws;

pub use config::ApiConfig;
pub use consumer::{consume_encoded, StatusHandler};
pub use error::{ApiError, ApiResult};
pub use repository::{
    MemoryVideoRepository, RedisVideoRepository, RepositoryError, RepositoryResult,
    VideoRepository,
};
pub use routes::create_router;
pub use state::AppState;
pub use ws::{serve_socket, CONNECTION_ACK};
