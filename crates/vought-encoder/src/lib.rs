//! Encoder service for the Vought video pipeline.
//!
//! Consumes upload events, runs the encode operation, and publishes the
//! outcome on the encoded-videos queue.

pub mod config;
pub mod consumer;
pub mod encoder;
pub mod error;

pub use config::EncoderConfig;
pub use consumer::{consume_uploads, EncodeHandler};
pub use encoder::{FfmpegEncoder, VideoEncoder, MASTER_PLAYLIST};
pub use error::{EncodeError, EncodeResult};
