//! Shared data models for the Vought video pipeline.
//!
//! This crate provides:
//! - The video record and its identifier
//! - The video status lifecycle and its transition table
//! - The binary event format carried on the broker
//! - The JSON status notification pushed to browser sockets

pub mod error;
pub mod notification;
pub mod status;
pub mod video;
pub mod wire;

pub use error::{TransitionError, WireError, WireResult};
pub use notification::StatusNotification;
pub use status::{PipelineEvent, VideoStatus};
pub use video::{Video, VideoId, CANONICAL_COVER_EXTENSION};
pub use wire::{decode_video, encode_video, VideoEvent, WireStatus};

/// Queue carrying upload events from the API to the encoder.
pub const VIDEO_UPLOADED_QUEUE: &str = "video-uploaded";

/// Queue carrying encode results from the encoder back to the API.
pub const VIDEO_ENCODED_QUEUE: &str = "video-encoded";
