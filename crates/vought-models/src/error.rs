//! Model error types.

use thiserror::Error;

use crate::status::{PipelineEvent, VideoStatus};

pub type WireResult<T> = Result<T, WireError>;

/// Errors raised while decoding a broker event.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("Malformed video event: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Unknown video status index: {0}")]
    UnknownStatus(i32),

    #[error("Video event has no id")]
    MissingId,
}

/// A pipeline event that the current status does not accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Cannot apply {event:?} to a video in status {from}")]
pub struct TransitionError {
    pub from: VideoStatus,
    pub event: PipelineEvent,
}
