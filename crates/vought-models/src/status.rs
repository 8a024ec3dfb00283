//! Video status lifecycle.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::TransitionError;

/// Lifecycle status of a video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VideoStatus {
    /// Never set intentionally
    #[default]
    Unspecified,
    /// Source upload in progress
    Uploading,
    /// Source stored, waiting for the encoder
    Uploaded,
    /// Encoder is working on the source
    Encoding,
    /// Encoded asset and cover are available
    Complete,
    /// Never set intentionally
    Unknown,
    /// Source upload failed
    FailUpload,
    /// Encoding failed or could not be confirmed
    FailEncode,
}

impl VideoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoStatus::Unspecified => "UNSPECIFIED",
            VideoStatus::Uploading => "UPLOADING",
            VideoStatus::Uploaded => "UPLOADED",
            VideoStatus::Encoding => "ENCODING",
            VideoStatus::Complete => "COMPLETE",
            VideoStatus::Unknown => "UNKNOWN",
            VideoStatus::FailUpload => "FAIL_UPLOAD",
            VideoStatus::FailEncode => "FAIL_ENCODE",
        }
    }

    /// Check if this is a terminal state (no more updates expected).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VideoStatus::Complete | VideoStatus::FailUpload | VideoStatus::FailEncode
        )
    }

    /// Apply a pipeline event and return the next status.
    ///
    /// Encode-result events are authoritative and accepted from any status.
    /// Every other event is only valid from the status the table names.
    pub fn apply(self, event: PipelineEvent) -> Result<VideoStatus, TransitionError> {
        use PipelineEvent::*;
        use VideoStatus::*;

        match (self, event) {
            // Encoding -> Encoding covers a redelivered upload event.
            (Uploaded | Encoding, EncodeStarted) => Ok(Encoding),
            (Encoding, EncodeSucceeded) => Ok(Complete),
            (Encoding, EncodeFailed) => Ok(FailEncode),
            (Encoding, AckFailed) => Ok(FailEncode),
            (_, ResultReceived { success: true }) => Ok(Complete),
            (_, ResultReceived { success: false }) => Ok(FailEncode),
            (from, event) => Err(TransitionError { from, event }),
        }
    }
}

impl fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Events that move a video through its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineEvent {
    /// The encoder picked up an upload event
    EncodeStarted,
    /// The encode operation reported success
    EncodeSucceeded,
    /// The encode operation reported failure
    EncodeFailed,
    /// Encoding succeeded but the upload delivery could not be acknowledged
    AckFailed,
    /// The API received an encode-result event
    ResultReceived { success: bool },
}

impl PipelineEvent {
    /// Interpret the status carried by an encode-result event.
    ///
    /// Only `COMPLETE` counts as success; anything else is surfaced as a failure
    /// so subscribers observe it instead of silence.
    pub fn result_of(status: VideoStatus) -> Self {
        PipelineEvent::ResultReceived {
            success: status == VideoStatus::Complete,
        }
    }
}
