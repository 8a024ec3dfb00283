//! Video record models.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use uuid::Uuid;

use crate::error::TransitionError;
use crate::status::{PipelineEvent, VideoStatus};

/// Extension of the cover image the encoder always produces.
pub const CANONICAL_COVER_EXTENSION: &str = "jpeg";

/// Unique identifier of an uploaded video.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VideoId(String);

impl VideoId {
    /// Generate a new random video ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for VideoId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for VideoId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VideoId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A video as persisted by the API and carried through the pipeline.
///
/// The `id` never changes once assigned. `status` should only be moved with
/// [`Video::apply`], which enforces the lifecycle table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Video {
    pub id: VideoId,
    #[serde(default)]
    pub status: VideoStatus,
    #[serde(default)]
    pub source_path: String,
    #[serde(default)]
    pub cover_path: String,
    #[serde(default)]
    pub title: String,
}

impl Video {
    /// Create a freshly uploaded video.
    pub fn new(id: VideoId, title: impl Into<String>, source_path: impl Into<String>) -> Self {
        Self {
            id,
            status: VideoStatus::Uploaded,
            source_path: source_path.into(),
            cover_path: String::new(),
            title: title.into(),
        }
    }

    pub fn with_cover_path(mut self, cover_path: impl Into<String>) -> Self {
        self.cover_path = cover_path.into();
        self
    }

    pub fn with_status(mut self, status: VideoStatus) -> Self {
        self.status = status;
        self
    }

    /// Move the video to the next status for `event`.
    pub fn apply(&mut self, event: PipelineEvent) -> Result<VideoStatus, TransitionError> {
        self.status = self.status.apply(event)?;
        Ok(self.status)
    }

    /// Cover location the encoder writes for this video.
    pub fn canonical_cover_path(&self) -> String {
        format!("{}/cover.{}", self.id, CANONICAL_COVER_EXTENSION)
    }

    /// Point a non-canonical cover path at the encoder's cover artifact.
    ///
    /// An empty cover path stays empty.
    pub fn normalize_cover_path(&mut self) {
        if self.cover_path.is_empty() {
            return;
        }
        let extension = Path::new(&self.cover_path)
            .extension()
            .and_then(|ext| ext.to_str());
        if extension != Some(CANONICAL_COVER_EXTENSION) {
            self.cover_path = self.canonical_cover_path();
        }
    }
}
