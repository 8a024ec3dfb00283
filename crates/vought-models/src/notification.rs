//! Status notification sent to browser sockets.

use serde::{Deserialize, Serialize};

use crate::status::VideoStatus;
use crate::video::Video;

/// JSON frame pushed to a subscribed browser when a video changes status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotification {
    pub id: String,
    pub title: String,
    pub status: VideoStatus,
    pub source: String,
    pub cover_path: String,
}

impl From<&Video> for StatusNotification {
    fn from(video: &Video) -> Self {
        Self {
            id: video.id.to_string(),
            title: video.title.clone(),
            status: video.status,
            source: video.source_path.clone(),
            cover_path: video.cover_path.clone(),
        }
    }
}

impl StatusNotification {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
