//! Binary video event carried on the broker.
//!
//! The layout is a protobuf message `{id = 1, status = 2, source = 3,
//! cover_path = 4}` so producers in other languages can share the queues.
//! Status indices are mapped explicitly in both directions; an index outside
//! the enumeration is rejected on decode instead of being coerced.

use prost::Message;

use crate::error::{WireError, WireResult};
use crate::status::VideoStatus;
use crate::video::{Video, VideoId};

/// Protobuf video event.
#[derive(Clone, PartialEq, Message)]
pub struct VideoEvent {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(enumeration = "WireStatus", tag = "2")]
    pub status: i32,
    #[prost(string, tag = "3")]
    pub source: String,
    #[prost(string, tag = "4")]
    pub cover_path: String,
}

/// Status indices used on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum WireStatus {
    Unspecified = 0,
    Uploading = 1,
    Uploaded = 2,
    Encoding = 3,
    Complete = 4,
    Unknown = 5,
    FailUpload = 6,
    FailEncode = 7,
}

impl From<VideoStatus> for WireStatus {
    fn from(status: VideoStatus) -> Self {
        match status {
            VideoStatus::Unspecified => WireStatus::Unspecified,
            VideoStatus::Uploading => WireStatus::Uploading,
            VideoStatus::Uploaded => WireStatus::Uploaded,
            VideoStatus::Encoding => WireStatus::Encoding,
            VideoStatus::Complete => WireStatus::Complete,
            VideoStatus::Unknown => WireStatus::Unknown,
            VideoStatus::FailUpload => WireStatus::FailUpload,
            VideoStatus::FailEncode => WireStatus::FailEncode,
        }
    }
}

impl From<WireStatus> for VideoStatus {
    fn from(status: WireStatus) -> Self {
        match status {
            WireStatus::Unspecified => VideoStatus::Unspecified,
            WireStatus::Uploading => VideoStatus::Uploading,
            WireStatus::Uploaded => VideoStatus::Uploaded,
            WireStatus::Encoding => VideoStatus::Encoding,
            WireStatus::Complete => VideoStatus::Complete,
            WireStatus::Unknown => VideoStatus::Unknown,
            WireStatus::FailUpload => VideoStatus::FailUpload,
            WireStatus::FailEncode => VideoStatus::FailEncode,
        }
    }
}

impl From<&Video> for VideoEvent {
    fn from(video: &Video) -> Self {
        Self {
            id: video.id.to_string(),
            status: WireStatus::from(video.status) as i32,
            source: video.source_path.clone(),
            cover_path: video.cover_path.clone(),
        }
    }
}

impl TryFrom<VideoEvent> for Video {
    type Error = WireError;

    /// The event has no title; it comes back empty.
    fn try_from(event: VideoEvent) -> WireResult<Self> {
        if event.id.is_empty() {
            return Err(WireError::MissingId);
        }
        let status = WireStatus::try_from(event.status)
            .map_err(|_| WireError::UnknownStatus(event.status))?;

        Ok(Video {
            id: VideoId::from_string(event.id),
            status: status.into(),
            source_path: event.source,
            cover_path: event.cover_path,
            title: String::new(),
        })
    }
}

/// Encode a video as a broker event body.
pub fn encode_video(video: &Video) -> Vec<u8> {
    VideoEvent::from(video).encode_to_vec()
}

/// Decode a broker event body.
pub fn decode_video(body: &[u8]) -> WireResult<Video> {
    let event = VideoEvent::decode(body)?;
    Video::try_from(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_keeps_event_fields() {
        let video = Video::new("v1".into(), "not on the wire", "v1/in.mp4")
            .with_status(VideoStatus::Complete)
            .with_cover_path("v1/cover.jpeg");

        let decoded = decode_video(&encode_video(&video)).unwrap();
        assert_eq!(decoded.id, video.id);
        assert_eq!(decoded.status, VideoStatus::Complete);
        assert_eq!(decoded.source_path, "v1/in.mp4");
        assert_eq!(decoded.cover_path, "v1/cover.jpeg");
        assert!(decoded.title.is_empty());
    }

    #[test]
    fn test_status_indices_are_stable() {
        assert_eq!(WireStatus::from(VideoStatus::Unspecified) as i32, 0);
        assert_eq!(WireStatus::from(VideoStatus::Encoding) as i32, 3);
        assert_eq!(WireStatus::from(VideoStatus::Complete) as i32, 4);
        assert_eq!(WireStatus::from(VideoStatus::FailEncode) as i32, 7);
    }

    #[test]
    fn test_rejects_out_of_range_status() {
        let event = VideoEvent {
            id: "v1".to_string(),
            status: 42,
            source: String::new(),
            cover_path: String::new(),
        };
        let err = decode_video(&event.encode_to_vec()).unwrap_err();
        assert!(matches!(err, WireError::UnknownStatus(42)));
    }

    #[test]
    fn test_rejects_garbage_and_missing_id() {
        assert!(matches!(
            decode_video(&[0xff, 0xff, 0xff]),
            Err(WireError::Decode(_))
        ));

        let event = VideoEvent {
            id: String::new(),
            status: WireStatus::Complete as i32,
            source: String::new(),
            cover_path: String::new(),
        };
        assert!(matches!(
            decode_video(&event.encode_to_vec()),
            Err(WireError::MissingId)
        ));
    }
}
