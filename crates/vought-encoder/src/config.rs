//! Encoder configuration.

use std::path::PathBuf;

/// Encoder configuration.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Directory holding uploaded sources and encoded outputs
    pub media_root: PathBuf,
    /// Explicit FFmpeg binary; looked up in PATH when unset
    pub ffmpeg_path: Option<PathBuf>,
    /// Verbose logging
    pub dev_mode: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            media_root: PathBuf::from("/tmp/vought/media"),
            ffmpeg_path: None,
            dev_mode: false,
        }
    }
}

impl EncoderConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            media_root: std::env::var("MEDIA_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.media_root),
            ffmpeg_path: std::env::var("FFMPEG_PATH")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            dev_mode: std::env::var("DEV_MODE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }
}
