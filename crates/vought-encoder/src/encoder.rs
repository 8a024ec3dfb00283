//! The encode operation: one uploaded source in, an HLS rendition and a
//! cover frame out.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};
use vought_models::Video;

use crate::config::EncoderConfig;
use crate::error::{EncodeError, EncodeResult};

/// Playlist written next to the segments in `<media_root>/<id>/`.
pub const MASTER_PLAYLIST: &str = "master.m3u8";

/// HLS segment length in seconds.
const HLS_SEGMENT_SECONDS: u32 = 6;

/// Width of the extracted cover frame.
const COVER_SCALE_WIDTH: u32 = 480;

/// Stderr kept on failure, in bytes.
const STDERR_TAIL: usize = 2048;

/// Turns an uploaded video into its served artifacts.
#[async_trait]
pub trait VideoEncoder: Send + Sync {
    async fn encode(&self, video: &Video) -> EncodeResult<()>;
}

/// Argument list for one FFmpeg invocation.
#[derive(Debug, Clone)]
struct FfmpegArgs {
    input: PathBuf,
    output: PathBuf,
    input_args: Vec<String>,
    output_args: Vec<String>,
}

impl FfmpegArgs {
    fn new(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Self {
        Self {
            input: input.as_ref().to_path_buf(),
            output: output.as_ref().to_path_buf(),
            input_args: Vec::new(),
            output_args: Vec::new(),
        }
    }

    fn input_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_args.extend(args.into_iter().map(Into::into));
        self
    }

    fn output_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_args.extend(args.into_iter().map(Into::into));
        self
    }

    fn build(&self) -> Vec<String> {
        let mut args = vec!["-y".to_string(), "-v".to_string(), "error".to_string()];
        args.extend(self.input_args.iter().cloned());
        args.push("-i".to_string());
        args.push(self.input.to_string_lossy().to_string());
        args.extend(self.output_args.iter().cloned());
        args.push(self.output.to_string_lossy().to_string());
        args
    }
}

fn hls_args(source: &Path, out_dir: &Path) -> FfmpegArgs {
    let segments = out_dir.join("segment_%03d.ts");
    FfmpegArgs::new(source, out_dir.join(MASTER_PLAYLIST)).output_args([
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        "veryfast".to_string(),
        "-crf".to_string(),
        "23".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        "128k".to_string(),
        "-f".to_string(),
        "hls".to_string(),
        "-hls_time".to_string(),
        HLS_SEGMENT_SECONDS.to_string(),
        "-hls_playlist_type".to_string(),
        "vod".to_string(),
        "-hls_segment_filename".to_string(),
        segments.to_string_lossy().to_string(),
    ])
}

fn cover_args(source: &Path, cover: &Path) -> FfmpegArgs {
    FfmpegArgs::new(source, cover)
        .input_args(["-ss", "0"])
        .output_args([
            "-vframes".to_string(),
            "1".to_string(),
            "-vf".to_string(),
            format!("scale={}:-2", COVER_SCALE_WIDTH),
        ])
}

/// Encoder backed by the FFmpeg CLI, reading and writing under a media root.
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    ffmpeg: PathBuf,
    media_root: PathBuf,
}

impl FfmpegEncoder {
    /// Resolve the FFmpeg binary (configured path or PATH lookup).
    pub fn new(config: &EncoderConfig) -> EncodeResult<Self> {
        let ffmpeg = match &config.ffmpeg_path {
            Some(path) => path.clone(),
            None => which::which("ffmpeg").map_err(|_| EncodeError::FfmpegNotFound)?,
        };
        Ok(Self::with_binary(ffmpeg, &config.media_root))
    }

    pub fn with_binary(ffmpeg: impl Into<PathBuf>, media_root: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            media_root: media_root.into(),
        }
    }

    /// Directory the artifacts of `video` are written to.
    pub fn output_dir(&self, video: &Video) -> PathBuf {
        self.media_root.join(video.id.as_str())
    }

    async fn run(&self, args: &FfmpegArgs) -> EncodeResult<()> {
        let args = args.build();
        debug!("Running FFmpeg: {} {}", self.ffmpeg.display(), args.join(" "));

        let output = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail_start = stderr.len().saturating_sub(STDERR_TAIL);
        let tail = stderr
            .get(tail_start..)
            .unwrap_or(&stderr)
            .trim()
            .to_string();
        Err(EncodeError::ffmpeg_failed(
            "FFmpeg exited with non-zero status",
            (!tail.is_empty()).then_some(tail),
            output.status.code(),
        ))
    }
}

#[async_trait]
impl VideoEncoder for FfmpegEncoder {
    async fn encode(&self, video: &Video) -> EncodeResult<()> {
        let source = self.media_root.join(&video.source_path);
        if video.source_path.is_empty() || !tokio::fs::try_exists(&source).await? {
            return Err(EncodeError::SourceNotFound(source));
        }

        let out_dir = self.output_dir(video);
        tokio::fs::create_dir_all(&out_dir).await?;

        self.run(&hls_args(&source, &out_dir)).await?;
        let cover = self.media_root.join(video.canonical_cover_path());
        self.run(&cover_args(&source, &cover)).await?;

        info!(
            video_id = %video.id,
            output = %out_dir.display(),
            "Encoded video"
        );
        Ok(())
    }
}
