//! Video record persistence.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use vought_models::{Video, VideoId};

pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Video not found: {0}")]
    NotFound(VideoId),

    #[error("Invalid store URL: {0}")]
    InvalidUrl(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Storage for video records.
#[async_trait]
pub trait VideoRepository: Send + Sync {
    async fn get_video(&self, id: &VideoId) -> RepositoryResult<Video>;

    /// Overwrite an existing record; fails with `NotFound` if there is none.
    async fn update_video(&self, video: &Video) -> RepositoryResult<()>;

    async fn create_video(&self, video: &Video) -> RepositoryResult<()>;
}

/// Records stored as JSON documents at `{prefix}:video:{id}`.
pub struct RedisVideoRepository {
    conn: MultiplexedConnection,
    prefix: String,
}

impl RedisVideoRepository {
    pub async fn connect(url: &str, prefix: impl Into<String>) -> RepositoryResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            prefix: prefix.into(),
        })
    }

    fn key(&self, id: &VideoId) -> String {
        format!("{}:video:{}", self.prefix, id)
    }
}

#[async_trait]
impl VideoRepository for RedisVideoRepository {
    async fn get_video(&self, id: &VideoId) -> RepositoryResult<Video> {
        let mut conn = self.conn.clone();
        let json: Option<String> = redis::cmd("GET")
            .arg(self.key(id))
            .query_async(&mut conn)
            .await?;
        let json = json.ok_or_else(|| RepositoryError::NotFound(id.clone()))?;
        Ok(serde_json::from_str(&json)?)
    }

    async fn update_video(&self, video: &Video) -> RepositoryResult<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(video)?;
        let written: Option<String> = redis::cmd("SET")
            .arg(self.key(&video.id))
            .arg(json)
            .arg("XX")
            .query_async(&mut conn)
            .await?;
        if written.is_none() {
            return Err(RepositoryError::NotFound(video.id.clone()));
        }
        debug!(video_id = %video.id, status = %video.status, "Updated video record");
        Ok(())
    }

    async fn create_video(&self, video: &Video) -> RepositoryResult<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(video)?;
        redis::cmd("SET")
            .arg(self.key(&video.id))
            .arg(json)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}

/// In-process records, for development and tests.
#[derive(Default)]
pub struct MemoryVideoRepository {
    videos: RwLock<HashMap<VideoId, Video>>,
}

impl MemoryVideoRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VideoRepository for MemoryVideoRepository {
    async fn get_video(&self, id: &VideoId) -> RepositoryResult<Video> {
        self.videos
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(id.clone()))
    }

    async fn update_video(&self, video: &Video) -> RepositoryResult<()> {
        let mut videos = self.videos.write().await;
        match videos.get_mut(&video.id) {
            Some(existing) => {
                *existing = video.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound(video.id.clone())),
        }
    }

    async fn create_video(&self, video: &Video) -> RepositoryResult<()> {
        self.videos
            .write()
            .await
            .insert(video.id.clone(), video.clone());
        Ok(())
    }
}
