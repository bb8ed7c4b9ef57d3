//! Sink that appends frames to a local file

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::Sink;
use crate::error::Result;

/// Appends every frame to a file
pub struct FileSink {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileSink {
    /// Create (or truncate) the file at `path`
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).await?;
        Ok(Self::from_file(path, file))
    }

    /// Wrap an already open file
    pub fn from_file(path: impl Into<PathBuf>, file: File) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(Some(file)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn write(&self, frame: Bytes) -> Result<bool> {
        let mut guard = self.file.lock().await;
        let Some(file) = guard.as_mut() else {
            return Ok(false);
        };
        if let Err(e) = file.write_all(&frame).await {
            tracing::warn!(path = %self.path.display(), error = %e, "File write failed");
            guard.take();
            return Err(e.into());
        }
        Ok(true)
    }

    async fn close(&self) {
        if let Some(mut file) = self.file.lock().await.take() {
            if let Err(e) = file.flush().await {
                tracing::warn!(path = %self.path.display(), error = %e, "File flush failed");
            }
        }
    }
}
