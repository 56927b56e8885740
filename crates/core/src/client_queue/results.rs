use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const IMAGE_EXTENSION: &str = "png";
const VIDEO_EXTENSION: &str = "mp4";

/// Binary results kept next to the queue metadata, one file per item id.
#[derive(Debug, Clone)]
pub struct ResultStore {
    dir: PathBuf,
}

impl ResultStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn image_path(&self, item_id: &str) -> PathBuf {
        self.dir.join(format!("{item_id}.{IMAGE_EXTENSION}"))
    }

    pub fn video_path(&self, item_id: &str) -> PathBuf {
        self.dir.join(format!("{item_id}.{VIDEO_EXTENSION}"))
    }

    pub async fn save_image(&self, item_id: &str, bytes: &[u8]) -> Result<PathBuf> {
        self.write(self.image_path(item_id), bytes).await
    }

    pub async fn save_video(&self, item_id: &str, bytes: &[u8]) -> Result<PathBuf> {
        self.write(self.video_path(item_id), bytes).await
    }

    async fn write(&self, path: PathBuf, bytes: &[u8]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create result directory: {}", self.dir.display()))?;
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write result: {}", path.display()))?;
        Ok(path)
    }

    /// `Ok(None)` when nothing is stored for the item.
    pub async fn load_image(&self, item_id: &str) -> Result<Option<Vec<u8>>> {
        let path = self.image_path(item_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("failed to read result: {}", path.display()))
            }
        }
    }

    /// Remove every file stored for the item. Missing files are fine.
    pub async fn remove(&self, item_id: &str) -> Result<()> {
        for path in [self.image_path(item_id), self.video_path(item_id)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to remove result: {}", path.display()))
                }
            }
        }
        Ok(())
    }
}
