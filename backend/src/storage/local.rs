use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

use super::{ImageStore, StorageError};

/// Writes images below a media root on the local filesystem.
#[derive(Clone)]
pub struct LocalImageStore {
    media_root: PathBuf,
}

impl LocalImageStore {
    pub fn new(media_root: impl Into<PathBuf>) -> Self {
        Self {
            media_root: media_root.into(),
        }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !safe {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.media_root.join(relative))
    }
}

#[async_trait]
impl ImageStore for LocalImageStore {
    async fn put(&self, key: &str, bytes: &[u8], _content_type: &str) -> Result<String, StorageError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        log::debug!("Stored image at {}", path.display());
        Ok(key.to_string())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
