//! Durable photo storage on the local filesystem
//!
//! Chat file ids are only meaningful to the chat API, so before an appeal is
//! handed to a worker its photos are downloaded to
//! `{dir}/{user_id}/{appeal_id}/{n}.jpg` and addressed by stable URLs.

use crate::ids::AppealKey;
use crate::runtime::{FileSource, PhotoStorage, ServiceError};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct LocalPhotoStorage {
    source: Arc<dyn FileSource>,
    dir: PathBuf,
    /// Public prefix the directory is served under; file paths are used
    /// when unset
    base_url: Option<String>,
}

impl LocalPhotoStorage {
    pub fn new(source: Arc<dyn FileSource>, dir: impl Into<PathBuf>, base_url: Option<&str>) -> Self {
        Self {
            source,
            dir: dir.into(),
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
        }
    }

    fn appeal_dir(&self, key: AppealKey) -> PathBuf {
        self.dir
            .join(key.user_id.to_string())
            .join(key.appeal_id.to_string())
    }

    fn url_for(&self, key: AppealKey, name: &str, path: &Path) -> String {
        match &self.base_url {
            Some(base) => format!("{base}/{}/{}/{name}", key.user_id, key.appeal_id),
            None => path.display().to_string(),
        }
    }
}

#[async_trait]
impl PhotoStorage for LocalPhotoStorage {
    async fn store(&self, key: AppealKey, file_ids: &[String]) -> Result<Vec<String>, ServiceError> {
        let dir = self.appeal_dir(key);
        tokio::fs::create_dir_all(&dir).await?;

        let mut urls = Vec::with_capacity(file_ids.len());
        for (n, file_id) in file_ids.iter().enumerate() {
            let bytes = self.source.download(file_id).await?;
            let name = format!("{n}.jpg");
            let path = dir.join(&name);
            tokio::fs::write(&path, bytes).await?;
            urls.push(self.url_for(key, &name, &path));
        }

        tracing::info!(
            user_id = key.user_id,
            appeal_id = key.appeal_id,
            count = urls.len(),
            "Stored violation photos"
        );
        Ok(urls)
    }

    async fn clear(&self, key: AppealKey) -> Result<(), ServiceError> {
        match tokio::fs::remove_dir_all(self.appeal_dir(key)).await {
            Ok(()) => {
                tracing::debug!(user_id = key.user_id, appeal_id = key.appeal_id, "Cleared photos");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
