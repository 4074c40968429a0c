//! Object-store seam.
//!
//! The real backend (GCS/S3) lives outside this crate; the pipeline
//! consumes it through [`ArtifactStore`]. Artifacts are write-once per
//! key; callers add a unique suffix when a path could repeat.

pub mod catalog;

use std::{collections::HashMap, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::error::{PipelineError, PipelineResult};

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Upload a local file under `key`. Keys are write-once.
    async fn put_file(&self, key: &str, local_path: &Path) -> PipelineResult<()>;

    /// Signed read URL with the given validity. Re-signing does not
    /// rewrite the object.
    async fn signed_url(&self, key: &str, ttl: Duration) -> PipelineResult<String>;

    async fn exists(&self, key: &str) -> PipelineResult<bool>;
}

/// In-memory artifact store for tests: records sizes, enforces
/// write-once, and mints deterministic signed URLs.
#[derive(Default)]
pub struct MemoryArtifactStore {
    objects: Arc<Mutex<HashMap<String, u64>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put_file(&self, key: &str, local_path: &Path) -> PipelineResult<()> {
        let size = tokio::fs::metadata(local_path).await?.len();
        let mut objects = self.objects.lock();
        if objects.contains_key(key) {
            return Err(PipelineError::Storage(format!(
                "artifact key already written: {key}"
            )));
        }
        objects.insert(key.to_string(), size);
        Ok(())
    }

    async fn signed_url(&self, key: &str, ttl: Duration) -> PipelineResult<String> {
        if !self.objects.lock().contains_key(key) {
            return Err(PipelineError::Storage(format!("no such artifact: {key}")));
        }
        Ok(format!(
            "https://storage.test/{key}?expires={}",
            ttl.as_secs()
        ))
    }

    async fn exists(&self, key: &str) -> PipelineResult<bool> {
        Ok(self.objects.lock().contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_file() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.bin");
        tokio::fs::write(&path, b"data").await.unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn artifacts_are_write_once() {
        let (_dir, path) = temp_file().await;
        let store = MemoryArtifactStore::new();
        store.put_file("a/b.wav", &path).await.unwrap();
        let err = store.put_file("a/b.wav", &path).await.unwrap_err();
        assert!(matches!(err, PipelineError::Storage(_)));
    }

    #[tokio::test]
    async fn signing_requires_existing_object() {
        let (_dir, path) = temp_file().await;
        let store = MemoryArtifactStore::new();
        assert!(store
            .signed_url("missing", Duration::from_secs(60))
            .await
            .is_err());
        store.put_file("k", &path).await.unwrap();
        let url = store.signed_url("k", Duration::from_secs(3600)).await.unwrap();
        assert!(url.contains("k?expires=3600"));
        assert!(store.exists("k").await.unwrap());
    }
}
