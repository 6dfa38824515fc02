//! Chunk Store
//!
//! Staging storage for uploaded chunks before assembly. Each upload gets its
//! own directory holding one file per chunk index.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::types::UploadError;

// ============================================================================
// Chunk Storage Trait
// ============================================================================

/// Trait for chunk storage backends
#[async_trait::async_trait]
pub trait ChunkStorage: Send + Sync {
    /// Store a chunk. Readers never observe a partially written chunk.
    async fn store_chunk(
        &self,
        upload_id: &str,
        chunk_index: usize,
        data: &[u8],
    ) -> Result<(), UploadError>;

    /// Get a chunk's bytes, or `None` if it was never stored
    async fn get_chunk(
        &self,
        upload_id: &str,
        chunk_index: usize,
    ) -> Result<Option<Vec<u8>>, UploadError>;

    /// Check whether a chunk is stored
    async fn chunk_exists(&self, upload_id: &str, chunk_index: usize) -> Result<bool, UploadError>;

    /// Delete one chunk; returns whether it existed
    async fn remove_chunk(&self, upload_id: &str, chunk_index: usize) -> Result<bool, UploadError>;

    /// Delete every chunk of an upload; returns how many were removed
    async fn purge(&self, upload_id: &str) -> Result<usize, UploadError>;

    /// Upload IDs with staged chunks that have not been written to since `cutoff`
    async fn staged_uploads(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, UploadError>;
}

// ============================================================================
// Chunk Store (Main Implementation)
// ============================================================================

/// Chunk store with a pluggable backend
#[derive(Clone)]
pub struct ChunkStore {
    backend: Arc<dyn ChunkStorage>,
}

impl ChunkStore {
    /// Create with local filesystem storage
    pub fn with_local_storage(base_path: PathBuf) -> Self {
        Self::with_backend(Arc::new(LocalChunkStorage::new(base_path)))
    }

    /// Create with any backend
    pub fn with_backend(backend: Arc<dyn ChunkStorage>) -> Self {
        Self { backend }
    }

    pub async fn store_chunk(
        &self,
        upload_id: &str,
        chunk_index: usize,
        data: &[u8],
    ) -> Result<(), UploadError> {
        self.backend.store_chunk(upload_id, chunk_index, data).await?;

        tracing::debug!(
            upload_id = %upload_id,
            chunk_index = chunk_index,
            size = data.len(),
            "Stored chunk"
        );

        Ok(())
    }

    pub async fn get_chunk(
        &self,
        upload_id: &str,
        chunk_index: usize,
    ) -> Result<Option<Vec<u8>>, UploadError> {
        self.backend.get_chunk(upload_id, chunk_index).await
    }

    pub async fn chunk_exists(&self, upload_id: &str, chunk_index: usize) -> Result<bool, UploadError> {
        self.backend.chunk_exists(upload_id, chunk_index).await
    }

    pub async fn remove_chunk(&self, upload_id: &str, chunk_index: usize) -> Result<bool, UploadError> {
        self.backend.remove_chunk(upload_id, chunk_index).await
    }

    pub async fn staged_uploads(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, UploadError> {
        self.backend.staged_uploads(cutoff).await
    }

    pub async fn purge(&self, upload_id: &str) -> Result<usize, UploadError> {
        let removed = self.backend.purge(upload_id).await?;
        if removed > 0 {
            tracing::debug!(upload_id = %upload_id, removed = removed, "Purged upload chunks");
        }
        Ok(removed)
    }
}

// ============================================================================
// Local Filesystem Storage
// ============================================================================

/// Local filesystem chunk storage: `<base>/<upload_id>/<index>`
pub struct LocalChunkStorage {
    base_path: PathBuf,
}

impl LocalChunkStorage {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn upload_dir(&self, upload_id: &str) -> PathBuf {
        self.base_path.join(upload_id)
    }

    /// Final location of a chunk
    pub fn chunk_path(&self, upload_id: &str, chunk_index: usize) -> PathBuf {
        self.upload_dir(upload_id).join(chunk_index.to_string())
    }

    /// Unique temp name in the chunk's own directory so the rename stays on
    /// one filesystem. Temp names start with a dot and never parse as an index.
    fn temp_path(&self, upload_id: &str, chunk_index: usize) -> PathBuf {
        self.upload_dir(upload_id)
            .join(format!(".{}.tmp.{}", chunk_index, Uuid::new_v4()))
    }
}

#[async_trait::async_trait]
impl ChunkStorage for LocalChunkStorage {
    async fn store_chunk(
        &self,
        upload_id: &str,
        chunk_index: usize,
        data: &[u8],
    ) -> Result<(), UploadError> {
        let dir = self.upload_dir(upload_id);
        tokio::fs::create_dir_all(&dir).await?;

        let temp_path = self.temp_path(upload_id, chunk_index);
        let final_path = self.chunk_path(upload_id, chunk_index);

        let written = async {
            let mut file = tokio::fs::File::create(&temp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            tokio::fs::rename(&temp_path, &final_path).await
        }
        .await;

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(UploadError::StorageError(format!(
                "Failed to write chunk {} of {}: {}",
                chunk_index, upload_id, e
            )));
        }

        Ok(())
    }

    async fn get_chunk(
        &self,
        upload_id: &str,
        chunk_index: usize,
    ) -> Result<Option<Vec<u8>>, UploadError> {
        let path = self.chunk_path(upload_id, chunk_index);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(UploadError::StorageError(format!(
                "Failed to read chunk {} of {}: {}",
                chunk_index, upload_id, e
            ))),
        }
    }

    async fn chunk_exists(&self, upload_id: &str, chunk_index: usize) -> Result<bool, UploadError> {
        let path = self.chunk_path(upload_id, chunk_index);
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn remove_chunk(&self, upload_id: &str, chunk_index: usize) -> Result<bool, UploadError> {
        let path = self.chunk_path(upload_id, chunk_index);
        let existed = match tokio::fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        // Only succeeds once the directory is empty
        let _ = tokio::fs::remove_dir(self.upload_dir(upload_id)).await;

        Ok(existed)
    }

    async fn purge(&self, upload_id: &str) -> Result<usize, UploadError> {
        let dir = self.upload_dir(upload_id);

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut count = 0;
        while let Some(entry) = entries.next_entry().await? {
            let is_chunk = entry
                .file_name()
                .to_str()
                .map(|name| name.parse::<usize>().is_ok())
                .unwrap_or(false);
            if is_chunk {
                count += 1;
            }
        }

        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(count),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(count),
            Err(e) => Err(e.into()),
        }
    }

    async fn staged_uploads(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, UploadError> {
        let mut entries = match tokio::fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut idle = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }

            let metadata = entry.metadata().await?;
            if !metadata.is_dir() {
                continue;
            }
            let modified: DateTime<Utc> = metadata.modified()?.into();
            if modified < cutoff {
                idle.push(name);
            }
        }

        idle.sort();
        Ok(idle)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(temp_dir: &TempDir) -> ChunkStore {
        ChunkStore::with_local_storage(temp_dir.path().to_path_buf())
    }

    #[tokio::test]
    async fn test_store_and_get_chunk() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        store.store_chunk("up-1", 0, b"test chunk data").await.unwrap();

        assert!(store.chunk_exists("up-1", 0).await.unwrap());
        assert!(!store.chunk_exists("up-1", 1).await.unwrap());
        assert_eq!(
            store.get_chunk("up-1", 0).await.unwrap().unwrap(),
            b"test chunk data"
        );
        assert!(store.get_chunk("up-1", 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overwrite_is_atomic_replace() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        store.store_chunk("up-1", 0, b"first").await.unwrap();
        store.store_chunk("up-1", 0, b"second").await.unwrap();

        assert_eq!(store.get_chunk("up-1", 0).await.unwrap().unwrap(), b"second");

        // No temp files left behind
        let names: Vec<String> = std::fs::read_dir(temp_dir.path().join("up-1"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["0".to_string()]);
    }

    #[tokio::test]
    async fn test_parallel_chunk_writes() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        let handles: Vec<_> = (0..8usize)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.store_chunk("up-1", i, format!("chunk-{}", i).as_bytes()).await
                })
            })
            .collect();
        for handle in futures::future::join_all(handles).await {
            handle.unwrap().unwrap();
        }

        for i in 0..8usize {
            assert_eq!(
                store.get_chunk("up-1", i).await.unwrap().unwrap(),
                format!("chunk-{}", i).as_bytes()
            );
        }
    }

    #[tokio::test]
    async fn test_remove_chunk() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        store.store_chunk("up-1", 0, b"a").await.unwrap();
        store.store_chunk("up-1", 1, b"b").await.unwrap();

        assert!(store.remove_chunk("up-1", 1).await.unwrap());
        assert!(!store.remove_chunk("up-1", 1).await.unwrap());
        assert!(store.chunk_exists("up-1", 0).await.unwrap());

        // Removing the last chunk drops the directory too
        assert!(store.remove_chunk("up-1", 0).await.unwrap());
        assert!(!temp_dir.path().join("up-1").exists());
    }

    #[tokio::test]
    async fn test_staged_uploads() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        assert!(store.staged_uploads(Utc::now()).await.unwrap().is_empty());

        store.store_chunk("up-b", 0, b"b").await.unwrap();
        store.store_chunk("up-a", 0, b"a").await.unwrap();
        std::fs::create_dir_all(temp_dir.path().join(".hidden")).unwrap();
        std::fs::write(temp_dir.path().join("stray-file"), b"x").unwrap();

        let past = Utc::now() - chrono::Duration::hours(1);
        assert!(store.staged_uploads(past).await.unwrap().is_empty());

        let future = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(
            store.staged_uploads(future).await.unwrap(),
            vec!["up-a".to_string(), "up-b".to_string()]
        );
    }

    #[tokio::test]
    async fn test_purge() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        store.store_chunk("up-1", 0, b"a").await.unwrap();
        store.store_chunk("up-1", 2, b"c").await.unwrap();
        store.store_chunk("up-2", 0, b"other").await.unwrap();

        assert_eq!(store.purge("up-1").await.unwrap(), 2);
        assert!(!store.chunk_exists("up-1", 0).await.unwrap());
        assert!(store.chunk_exists("up-2", 0).await.unwrap());

        // Purging again, or purging something never uploaded, is fine
        assert_eq!(store.purge("up-1").await.unwrap(), 0);
        assert_eq!(store.purge("never").await.unwrap(), 0);
    }
}
