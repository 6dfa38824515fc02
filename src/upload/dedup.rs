//! Deduplication Index
//!
//! Maps verified content hashes to published artifacts. Enables instant
//! transfer when a client announces a file whose content is already stored.

use std::sync::Arc;

use chrono::Utc;

use super::artifact::ArtifactStore;
use super::store::{DedupStore, MemoryDedupStore};
use super::types::{file_extension, DedupEntry, UploadError};

// ============================================================================
// Deduplication Index
// ============================================================================

/// Content hash -> artifact lookups backed by a [`DedupStore`]
#[derive(Clone)]
pub struct DedupIndex {
    store: Arc<dyn DedupStore>,
    artifacts: ArtifactStore,
}

impl DedupIndex {
    /// Create an index over an in-memory store
    pub fn new(artifacts: ArtifactStore) -> Self {
        Self::with_store(Arc::new(MemoryDedupStore::new()), artifacts)
    }

    /// Create an index over any dedup store
    pub fn with_store(store: Arc<dyn DedupStore>, artifacts: ArtifactStore) -> Self {
        Self { store, artifacts }
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    /// Find the artifact for `content_hash`.
    ///
    /// Entries whose artifact has vanished are dropped. When nothing is
    /// indexed, an artifact already on disk under `<hash><.ext>` (for the
    /// extension of `file_name`) is picked up and indexed.
    pub async fn lookup(
        &self,
        content_hash: &str,
        file_name: &str,
    ) -> Result<Option<DedupEntry>, UploadError> {
        if let Some(entry) = self.store.get(content_hash).await? {
            if self.artifacts.exists(&entry.artifact_name).await? {
                tracing::debug!(
                    content_hash = %content_hash,
                    artifact = %entry.artifact_name,
                    "Dedup hit"
                );
                return Ok(Some(entry));
            }

            tracing::warn!(
                content_hash = %content_hash,
                artifact = %entry.artifact_name,
                "Artifact missing for dedup entry, dropping entry"
            );
            self.store.remove(content_hash).await?;
        }

        self.rediscover(content_hash, file_name).await
    }

    /// Register a verified artifact. The first registration for a hash wins.
    pub async fn register(&self, entry: DedupEntry) -> Result<DedupEntry, UploadError> {
        let stored = self.store.put_if_absent(entry).await?;

        tracing::info!(
            content_hash = %stored.content_hash,
            artifact = %stored.artifact_name,
            size = stored.size,
            "Registered artifact for deduplication"
        );

        Ok(stored)
    }

    /// Number of indexed artifacts
    pub async fn count(&self) -> Result<usize, UploadError> {
        self.store.count().await
    }

    async fn rediscover(
        &self,
        content_hash: &str,
        file_name: &str,
    ) -> Result<Option<DedupEntry>, UploadError> {
        let name = ArtifactStore::artifact_name(content_hash, &file_extension(file_name));
        let Some(size) = self.artifacts.size(&name).await? else {
            return Ok(None);
        };

        tracing::info!(
            content_hash = %content_hash,
            artifact = %name,
            "Found unindexed artifact on disk"
        );

        let entry = DedupEntry {
            content_hash: content_hash.to_string(),
            artifact_name: name,
            size,
            created_at: Utc::now(),
        };
        self.register(entry).await.map(Some)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(hash: &str, name: &str) -> DedupEntry {
        DedupEntry {
            content_hash: hash.to_string(),
            artifact_name: name.to_string(),
            size: 3,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_lookup_registered_artifact() {
        let temp_dir = TempDir::new().unwrap();
        let index = DedupIndex::new(ArtifactStore::new(temp_dir.path()));

        std::fs::write(temp_dir.path().join("abc.txt"), b"abc").unwrap();
        index.register(entry("abc", "abc.txt")).await.unwrap();

        let found = index.lookup("abc", "whatever.txt").await.unwrap().unwrap();
        assert_eq!(found.artifact_name, "abc.txt");
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stale_entry_is_dropped() {
        let temp_dir = TempDir::new().unwrap();
        let index = DedupIndex::new(ArtifactStore::new(temp_dir.path()));

        index.register(entry("abc", "abc.txt")).await.unwrap();

        assert!(index.lookup("abc", "a.txt").await.unwrap().is_none());
        assert_eq!(index.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rediscovers_artifact_on_disk() {
        let temp_dir = TempDir::new().unwrap();
        let index = DedupIndex::new(ArtifactStore::new(temp_dir.path()));

        std::fs::write(temp_dir.path().join("abc.pdf"), b"hello").unwrap();

        // Different extension does not match
        assert!(index.lookup("abc", "doc.txt").await.unwrap().is_none());

        let found = index.lookup("abc", "doc.PDF").await.unwrap().unwrap();
        assert_eq!(found.artifact_name, "abc.pdf");
        assert_eq!(found.size, 5);
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_first_registration_wins() {
        let temp_dir = TempDir::new().unwrap();
        let index = DedupIndex::new(ArtifactStore::new(temp_dir.path()));

        index.register(entry("abc", "abc.txt")).await.unwrap();
        let kept = index.register(entry("abc", "abc.bin")).await.unwrap();

        assert_eq!(kept.artifact_name, "abc.txt");
    }
}
