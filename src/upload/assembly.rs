//! Assembly Engine
//!
//! Turns a fully received upload into a published artifact. Chunks are
//! streamed in index order into a staging file and hashed on the way through,
//! so only one chunk is held in memory at a time. The artifact only becomes
//! visible after its digest matched the claimed content hash.

use chrono::Utc;

use super::artifact::{ArtifactStore, StagedArtifact};
use super::chunk_store::ChunkStore;
use super::dedup::DedupIndex;
use super::digest::ContentHasher;
use super::session::SessionRegistry;
use super::types::{DedupEntry, MergeOutcome, UploadError, UploadSession};

/// Merges chunks into verified artifacts
#[derive(Clone)]
pub struct AssemblyEngine {
    registry: SessionRegistry,
    chunks: ChunkStore,
    artifacts: ArtifactStore,
    dedup: DedupIndex,
}

impl AssemblyEngine {
    pub fn new(
        registry: SessionRegistry,
        chunks: ChunkStore,
        artifacts: ArtifactStore,
        dedup: DedupIndex,
    ) -> Self {
        Self {
            registry,
            chunks,
            artifacts,
            dedup,
        }
    }

    /// Assemble, verify and publish an upload.
    ///
    /// On a digest mismatch the session is discarded together with its
    /// chunks. On a missing chunk or a storage failure the session goes back
    /// to receiving (without the missing index) so the client can re-upload
    /// and merge again.
    pub async fn merge(&self, upload_id: &str) -> Result<MergeOutcome, UploadError> {
        let session = self.registry.begin_merge(upload_id).await?;

        let mut staged = match self.artifacts.stage().await {
            Ok(staged) => staged,
            Err(e) => return Err(self.abort(upload_id, e).await),
        };

        let digest = match self.copy_chunks(&session, &mut staged).await {
            Ok(digest) => digest,
            Err(e) => {
                staged.discard().await;
                return Err(self.abort(upload_id, e).await);
            }
        };

        if !digest.eq_ignore_ascii_case(&session.content_hash) {
            staged.discard().await;
            return Err(self.reject(&session, digest).await);
        }

        let size = staged.written();
        let artifact_name = ArtifactStore::artifact_name(&session.content_hash, &session.extension());

        if let Err(e) = staged.publish(&artifact_name).await {
            return Err(self.abort(upload_id, e).await);
        }

        let entry = DedupEntry {
            content_hash: session.content_hash.clone(),
            artifact_name: artifact_name.clone(),
            size,
            created_at: Utc::now(),
        };
        if let Err(e) = self.dedup.register(entry).await {
            return Err(self.abort(upload_id, e).await);
        }

        if let Err(e) = self.chunks.purge(upload_id).await {
            tracing::warn!(upload_id = %upload_id, error = %e, "Failed to purge merged chunks");
        }

        let session = self.registry.complete_or_fail(upload_id, true, None).await?;

        tracing::info!(
            upload_id = %upload_id,
            artifact = %artifact_name,
            size = size,
            "Merge completed"
        );

        Ok(MergeOutcome {
            content_hash: session.content_hash.clone(),
            session,
            artifact_name,
            size,
        })
    }

    /// Stream every chunk into `staged`, returning the digest of the whole
    async fn copy_chunks(
        &self,
        session: &UploadSession,
        staged: &mut StagedArtifact,
    ) -> Result<String, UploadError> {
        let mut hasher = ContentHasher::new();

        for index in 0..session.chunk_count {
            let data = self
                .chunks
                .get_chunk(&session.upload_id, index)
                .await?
                .ok_or(UploadError::MissingChunk(index))?;

            hasher.update(&data);
            staged.write(&data).await?;
        }

        tracing::debug!(
            upload_id = %session.upload_id,
            bytes = hasher.bytes_hashed(),
            "Chunks assembled"
        );

        Ok(hasher.finalize())
    }

    /// Roll the session back to receiving and hand back the original error
    async fn abort(&self, upload_id: &str, err: UploadError) -> UploadError {
        tracing::error!(upload_id = %upload_id, error = %err, "Merge failed");

        let drop_indices = match &err {
            UploadError::MissingChunk(index) => vec![*index],
            _ => Vec::new(),
        };
        if let Err(e) = self.registry.abort_merge(upload_id, &drop_indices).await {
            tracing::warn!(upload_id = %upload_id, error = %e, "Failed to roll back merge");
        }

        err
    }

    /// Discard a session whose assembled bytes did not match its claim
    async fn reject(&self, session: &UploadSession, actual: String) -> UploadError {
        let upload_id = session.upload_id.as_str();

        tracing::error!(
            upload_id = %upload_id,
            expected = %session.content_hash,
            actual = %actual,
            "Assembled file does not match its content hash"
        );

        if let Err(e) = self
            .registry
            .complete_or_fail(upload_id, false, Some("hash mismatch"))
            .await
        {
            tracing::warn!(upload_id = %upload_id, error = %e, "Failed to discard session");
        }
        if let Err(e) = self.chunks.purge(upload_id).await {
            tracing::warn!(upload_id = %upload_id, error = %e, "Failed to purge rejected chunks");
        }

        UploadError::IntegrityError {
            expected: session.content_hash.clone(),
            actual,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::chunk_store::LocalChunkStorage;
    use crate::upload::digest::compute_hash;
    use crate::upload::types::SessionStatus;
    use tempfile::TempDir;

    struct Fixture {
        temp_dir: TempDir,
        registry: SessionRegistry,
        chunks: ChunkStore,
        artifacts: ArtifactStore,
        dedup: DedupIndex,
        engine: AssemblyEngine,
    }

    impl Fixture {
        async fn new() -> Self {
            let temp_dir = TempDir::new().unwrap();
            let registry = SessionRegistry::new();
            let chunks = ChunkStore::with_local_storage(temp_dir.path().join("temp"));
            let artifacts = ArtifactStore::new(temp_dir.path().join("files"));
            artifacts.init().await.unwrap();
            let dedup = DedupIndex::new(artifacts.clone());
            let engine = AssemblyEngine::new(
                registry.clone(),
                chunks.clone(),
                artifacts.clone(),
                dedup.clone(),
            );

            Self {
                temp_dir,
                registry,
                chunks,
                artifacts,
                dedup,
                engine,
            }
        }

        /// Upload `parts` for `upload_id` in the given index order
        async fn upload(&self, upload_id: &str, hash: &str, parts: &[&[u8]], order: &[usize]) {
            self.registry
                .get_or_create(upload_id, "letters.txt", hash, parts.len())
                .await
                .unwrap();
            for &index in order {
                self.chunks.store_chunk(upload_id, index, parts[index]).await.unwrap();
                self.registry.record_chunk(upload_id, index).await.unwrap();
            }
        }

        fn chunk_path(&self, upload_id: &str, index: usize) -> std::path::PathBuf {
            LocalChunkStorage::new(self.temp_dir.path().join("temp")).chunk_path(upload_id, index)
        }
    }

    const PARTS: [&[u8]; 3] = [b"AAA", b"BBB", b"CCC"];

    #[tokio::test]
    async fn test_merge_out_of_order_upload() {
        let fx = Fixture::new().await;
        let hash = compute_hash(b"AAABBBCCC");
        fx.upload("up-1", &hash, &PARTS, &[1, 0, 2]).await;

        let outcome = fx.engine.merge("up-1").await.unwrap();

        assert_eq!(outcome.artifact_name, format!("{}.txt", hash));
        assert_eq!(outcome.size, 9);
        assert_eq!(outcome.session.status, SessionStatus::Completed);

        let path = fx.artifacts.artifact_path(&outcome.artifact_name).unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"AAABBBCCC");

        // Session closed, chunks gone, dedup entry present
        assert!(fx.registry.list().await.unwrap().is_empty());
        assert!(!fx.chunks.chunk_exists("up-1", 0).await.unwrap());
        let entry = fx.dedup.lookup(&hash, "letters.txt").await.unwrap().unwrap();
        assert_eq!(entry.artifact_name, outcome.artifact_name);
    }

    #[tokio::test]
    async fn test_corrupted_chunk_fails_integrity() {
        let fx = Fixture::new().await;
        let hash = compute_hash(b"AAABBBCCC");
        fx.upload("up-1", &hash, &PARTS, &[0, 1, 2]).await;

        std::fs::write(fx.chunk_path("up-1", 1), b"XXX").unwrap();

        let result = fx.engine.merge("up-1").await;
        assert!(matches!(result, Err(UploadError::IntegrityError { .. })));

        // Nothing published or indexed, session discarded
        assert_eq!(fx.dedup.count().await.unwrap(), 0);
        assert!(!fx.artifacts.exists(&format!("{}.txt", hash)).await.unwrap());
        assert!(fx.registry.list().await.unwrap().is_empty());
        assert!(!fx.chunks.chunk_exists("up-1", 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_chunk_rolls_back() {
        let fx = Fixture::new().await;
        let hash = compute_hash(b"AAABBBCCC");
        fx.upload("up-1", &hash, &PARTS, &[0, 1, 2]).await;

        std::fs::remove_file(fx.chunk_path("up-1", 2)).unwrap();

        let result = fx.engine.merge("up-1").await;
        assert!(matches!(result, Err(UploadError::MissingChunk(2))));

        let session = fx.registry.get("up-1").await.unwrap();
        assert_eq!(session.status, SessionStatus::Receiving);
        assert_eq!(session.missing_chunks(), vec![2]);

        // Re-upload and retry succeeds
        fx.chunks.store_chunk("up-1", 2, b"CCC").await.unwrap();
        fx.registry.record_chunk("up-1", 2).await.unwrap();
        let outcome = fx.engine.merge("up-1").await.unwrap();
        assert_eq!(outcome.size, 9);
    }

    #[tokio::test]
    async fn test_incomplete_merge_is_rejected() {
        let fx = Fixture::new().await;
        let hash = compute_hash(b"AAABBBCCC");
        fx.upload("up-1", &hash, &PARTS, &[0, 2]).await;

        let result = fx.engine.merge("up-1").await;
        assert!(matches!(result, Err(UploadError::IncompleteUpload { .. })));
        assert_eq!(
            fx.registry.get("up-1").await.unwrap().status,
            SessionStatus::Receiving
        );
    }

    #[tokio::test]
    async fn test_concurrent_merges() {
        let fx = Fixture::new().await;
        let hash = compute_hash(b"AAABBBCCC");
        fx.upload("up-1", &hash, &PARTS, &[2, 1, 0]).await;

        let (a, b) = tokio::join!(fx.engine.merge("up-1"), fx.engine.merge("up-1"));

        let (ok, conflict) = if a.is_ok() { (a, b) } else { (b, a) };
        assert!(ok.is_ok());
        assert!(matches!(conflict, Err(UploadError::MergeAlreadyInProgress(_))));
        assert_eq!(fx.dedup.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_merge_unknown_upload() {
        let fx = Fixture::new().await;
        assert!(matches!(
            fx.engine.merge("nope").await,
            Err(UploadError::UnknownUpload(_))
        ));
    }
}
