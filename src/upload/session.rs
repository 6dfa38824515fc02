//! Upload Session Registry
//!
//! Owns every mutation of upload sessions. All updates are read-modify-write
//! cycles against a [`SessionStore`] with compare-and-swap, so concurrent
//! requests for the same upload serialize per upload ID while unrelated
//! uploads never contend.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::store::{MemorySessionStore, SessionStore};
use super::types::{SessionStatus, UploadError, UploadSession, Versioned};

/// CAS retries before giving up on a hot session
const MAX_CAS_ATTEMPTS: usize = 64;

// ============================================================================
// Session Registry
// ============================================================================

/// Authoritative registry of in-flight uploads
#[derive(Clone)]
pub struct SessionRegistry {
    store: Arc<dyn SessionStore>,
}

impl SessionRegistry {
    /// Create a registry over an in-memory store
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemorySessionStore::new()))
    }

    /// Create a registry over any session store
    pub fn with_store(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    // ========================================================================
    // Session Lifecycle
    // ========================================================================

    /// Return the session for `upload_id`, creating it if needed.
    ///
    /// An existing session must agree on `content_hash` and `chunk_count`.
    pub async fn get_or_create(
        &self,
        upload_id: &str,
        file_name: &str,
        content_hash: &str,
        chunk_count: usize,
    ) -> Result<UploadSession, UploadError> {
        let candidate = UploadSession::new(upload_id, file_name, content_hash, chunk_count);
        let created_at = candidate.created_at;
        let stored = self.store.insert_if_absent(candidate).await?;
        let session = stored.value;

        if session.chunk_count != chunk_count {
            return Err(UploadError::InconsistentSession {
                upload_id: upload_id.to_string(),
                detail: format!(
                    "chunk count {} does not match declared {}",
                    chunk_count, session.chunk_count
                ),
            });
        }
        if session.content_hash != content_hash {
            return Err(UploadError::InconsistentSession {
                upload_id: upload_id.to_string(),
                detail: format!(
                    "content hash {} does not match declared {}",
                    content_hash, session.content_hash
                ),
            });
        }

        if stored.version == 1 && session.created_at == created_at {
            tracing::info!(
                upload_id = %upload_id,
                file_name = %session.file_name,
                content_hash = %session.content_hash,
                chunks = session.chunk_count,
                "Created upload session"
            );
        }

        Ok(session)
    }

    /// Mark a chunk as stored. Re-recording an index is a no-op success.
    pub async fn record_chunk(
        &self,
        upload_id: &str,
        chunk_index: usize,
    ) -> Result<UploadSession, UploadError> {
        self.update(upload_id, |session| {
            if chunk_index >= session.chunk_count {
                return Err(UploadError::ChunkIndexOutOfRange {
                    index: chunk_index,
                    chunk_count: session.chunk_count,
                });
            }
            if session.received_chunks.contains(&chunk_index) {
                return Ok(false);
            }
            if session.status != SessionStatus::Receiving {
                return Err(UploadError::MergeAlreadyInProgress(upload_id.to_string()));
            }
            session.received_chunks.insert(chunk_index);
            Ok(true)
        })
        .await
    }

    /// Move a complete session from `Receiving` to `Merging`.
    ///
    /// Exactly one of several concurrent callers succeeds; the rest get
    /// `MergeAlreadyInProgress`.
    pub async fn begin_merge(&self, upload_id: &str) -> Result<UploadSession, UploadError> {
        let session = self
            .update(upload_id, |session| {
                if session.status == SessionStatus::Merging {
                    return Err(UploadError::MergeAlreadyInProgress(upload_id.to_string()));
                }
                if !session.is_complete() {
                    return Err(UploadError::IncompleteUpload {
                        received: session.received_chunks.len(),
                        expected: session.chunk_count,
                        missing: session.missing_chunks(),
                    });
                }
                session.status = SessionStatus::Merging;
                Ok(true)
            })
            .await?;

        tracing::info!(
            upload_id = %upload_id,
            chunks = session.chunk_count,
            "Merge started"
        );

        Ok(session)
    }

    /// Finish a merge. The session leaves the registry either way; the final
    /// snapshot (`Completed` or `Failed`) is returned.
    pub async fn complete_or_fail(
        &self,
        upload_id: &str,
        success: bool,
        reason: Option<&str>,
    ) -> Result<UploadSession, UploadError> {
        let mut session = self.require_merging(upload_id).await?;
        self.store.remove(upload_id).await?;

        session.status = if success {
            SessionStatus::Completed
        } else {
            SessionStatus::Failed
        };
        session.updated_at = Utc::now();

        if success {
            tracing::info!(
                upload_id = %upload_id,
                file_name = %session.file_name,
                "Upload session completed"
            );
        } else {
            tracing::warn!(
                upload_id = %upload_id,
                reason = reason.unwrap_or("unspecified"),
                "Upload session failed and was discarded"
            );
        }

        Ok(session)
    }

    /// Roll a failed merge back to `Receiving`, forgetting `drop_indices` so
    /// the client uploads them again.
    pub async fn abort_merge(
        &self,
        upload_id: &str,
        drop_indices: &[usize],
    ) -> Result<UploadSession, UploadError> {
        let session = self
            .update(upload_id, |session| {
                if session.status != SessionStatus::Merging {
                    return Err(UploadError::InvalidRequest(format!(
                        "upload {} is not merging",
                        upload_id
                    )));
                }
                session.status = SessionStatus::Receiving;
                for index in drop_indices {
                    session.received_chunks.remove(index);
                }
                Ok(true)
            })
            .await?;

        tracing::warn!(
            upload_id = %upload_id,
            dropped = ?drop_indices,
            "Merge aborted, upload is receiving again"
        );

        Ok(session)
    }

    /// Roll every `Merging` session back to `Receiving`.
    ///
    /// Only safe while no merge can be running, i.e. at startup. The
    /// recovered sessions keep their chunk set and can be merged again.
    pub async fn recover_merges(&self) -> Result<Vec<UploadSession>, UploadError> {
        let mut recovered = Vec::new();
        for session in self.store.list().await? {
            if session.status != SessionStatus::Merging {
                continue;
            }
            match self.abort_merge(&session.upload_id, &[]).await {
                Ok(session) => recovered.push(session),
                Err(UploadError::UnknownUpload(_)) | Err(UploadError::InvalidRequest(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(recovered)
    }

    /// Explicitly abandon an upload. Refused while a merge is running.
    pub async fn abandon(&self, upload_id: &str) -> Result<UploadSession, UploadError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Versioned { version, value } = self
                .store
                .get(upload_id)
                .await?
                .ok_or_else(|| UploadError::UnknownUpload(upload_id.to_string()))?;

            if value.status == SessionStatus::Merging {
                return Err(UploadError::MergeAlreadyInProgress(upload_id.to_string()));
            }

            if let Some(removed) = self.store.compare_and_remove(upload_id, version).await? {
                tracing::info!(
                    upload_id = %upload_id,
                    file_name = %removed.file_name,
                    "Upload session abandoned"
                );
                return Ok(removed);
            }
        }

        Err(UploadError::StorageError(format!(
            "upload {} is under too much contention",
            upload_id
        )))
    }

    // ========================================================================
    // Query Methods
    // ========================================================================

    /// Get a session by upload ID
    pub async fn get(&self, upload_id: &str) -> Result<UploadSession, UploadError> {
        self.store
            .get(upload_id)
            .await?
            .map(|v| v.value)
            .ok_or_else(|| UploadError::UnknownUpload(upload_id.to_string()))
    }

    /// Find a receiving session for the same content under any upload ID
    pub async fn find_by_content_hash(
        &self,
        content_hash: &str,
    ) -> Result<Option<UploadSession>, UploadError> {
        self.store.find_by_content_hash(content_hash).await
    }

    /// All in-flight sessions, oldest first
    pub async fn list(&self) -> Result<Vec<UploadSession>, UploadError> {
        self.store.list().await
    }

    /// Receiving or merging sessions untouched since `cutoff`
    pub async fn stale_sessions(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<UploadSession>, UploadError> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|s| {
                matches!(s.status, SessionStatus::Receiving | SessionStatus::Merging)
                    && s.updated_at < cutoff
            })
            .collect())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn require_merging(&self, upload_id: &str) -> Result<UploadSession, UploadError> {
        let session = self.get(upload_id).await?;
        if session.status != SessionStatus::Merging {
            return Err(UploadError::InvalidRequest(format!(
                "upload {} is not merging",
                upload_id
            )));
        }
        Ok(session)
    }

    /// Read-modify-write with compare-and-swap.
    ///
    /// `mutate` returns `Ok(false)` to leave the session untouched.
    async fn update<F>(&self, upload_id: &str, mut mutate: F) -> Result<UploadSession, UploadError>
    where
        F: FnMut(&mut UploadSession) -> Result<bool, UploadError> + Send,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Versioned { version, mut value } = self
                .store
                .get(upload_id)
                .await?
                .ok_or_else(|| UploadError::UnknownUpload(upload_id.to_string()))?;

            if !mutate(&mut value)? {
                return Ok(value);
            }
            value.updated_at = Utc::now();

            if let Some(stored) = self.store.compare_and_swap(version, value).await? {
                return Ok(stored.value);
            }

            tracing::trace!(upload_id = %upload_id, "Session changed concurrently, retrying");
        }

        Err(UploadError::StorageError(format!(
            "upload {} is under too much contention",
            upload_id
        )))
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry_with(chunks: usize) -> SessionRegistry {
        let registry = SessionRegistry::new();
        registry
            .get_or_create("up-1", "test.bin", "hash-a", chunks)
            .await
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let registry = SessionRegistry::new();

        let first = registry.get_or_create("up-1", "a.bin", "hash-a", 3).await.unwrap();
        registry.record_chunk("up-1", 1).await.unwrap();
        let again = registry.get_or_create("up-1", "a.bin", "hash-a", 3).await.unwrap();

        assert_eq!(first.status, SessionStatus::Receiving);
        assert_eq!(again.uploaded_chunks(), vec![1]);
    }

    #[tokio::test]
    async fn test_get_or_create_rejects_mismatch() {
        let registry = registry_with(3).await;

        let result = registry.get_or_create("up-1", "test.bin", "hash-a", 4).await;
        assert!(matches!(result, Err(UploadError::InconsistentSession { .. })));

        let result = registry.get_or_create("up-1", "test.bin", "hash-b", 3).await;
        assert!(matches!(result, Err(UploadError::InconsistentSession { .. })));

        // Original declaration untouched
        assert_eq!(registry.get("up-1").await.unwrap().chunk_count, 3);
    }

    #[tokio::test]
    async fn test_record_chunk() {
        let registry = registry_with(2).await;

        let updated = registry.record_chunk("up-1", 1).await.unwrap();
        assert_eq!(updated.uploaded_chunks(), vec![1]);

        // Retry of the same index
        let updated = registry.record_chunk("up-1", 1).await.unwrap();
        assert_eq!(updated.uploaded_chunks(), vec![1]);

        let result = registry.record_chunk("up-1", 2).await;
        assert!(matches!(
            result,
            Err(UploadError::ChunkIndexOutOfRange { index: 2, chunk_count: 2 })
        ));

        let result = registry.record_chunk("missing", 0).await;
        assert!(matches!(result, Err(UploadError::UnknownUpload(_))));
    }

    #[tokio::test]
    async fn test_concurrent_record_chunk() {
        let registry = registry_with(32).await;

        let handles: Vec<_> = (0..32usize)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.record_chunk("up-1", i).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let session = registry.get("up-1").await.unwrap();
        assert!(session.is_complete());
        assert_eq!(session.uploaded_chunks(), (0..32).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_begin_merge_requires_all_chunks() {
        let registry = registry_with(3).await;
        registry.record_chunk("up-1", 0).await.unwrap();

        let before = registry.get("up-1").await.unwrap();
        let result = registry.begin_merge("up-1").await;
        match result {
            Err(UploadError::IncompleteUpload { received, expected, missing }) => {
                assert_eq!(received, 1);
                assert_eq!(expected, 3);
                assert_eq!(missing, vec![1, 2]);
            }
            other => panic!("expected IncompleteUpload, got {:?}", other),
        }

        // Session unchanged
        assert_eq!(registry.get("up-1").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_begin_merge_is_exclusive() {
        let registry = registry_with(1).await;
        registry.record_chunk("up-1", 0).await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.begin_merge("up-1").await })
            })
            .collect();

        let mut winners = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(UploadError::MergeAlreadyInProgress(_)) => conflicts += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(conflicts, 7);
    }

    #[tokio::test]
    async fn test_chunk_retry_while_merging() {
        let registry = registry_with(1).await;
        registry.record_chunk("up-1", 0).await.unwrap();
        registry.begin_merge("up-1").await.unwrap();

        // Retrying a held index is still fine
        assert!(registry.record_chunk("up-1", 0).await.is_ok());
    }

    #[tokio::test]
    async fn test_complete_removes_session() {
        let registry = registry_with(1).await;
        registry.record_chunk("up-1", 0).await.unwrap();

        // Only a merging session can be completed
        assert!(registry.complete_or_fail("up-1", true, None).await.is_err());

        registry.begin_merge("up-1").await.unwrap();
        let done = registry.complete_or_fail("up-1", true, None).await.unwrap();

        assert_eq!(done.status, SessionStatus::Completed);
        assert!(matches!(
            registry.get("up-1").await,
            Err(UploadError::UnknownUpload(_))
        ));
    }

    #[tokio::test]
    async fn test_fail_discards_session() {
        let registry = registry_with(1).await;
        registry.record_chunk("up-1", 0).await.unwrap();
        registry.begin_merge("up-1").await.unwrap();

        let failed = registry
            .complete_or_fail("up-1", false, Some("hash mismatch"))
            .await
            .unwrap();

        assert_eq!(failed.status, SessionStatus::Failed);
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abort_merge_drops_indices() {
        let registry = registry_with(3).await;
        for i in 0..3 {
            registry.record_chunk("up-1", i).await.unwrap();
        }
        registry.begin_merge("up-1").await.unwrap();

        let session = registry.abort_merge("up-1", &[1]).await.unwrap();
        assert_eq!(session.status, SessionStatus::Receiving);
        assert_eq!(session.uploaded_chunks(), vec![0, 2]);
        assert_eq!(session.missing_chunks(), vec![1]);
    }

    #[tokio::test]
    async fn test_find_by_content_hash() {
        let registry = registry_with(2).await;

        let found = registry.find_by_content_hash("hash-a").await.unwrap();
        assert_eq!(found.unwrap().upload_id, "up-1");

        assert!(registry.find_by_content_hash("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_abandon() {
        let registry = registry_with(1).await;
        registry.abandon("up-1").await.unwrap();

        assert!(matches!(
            registry.abandon("up-1").await,
            Err(UploadError::UnknownUpload(_))
        ));
    }

    #[tokio::test]
    async fn test_abandon_refused_while_merging() {
        let registry = registry_with(1).await;
        registry.record_chunk("up-1", 0).await.unwrap();
        registry.begin_merge("up-1").await.unwrap();

        assert!(matches!(
            registry.abandon("up-1").await,
            Err(UploadError::MergeAlreadyInProgress(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_sessions() {
        let registry = registry_with(1).await;

        let future_cutoff = Utc::now() + chrono::Duration::hours(1);
        let past_cutoff = Utc::now() - chrono::Duration::hours(1);

        assert_eq!(registry.stale_sessions(future_cutoff).await.unwrap().len(), 1);
        assert!(registry.stale_sessions(past_cutoff).await.unwrap().is_empty());

        // A merge that never finished is stale too
        registry.record_chunk("up-1", 0).await.unwrap();
        registry.begin_merge("up-1").await.unwrap();
        let stale = registry.stale_sessions(future_cutoff).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].status, SessionStatus::Merging);
    }

    #[tokio::test]
    async fn test_recover_merges() {
        let registry = registry_with(2).await;
        registry.get_or_create("up-2", "b.bin", "hash-b", 1).await.unwrap();
        for i in 0..2 {
            registry.record_chunk("up-1", i).await.unwrap();
        }
        registry.begin_merge("up-1").await.unwrap();

        let recovered = registry.recover_merges().await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].upload_id, "up-1");

        let session = registry.get("up-1").await.unwrap();
        assert_eq!(session.status, SessionStatus::Receiving);
        assert_eq!(session.uploaded_chunks(), vec![0, 1]);

        // Nothing left to recover; merging works again
        assert!(registry.recover_merges().await.unwrap().is_empty());
        registry.begin_merge("up-1").await.unwrap();
    }
}
