//! Upload Service
//!
//! The verify / upload-chunk / merge protocol composed from the registry,
//! chunk store, assembly engine and dedup index. HTTP handlers are thin
//! wrappers around these methods.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::UploadConfig;

use super::artifact::ArtifactStore;
use super::assembly::AssemblyEngine;
use super::chunk_store::ChunkStore;
use super::dedup::DedupIndex;
use super::digest::{compute_hash, normalize_digest, verify_hash};
use super::session::SessionRegistry;
use super::store::{DedupStore, MemoryDedupStore, MemorySessionStore, SessionStore};
use super::types::*;

/// How often the stale-session sweeper runs
const CLEANUP_INTERVAL_SECS: u64 = 300;

/// Entry point for every upload operation
#[derive(Clone)]
pub struct UploadService {
    config: Arc<UploadConfig>,
    registry: SessionRegistry,
    chunks: ChunkStore,
    artifacts: ArtifactStore,
    dedup: DedupIndex,
    engine: AssemblyEngine,
}

impl UploadService {
    /// Create a service with process-local stores
    pub fn new(config: UploadConfig) -> Self {
        Self::with_stores(
            config,
            Arc::new(MemorySessionStore::new()),
            Arc::new(MemoryDedupStore::new()),
        )
    }

    /// Create a service over the given session and dedup stores
    pub fn with_stores(
        config: UploadConfig,
        sessions: Arc<dyn SessionStore>,
        dedup: Arc<dyn DedupStore>,
    ) -> Self {
        let registry = SessionRegistry::with_store(sessions);
        let chunks = ChunkStore::with_local_storage(config.temp_path.clone());
        let artifacts = ArtifactStore::new(config.upload_path.clone());
        let dedup = DedupIndex::with_store(dedup, artifacts.clone());
        let engine = AssemblyEngine::new(
            registry.clone(),
            chunks.clone(),
            artifacts.clone(),
            dedup.clone(),
        );

        Self {
            config: Arc::new(config),
            registry,
            chunks,
            artifacts,
            dedup,
            engine,
        }
    }

    /// Create the upload and staging directories and roll back merges that
    /// were interrupted by a restart
    pub async fn init(&self) -> Result<(), UploadError> {
        self.artifacts.init().await?;
        tokio::fs::create_dir_all(&self.config.temp_path).await?;

        let recovered = self.registry.recover_merges().await?;
        if !recovered.is_empty() {
            tracing::warn!(
                count = recovered.len(),
                "Rolled back interrupted merges, those uploads are receiving again"
            );
        }

        tracing::info!(
            upload_path = %self.config.upload_path.display(),
            temp_path = %self.config.temp_path.display(),
            "Upload directories ready"
        );

        Ok(())
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Public URL of a published artifact
    pub fn url_for(&self, artifact_name: &str) -> String {
        format!(
            "{}{}/{}",
            self.config.base_url, self.config.file_server_path, artifact_name
        )
    }

    // ========================================================================
    // Protocol Operations
    // ========================================================================

    /// Check for instant transfer or a resumable upload
    pub async fn verify(&self, request: &VerifyRequest) -> Result<VerifyResponse, UploadError> {
        validate_upload_id(&request.upload_id)?;
        let content_hash = normalize_digest(&request.content_hash)?;
        self.check_file_size(request.file_size)?;

        if let Some(entry) = self.dedup.lookup(&content_hash, &request.file_name).await? {
            tracing::info!(
                upload_id = %request.upload_id,
                content_hash = %content_hash,
                "Instant transfer"
            );
            return Ok(VerifyResponse {
                success: true,
                upload_id: request.upload_id.clone(),
                exists: true,
                finish: true,
                uploaded_chunks: Vec::new(),
                url: Some(self.url_for(&entry.artifact_name)),
                message: "File already exists".to_string(),
            });
        }

        let own = match self.registry.get(&request.upload_id).await {
            Ok(session) => Some(session),
            Err(UploadError::UnknownUpload(_)) => None,
            Err(e) => return Err(e),
        };

        let resumable = match own {
            Some(session) if session.content_hash == content_hash => Some(session),
            Some(session) => {
                return Err(UploadError::InconsistentSession {
                    upload_id: request.upload_id.clone(),
                    detail: format!(
                        "content hash {} does not match declared {}",
                        content_hash, session.content_hash
                    ),
                });
            }
            None => self.registry.find_by_content_hash(&content_hash).await?,
        };

        match resumable {
            Some(session) => {
                tracing::debug!(
                    upload_id = %session.upload_id,
                    received = session.received_chunks.len(),
                    total = session.chunk_count,
                    "Resumable upload found"
                );
                Ok(VerifyResponse {
                    success: true,
                    upload_id: session.upload_id.clone(),
                    exists: false,
                    finish: false,
                    uploaded_chunks: session.uploaded_chunks(),
                    url: None,
                    message: format!(
                        "Upload in progress: {}/{} chunks received",
                        session.received_chunks.len(),
                        session.chunk_count
                    ),
                })
            }
            None => Ok(VerifyResponse {
                success: true,
                upload_id: request.upload_id.clone(),
                exists: false,
                finish: false,
                uploaded_chunks: Vec::new(),
                url: None,
                message: "Upload required".to_string(),
            }),
        }
    }

    /// Store one chunk and record it in its session
    pub async fn upload_chunk(
        &self,
        chunk: ChunkUpload,
    ) -> Result<ChunkUploadResponse, UploadError> {
        validate_upload_id(&chunk.upload_id)?;
        let content_hash = normalize_digest(&chunk.content_hash)?;
        validate_chunk_count(chunk.chunk_count)?;

        if chunk.chunk_index >= chunk.chunk_count {
            return Err(UploadError::ChunkIndexOutOfRange {
                index: chunk.chunk_index,
                chunk_count: chunk.chunk_count,
            });
        }

        let size = chunk.data.len() as u64;
        if self.config.max_chunk_size > 0 && size > self.config.max_chunk_size {
            return Err(UploadError::ChunkTooLarge {
                size,
                max: self.config.max_chunk_size,
            });
        }

        if let Some(expected) = chunk.chunk_hash.as_deref().map(str::trim).filter(|h| !h.is_empty()) {
            if !verify_hash(&chunk.data, expected) {
                let actual = compute_hash(&chunk.data);
                tracing::warn!(
                    upload_id = %chunk.upload_id,
                    chunk_index = chunk.chunk_index,
                    expected = %expected,
                    actual = %actual,
                    "Chunk hash mismatch"
                );
                return Err(UploadError::ChunkHashMismatch {
                    expected: expected.to_ascii_lowercase(),
                    actual,
                });
            }
        }

        let session = self
            .registry
            .get_or_create(&chunk.upload_id, &chunk.file_name, &content_hash, chunk.chunk_count)
            .await?;

        if session.status == SessionStatus::Merging {
            return Err(UploadError::MergeAlreadyInProgress(chunk.upload_id));
        }

        // Held chunks are never rewritten
        let updated = if session.received_chunks.contains(&chunk.chunk_index) {
            tracing::debug!(
                upload_id = %chunk.upload_id,
                chunk_index = chunk.chunk_index,
                "Chunk already held, skipping write"
            );
            session
        } else {
            self.store_and_record(&chunk).await?
        };

        tracing::debug!(
            upload_id = %chunk.upload_id,
            chunk_index = chunk.chunk_index,
            chunks_received = updated.received_chunks.len(),
            total_chunks = updated.chunk_count,
            progress = format!("{:.1}%", updated.progress()),
            "Chunk uploaded"
        );

        Ok(ChunkUploadResponse {
            success: true,
            upload_id: chunk.upload_id,
            chunk_index: chunk.chunk_index,
            uploaded_chunks: updated.uploaded_chunks(),
            message: if updated.is_complete() {
                "All chunks received".to_string()
            } else {
                format!(
                    "Chunk {} stored ({}/{})",
                    chunk.chunk_index,
                    updated.received_chunks.len(),
                    updated.chunk_count
                )
            },
        })
    }

    /// Write a chunk and record it. When the session is gone or merging by
    /// the time the chunk lands, the file just written is removed again.
    async fn store_and_record(&self, chunk: &ChunkUpload) -> Result<UploadSession, UploadError> {
        self.chunks
            .store_chunk(&chunk.upload_id, chunk.chunk_index, &chunk.data)
            .await?;

        match self.registry.record_chunk(&chunk.upload_id, chunk.chunk_index).await {
            Ok(updated) => Ok(updated),
            Err(e @ (UploadError::UnknownUpload(_) | UploadError::MergeAlreadyInProgress(_))) => {
                if let Err(remove_err) = self
                    .chunks
                    .remove_chunk(&chunk.upload_id, chunk.chunk_index)
                    .await
                {
                    tracing::warn!(
                        upload_id = %chunk.upload_id,
                        chunk_index = chunk.chunk_index,
                        error = %remove_err,
                        "Failed to remove unrecorded chunk"
                    );
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Assemble and publish an upload.
    ///
    /// Merging an ID that has no session but whose content is already
    /// published returns the existing artifact.
    pub async fn merge(&self, request: &MergeRequest) -> Result<MergeResponse, UploadError> {
        validate_upload_id(&request.upload_id)?;
        let content_hash = normalize_digest(&request.content_hash)?;
        validate_chunk_count(request.chunk_count)?;
        self.check_file_size(request.file_size)?;

        let session = match self.registry.get(&request.upload_id).await {
            Ok(session) => session,
            Err(UploadError::UnknownUpload(upload_id)) => {
                return match self.dedup.lookup(&content_hash, &request.file_name).await? {
                    Some(entry) => Ok(MergeResponse {
                        success: true,
                        upload_id,
                        url: self.url_for(&entry.artifact_name),
                        message: "File already exists".to_string(),
                    }),
                    None => Err(UploadError::UnknownUpload(upload_id)),
                };
            }
            Err(e) => return Err(e),
        };

        if session.content_hash != content_hash || session.chunk_count != request.chunk_count {
            return Err(UploadError::InconsistentSession {
                upload_id: request.upload_id.clone(),
                detail: format!(
                    "merge declares {} chunks of {}, session has {} chunks of {}",
                    request.chunk_count, content_hash, session.chunk_count, session.content_hash
                ),
            });
        }

        let outcome = self.engine.merge(&request.upload_id).await?;

        Ok(MergeResponse {
            success: true,
            upload_id: request.upload_id.clone(),
            url: self.url_for(&outcome.artifact_name),
            message: "File merged successfully".to_string(),
        })
    }

    // ========================================================================
    // Session Management
    // ========================================================================

    pub async fn status(&self, upload_id: &str) -> Result<SessionStatusResponse, UploadError> {
        let session = self.registry.get(upload_id).await?;
        Ok(SessionStatusResponse::from(&session))
    }

    pub async fn list(&self) -> Result<Vec<SessionStatusResponse>, UploadError> {
        let sessions = self.registry.list().await?;
        Ok(sessions.iter().map(SessionStatusResponse::from).collect())
    }

    /// Drop an upload and its staged chunks
    pub async fn abandon(&self, upload_id: &str) -> Result<(), UploadError> {
        self.registry.abandon(upload_id).await?;
        self.chunks.purge(upload_id).await?;
        Ok(())
    }

    /// Run [`cleanup_older_than`](Self::cleanup_older_than) with the
    /// configured TTL. A TTL of zero disables cleanup.
    pub async fn cleanup_stale(&self) -> Result<usize, UploadError> {
        if self.config.session_ttl_hours == 0 {
            return Ok(0);
        }

        let ttl = chrono::Duration::hours(self.config.session_ttl_hours as i64);
        self.cleanup_older_than(Utc::now() - ttl).await
    }

    /// Reclaim everything idle since `cutoff`.
    ///
    /// Stale merges are rolled back to `Receiving`. Stale receiving sessions
    /// are abandoned and their chunks purged. Chunk directories with no
    /// session are deleted. Returns how many sessions were abandoned.
    pub async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, UploadError> {
        let stale = self.registry.stale_sessions(cutoff).await?;

        let mut abandoned = Vec::new();
        for session in stale {
            if session.status == SessionStatus::Merging {
                match self.registry.abort_merge(&session.upload_id, &[]).await {
                    Ok(_) => {}
                    // Finished or rolled back since the scan
                    Err(UploadError::UnknownUpload(_)) | Err(UploadError::InvalidRequest(_)) => {}
                    Err(e) => return Err(e),
                }
                continue;
            }

            match self.registry.abandon(&session.upload_id).await {
                Ok(_) => abandoned.push(session.upload_id),
                // Picked up by a merge or removed since the scan
                Err(UploadError::MergeAlreadyInProgress(_)) | Err(UploadError::UnknownUpload(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let purges = abandoned.iter().map(|upload_id| self.chunks.purge(upload_id));
        for (upload_id, result) in abandoned.iter().zip(futures::future::join_all(purges).await) {
            if let Err(e) = result {
                tracing::warn!(upload_id = %upload_id, error = %e, "Failed to purge stale chunks");
            }
        }

        if !abandoned.is_empty() {
            tracing::info!(count = abandoned.len(), "Cleaned up stale upload sessions");
        }

        self.sweep_orphaned_chunks(cutoff).await?;

        Ok(abandoned.len())
    }

    /// Delete idle chunk directories that no session owns
    async fn sweep_orphaned_chunks(&self, cutoff: DateTime<Utc>) -> Result<(), UploadError> {
        for upload_id in self.chunks.staged_uploads(cutoff).await? {
            match self.registry.get(&upload_id).await {
                Err(UploadError::UnknownUpload(_)) => {}
                Ok(_) => continue,
                Err(e) => return Err(e),
            }

            match self.chunks.purge(&upload_id).await {
                Ok(count) => {
                    tracing::info!(upload_id = %upload_id, chunks = count, "Removed orphaned chunks");
                }
                Err(e) => {
                    tracing::warn!(upload_id = %upload_id, error = %e, "Failed to remove orphaned chunks");
                }
            }
        }
        Ok(())
    }

    /// Start background cleanup task
    pub fn start_cleanup_task(&self) -> tokio::task::JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(CLEANUP_INTERVAL_SECS));

            loop {
                interval.tick().await;
                if let Err(e) = service.cleanup_stale().await {
                    tracing::warn!(error = %e, "Stale session cleanup failed");
                }
            }
        })
    }

    fn check_file_size(&self, file_size: Option<u64>) -> Result<(), UploadError> {
        let max = self.config.max_file_size;
        match file_size {
            Some(size) if max > 0 && size > max => Err(UploadError::FileTooLarge { size, max }),
            _ => Ok(()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
