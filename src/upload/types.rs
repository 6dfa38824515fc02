//! Upload types for the verify / upload-chunk / merge protocol

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Default advertised chunk size: 2MB
pub const DEFAULT_CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Maximum length of a client-chosen upload ID
pub const MAX_UPLOAD_ID_LEN: usize = 128;

/// Default age after which a receiving session is swept: 24 hours
pub const SESSION_TTL_HOURS: i64 = 24;

// ============================================================================
// Verify Types
// ============================================================================

/// Request to check whether a file can be instantly transferred or resumed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    /// Client-chosen upload ID
    #[serde(rename = "fileId", alias = "uploadId")]
    pub upload_id: String,

    /// Original file name
    pub file_name: String,

    /// SHA-256 of the complete file
    #[serde(rename = "fileHash", alias = "contentHash")]
    pub content_hash: String,

    /// Total file size in bytes, if known
    #[serde(default)]
    pub file_size: Option<u64>,
}

/// Result of a verify call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub success: bool,

    /// Upload ID the client must continue with (may differ from the request)
    #[serde(rename = "fileId")]
    pub upload_id: String,

    /// Whether the complete file already exists
    pub exists: bool,

    /// Whether the upload is finished (no chunks need to be sent)
    pub finish: bool,

    /// Chunk indices the server already holds
    pub uploaded_chunks: Vec<usize>,

    /// Artifact URL when the file already exists
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    pub message: String,
}

// ============================================================================
// Chunk Upload Types
// ============================================================================

/// A single chunk upload, as parsed from the multipart request
#[derive(Debug, Clone)]
pub struct ChunkUpload {
    pub upload_id: String,
    pub file_name: String,
    pub chunk_index: usize,
    pub chunk_count: usize,
    pub content_hash: String,
    /// Optional SHA-256 of this chunk; verified before anything is stored
    pub chunk_hash: Option<String>,
    pub data: axum::body::Bytes,
}

/// Response after uploading a chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResponse {
    pub success: bool,

    #[serde(rename = "fileId")]
    pub upload_id: String,

    /// Chunk index that was stored
    pub chunk_index: usize,

    /// All chunk indices received so far
    pub uploaded_chunks: Vec<usize>,

    pub message: String,
}

// ============================================================================
// Merge Types
// ============================================================================

/// Request to assemble a fully uploaded file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    #[serde(rename = "fileId", alias = "uploadId")]
    pub upload_id: String,

    pub file_name: String,

    #[serde(rename = "fileHash", alias = "contentHash")]
    pub content_hash: String,

    #[serde(rename = "chunkTotal", alias = "chunkCount")]
    pub chunk_count: usize,

    #[serde(default)]
    pub file_size: Option<u64>,
}

/// Response after a successful merge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResponse {
    pub success: bool,

    #[serde(rename = "fileId")]
    pub upload_id: String,

    /// URL of the published artifact
    pub url: String,

    pub message: String,
}

// ============================================================================
// Status Types
// ============================================================================

/// Progress report for a single in-flight upload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusResponse {
    #[serde(rename = "fileId")]
    pub upload_id: String,
    pub file_name: String,
    #[serde(rename = "fileHash")]
    pub content_hash: String,
    #[serde(rename = "chunkTotal")]
    pub chunk_count: usize,
    pub uploaded_chunks: Vec<usize>,
    pub progress: f64,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&UploadSession> for SessionStatusResponse {
    fn from(session: &UploadSession) -> Self {
        Self {
            upload_id: session.upload_id.clone(),
            file_name: session.file_name.clone(),
            content_hash: session.content_hash.clone(),
            chunk_count: session.chunk_count,
            uploaded_chunks: session.uploaded_chunks(),
            progress: session.progress(),
            status: session.status,
            created_at: session.created_at,
            updated_at: session.updated_at,
        }
    }
}

// ============================================================================
// Session Types
// ============================================================================

/// Upload session state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSession {
    /// Client-chosen upload ID
    pub upload_id: String,

    /// Original file name (only its extension is used)
    pub file_name: String,

    /// Claimed SHA-256 of the complete file
    pub content_hash: String,

    /// Total chunks expected, fixed at creation
    pub chunk_count: usize,

    /// Indices of chunks that have been stored
    pub received_chunks: BTreeSet<usize>,

    /// Current status
    pub status: SessionStatus,

    /// Session creation time
    pub created_at: DateTime<Utc>,

    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

impl UploadSession {
    /// Create a new receiving session
    pub fn new(
        upload_id: impl Into<String>,
        file_name: impl Into<String>,
        content_hash: impl Into<String>,
        chunk_count: usize,
    ) -> Self {
        let now = Utc::now();
        Self {
            upload_id: upload_id.into(),
            file_name: file_name.into(),
            content_hash: content_hash.into(),
            chunk_count,
            received_chunks: BTreeSet::new(),
            status: SessionStatus::Receiving,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if all chunks have been received
    pub fn is_complete(&self) -> bool {
        self.received_chunks.len() == self.chunk_count
    }

    /// Received indices in ascending order
    pub fn uploaded_chunks(&self) -> Vec<usize> {
        self.received_chunks.iter().copied().collect()
    }

    /// Get indices of chunks that still need to be uploaded
    pub fn missing_chunks(&self) -> Vec<usize> {
        (0..self.chunk_count)
            .filter(|i| !self.received_chunks.contains(i))
            .collect()
    }

    /// Calculate progress percentage
    pub fn progress(&self) -> f64 {
        if self.chunk_count == 0 {
            return 100.0;
        }
        (self.received_chunks.len() as f64 / self.chunk_count as f64) * 100.0
    }

    /// Extension of the original file name, including the dot
    pub fn extension(&self) -> String {
        file_extension(&self.file_name)
    }
}

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Accepting chunks
    Receiving,
    /// Assembly in progress; no further chunks accepted
    Merging,
    /// Artifact published
    Completed,
    /// Assembly failed verification
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Receiving => "receiving",
            Self::Merging => "merging",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "receiving" => Some(Self::Receiving),
            "merging" => Some(Self::Merging),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A stored value with its compare-and-swap version
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

// ============================================================================
// Deduplication Types
// ============================================================================

/// Maps a verified content hash to its published artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupEntry {
    /// SHA-256 of the artifact
    pub content_hash: String,

    /// File name of the artifact inside the upload directory
    pub artifact_name: String,

    /// Artifact size in bytes
    pub size: u64,

    /// When the artifact was published
    pub created_at: DateTime<Utc>,
}

/// Result of a successful merge
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// Final session snapshot (status `Completed`)
    pub session: UploadSession,

    /// Artifact name inside the upload directory
    pub artifact_name: String,

    /// Verified digest of the artifact
    pub content_hash: String,

    /// Artifact size in bytes
    pub size: u64,
}

// ============================================================================
// Error Types
// ============================================================================

/// Broad error classes surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller must fix the request (or re-upload) before retrying
    Client,
    /// Another merge holds the session; retry later
    Conflict,
    /// Assembled bytes did not match the claimed hash
    Integrity,
    /// Server-side I/O or persistence failure
    Storage,
}

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Upload not found: {0}")]
    UnknownUpload(String),

    #[error("Chunk index out of range: {index} (chunk count: {chunk_count})")]
    ChunkIndexOutOfRange { index: usize, chunk_count: usize },

    #[error("Inconsistent session {upload_id}: {detail}")]
    InconsistentSession { upload_id: String, detail: String },

    #[error("Upload incomplete: {received}/{expected} chunks, missing {missing:?}")]
    IncompleteUpload {
        received: usize,
        expected: usize,
        missing: Vec<usize>,
    },

    #[error("Chunk hash mismatch: expected {expected}, got {actual}")]
    ChunkHashMismatch { expected: String, actual: String },

    #[error("File too large: {size} bytes (max: {max})")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Chunk too large: {size} bytes (max: {max})")]
    ChunkTooLarge { size: u64, max: u64 },

    #[error("Merge already in progress: {0}")]
    MergeAlreadyInProgress(String),

    #[error("File hash mismatch: expected {expected}, got {actual}")]
    IntegrityError { expected: String, actual: String },

    #[error("Chunk missing from storage: {0}")]
    MissingChunk(usize),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl UploadError {
    /// Error class of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest(_)
            | Self::UnknownUpload(_)
            | Self::ChunkIndexOutOfRange { .. }
            | Self::InconsistentSession { .. }
            | Self::IncompleteUpload { .. }
            | Self::ChunkHashMismatch { .. }
            | Self::FileTooLarge { .. }
            | Self::ChunkTooLarge { .. } => ErrorKind::Client,
            Self::MergeAlreadyInProgress(_) => ErrorKind::Conflict,
            Self::IntegrityError { .. } => ErrorKind::Integrity,
            Self::MissingChunk(_) | Self::StorageError(_) | Self::DatabaseError(_) => {
                ErrorKind::Storage
            }
        }
    }

    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::UnknownUpload(_) => StatusCode::NOT_FOUND,
            Self::FileTooLarge { .. } | Self::ChunkTooLarge { .. } => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            Self::MergeAlreadyInProgress(_) => StatusCode::CONFLICT,
            _ => match self.kind() {
                ErrorKind::Client => StatusCode::BAD_REQUEST,
                ErrorKind::Conflict => StatusCode::CONFLICT,
                ErrorKind::Integrity | ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::UnknownUpload(_) => "UPLOAD_NOT_FOUND",
            Self::ChunkIndexOutOfRange { .. } => "CHUNK_INDEX_OUT_OF_RANGE",
            Self::InconsistentSession { .. } => "INCONSISTENT_SESSION",
            Self::IncompleteUpload { .. } => "INCOMPLETE_UPLOAD",
            Self::ChunkHashMismatch { .. } => "CHUNK_HASH_MISMATCH",
            Self::FileTooLarge { .. } => "FILE_TOO_LARGE",
            Self::ChunkTooLarge { .. } => "CHUNK_TOO_LARGE",
            Self::MergeAlreadyInProgress(_) => "MERGE_IN_PROGRESS",
            Self::IntegrityError { .. } => "INTEGRITY_ERROR",
            Self::MissingChunk(_) => "MISSING_CHUNK",
            Self::StorageError(_) => "STORAGE_ERROR",
            Self::DatabaseError(_) => "DATABASE_ERROR",
        }
    }
}

impl From<std::io::Error> for UploadError {
    fn from(err: std::io::Error) -> Self {
        UploadError::StorageError(err.to_string())
    }
}

impl From<sqlx::Error> for UploadError {
    fn from(err: sqlx::Error) -> Self {
        UploadError::DatabaseError(err.to_string())
    }
}

// ============================================================================
// Validation Helpers
// ============================================================================

/// Validate a client-chosen upload ID.
///
/// Upload IDs name a staging directory, so only `[A-Za-z0-9._-]` is allowed.
pub fn validate_upload_id(upload_id: &str) -> Result<(), UploadError> {
    let valid = !upload_id.is_empty()
        && upload_id.len() <= MAX_UPLOAD_ID_LEN
        && upload_id != "."
        && upload_id != ".."
        && upload_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));

    if valid {
        Ok(())
    } else {
        Err(UploadError::InvalidRequest(format!(
            "invalid upload id: {:?}",
            upload_id
        )))
    }
}

/// Validate a declared chunk count
pub fn validate_chunk_count(chunk_count: usize) -> Result<(), UploadError> {
    if chunk_count == 0 {
        return Err(UploadError::InvalidRequest(
            "chunk count must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// Extension of a file name including the leading dot, or an empty string.
///
/// Only short alphanumeric extensions are kept since the result becomes part
/// of the artifact's file name.
pub fn file_extension(file_name: &str) -> String {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    match base.rfind('.') {
        Some(pos) if pos > 0 => {
            let ext = &base[pos + 1..];
            if !ext.is_empty() && ext.len() <= 16 && ext.chars().all(|c| c.is_ascii_alphanumeric()) {
                format!(".{}", ext.to_ascii_lowercase())
            } else {
                String::new()
            }
        }
        _ => String::new(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_chunks_and_progress() {
        let mut session = UploadSession::new("up-1", "movie.mp4", "h", 4);
        session.received_chunks.insert(0);
        session.received_chunks.insert(2);

        assert_eq!(session.missing_chunks(), vec![1, 3]);
        assert!((session.progress() - 50.0).abs() < f64::EPSILON);
        assert!(!session.is_complete());
    }

    #[test]
    fn test_validate_upload_id() {
        assert!(validate_upload_id("file-123_abc.v2").is_ok());
        assert!(validate_upload_id("").is_err());
        assert!(validate_upload_id("..").is_err());
        assert!(validate_upload_id("../etc").is_err());
        assert!(validate_upload_id("a/b").is_err());
        assert!(validate_upload_id(&"x".repeat(MAX_UPLOAD_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_file_extension() {
        assert_eq!(file_extension("archive.tar.GZ"), ".gz");
        assert_eq!(file_extension("README"), "");
        assert_eq!(file_extension(".bashrc"), "");
        assert_eq!(file_extension("dir.d/noext"), "");
        assert_eq!(file_extension("weird.e/x"), "");
        assert_eq!(file_extension("evil.p h p"), "");
    }

    #[test]
    fn test_error_kinds_and_status() {
        use axum::http::StatusCode;

        let err = UploadError::UnknownUpload("x".into());
        assert_eq!(err.kind(), ErrorKind::Client);
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let err = UploadError::MergeAlreadyInProgress("x".into());
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.status_code(), StatusCode::CONFLICT);

        let err = UploadError::IntegrityError {
            expected: "a".into(),
            actual: "b".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        let err = UploadError::ChunkHashMismatch {
            expected: "a".into(),
            actual: "b".into(),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_status_round_trip_names() {
        for status in [
            SessionStatus::Receiving,
            SessionStatus::Merging,
            SessionStatus::Completed,
            SessionStatus::Failed,
        ] {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
    }
}
