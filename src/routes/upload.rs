//! Upload Routes
//!
//! HTTP endpoints for the verify / upload / merge protocol.
//!
//! Endpoints:
//! - POST /api/upload/verify - Check for instant transfer or resumable chunks
//! - POST /api/upload/upload - Upload one chunk (multipart)
//! - POST /api/upload/merge - Assemble, verify and publish the file
//! - GET /api/upload/status/:file_id - Get upload progress
//! - GET /api/upload/list - List uploads in progress
//! - DELETE /api/upload/:file_id - Abandon an upload
//! - GET /api/upload/health - Service health and limits

use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};

use crate::error::ErrorResponse;
use crate::state::AppState;
use crate::upload::{
    ChunkUpload, ChunkUploadResponse, ErrorKind, MergeRequest, MergeResponse,
    SessionStatusResponse, UploadError, VerifyRequest, VerifyResponse,
};

use super::health::health_check;

// ============================================================================
// Error Response
// ============================================================================

impl IntoResponse for UploadError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();

        match self.kind() {
            ErrorKind::Integrity | ErrorKind::Storage => {
                tracing::error!(code = self.code(), error = %self, "Upload request failed");
            }
            ErrorKind::Client | ErrorKind::Conflict => {
                tracing::warn!(code = self.code(), error = %self, "Upload request rejected");
            }
        }

        let body = Json(ErrorResponse::new(self.to_string(), self.code()));

        (status, body).into_response()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create the upload router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/verify", post(verify))
        .route("/upload", post(upload_chunk))
        .route("/merge", post(merge))
        .route("/status/:file_id", get(get_status))
        .route("/list", get(list_uploads))
        .route("/health", get(health_check))
        .route("/:file_id", delete(abandon_upload))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/upload/verify
async fn verify(
    State(state): State<AppState>,
    Json(request): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>, UploadError> {
    let response = state.uploads().verify(&request).await?;
    Ok(Json(response))
}

/// POST /api/upload/upload
///
/// Multipart form with the chunk bytes in `chunk` and the fields `fileId`,
/// `fileName`, `chunkIndex`, `chunkTotal`, `fileHash` and optionally
/// `chunkHash`.
async fn upload_chunk(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ChunkUploadResponse>, UploadError> {
    let chunk = parse_chunk_upload(multipart).await?;
    let response = state.uploads().upload_chunk(chunk).await?;
    Ok(Json(response))
}

/// POST /api/upload/merge
async fn merge(
    State(state): State<AppState>,
    Json(request): Json<MergeRequest>,
) -> Result<Json<MergeResponse>, UploadError> {
    tracing::info!(
        upload_id = %request.upload_id,
        file_name = %request.file_name,
        chunks = request.chunk_count,
        "Merge requested"
    );

    let response = state.uploads().merge(&request).await?;
    Ok(Json(response))
}

/// GET /api/upload/status/:file_id
async fn get_status(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
) -> Result<Json<SessionStatusResponse>, UploadError> {
    let status = state.uploads().status(&file_id).await?;
    Ok(Json(status))
}

/// GET /api/upload/list
async fn list_uploads(
    State(state): State<AppState>,
) -> Result<Json<Vec<SessionStatusResponse>>, UploadError> {
    let sessions = state.uploads().list().await?;
    Ok(Json(sessions))
}

/// DELETE /api/upload/:file_id
async fn abandon_upload(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
) -> Result<StatusCode, UploadError> {
    state.uploads().abandon(&file_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Helpers
// ============================================================================

/// Collect the multipart fields of a chunk upload
async fn parse_chunk_upload(mut multipart: Multipart) -> Result<ChunkUpload, UploadError> {
    let mut upload_id = None;
    let mut file_name = None;
    let mut chunk_index = None;
    let mut chunk_count = None;
    let mut content_hash = None;
    let mut chunk_hash = None;
    let mut data = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "chunk" | "file" => data = Some(field.bytes().await.map_err(multipart_error)?),
            "fileId" | "uploadId" => upload_id = Some(field.text().await.map_err(multipart_error)?),
            "fileName" => file_name = Some(field.text().await.map_err(multipart_error)?),
            "chunkIndex" => chunk_index = Some(field.text().await.map_err(multipart_error)?),
            "chunkTotal" | "chunkCount" => {
                chunk_count = Some(field.text().await.map_err(multipart_error)?)
            }
            "fileHash" | "contentHash" => {
                content_hash = Some(field.text().await.map_err(multipart_error)?)
            }
            "chunkHash" => chunk_hash = Some(field.text().await.map_err(multipart_error)?),
            other => tracing::debug!(field = %other, "Ignoring unknown multipart field"),
        }
    }

    Ok(ChunkUpload {
        upload_id: required("fileId", upload_id)?,
        file_name: file_name.unwrap_or_default(),
        chunk_index: parse_number("chunkIndex", required("chunkIndex", chunk_index)?)?,
        chunk_count: parse_number("chunkTotal", required("chunkTotal", chunk_count)?)?,
        content_hash: required("fileHash", content_hash)?,
        chunk_hash,
        data: required("chunk", data)?,
    })
}

fn required<T>(field: &str, value: Option<T>) -> Result<T, UploadError> {
    value.ok_or_else(|| UploadError::InvalidRequest(format!("missing field {}", field)))
}

fn parse_number(field: &str, value: String) -> Result<usize, UploadError> {
    value
        .trim()
        .parse()
        .map_err(|_| UploadError::InvalidRequest(format!("{} is not a number: {:?}", field, value)))
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> UploadError {
    UploadError::InvalidRequest(format!("malformed multipart body: {}", err))
}
