//! File serving routes
//!
//! Serves published artifacts from the upload directory.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::Response,
    routing::get,
    Router,
};
use tokio_util::io::ReaderStream;

use crate::error::{AppError, Result};
use crate::state::AppState;

/// Create the files router
pub fn router() -> Router<AppState> {
    Router::new().route("/:name", get(serve_file))
}

/// Stream an artifact from disk
async fn serve_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response> {
    let not_found = || AppError::NotFound(format!("File not found: {}", name));

    let path = state
        .uploads()
        .artifacts()
        .artifact_path(&name)
        .ok_or_else(not_found)?;

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
        Err(e) => return Err(e.into()),
    };
    let metadata = file.metadata().await?;
    if !metadata.is_file() {
        return Err(not_found());
    }

    let content_type = mime_guess::from_path(&path).first_or_octet_stream();

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type.as_ref())
        .header(header::CONTENT_LENGTH, metadata.len())
        .header(
            header::CONTENT_DISPOSITION,
            format!("inline; filename=\"{}\"", name),
        )
        .header(header::CACHE_CONTROL, "public, max-age=86400")
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| AppError::Internal(e.to_string()))
}
