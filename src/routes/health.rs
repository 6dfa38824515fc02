//! Health check route

use axum::{extract::State, Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    chunk_size: usize,
    concurrent: usize,
    max_file_size: u64,
    max_chunk_size: u64,
}

/// GET /health and GET /api/upload/health
///
/// Also advertises the chunking parameters clients should use.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let upload = &state.config().upload;

    Json(HealthResponse {
        status: "healthy",
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        chunk_size: upload.chunk_size,
        concurrent: upload.concurrent,
        max_file_size: upload.max_file_size,
        max_chunk_size: upload.max_chunk_size,
    })
}
