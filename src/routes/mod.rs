//! Route modules for the upload server

pub mod files;
pub mod health;
pub mod upload;

use axum::{extract::DefaultBodyLimit, routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the application router
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let body_limit = state.config().upload.body_limit();
    let files_path = state.config().upload.file_server_path.clone();

    Router::new()
        .route("/health", get(health::health_check))
        .nest(
            "/api/upload",
            upload::router().layer(DefaultBodyLimit::max(body_limit)),
        )
        .nest(&files_path, files::router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
