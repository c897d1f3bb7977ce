//! API routes.

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{health, index, predict, serve_file};
use crate::state::AppState;

/// Create the router.
pub fn create_router(state: AppState) -> Router {
    let max_upload = state.config.max_upload_bytes;

    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/api/predict", post(predict))
        .route("/files/:name", get(serve_file))
        // Multipart has its own 2MB default; the tower layer enforces the real cap.
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
