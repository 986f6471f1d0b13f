//! Route modules for the TUS server

pub mod health;
pub mod upload;

use axum::{extract::DefaultBodyLimit, routing::get, Router};

use crate::state::AppState;

/// Build the application router
pub fn app(state: AppState) -> Router {
    let api_path = state.config().tus.api_path.clone();
    let body_limit = state.config().tus.max_chunk_size;

    Router::new()
        .route("/health", get(health::health_check))
        .merge(upload::router(&api_path))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
