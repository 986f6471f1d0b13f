//! Upload Routes
//!
//! HTTP binding of the TUS engine. Every verb on the collection and on any
//! upload below it goes to the same handler; verb dispatch and rejection of
//! unsupported verbs happen in the engine.
//!
//! Endpoints (default API path):
//! - POST /files/ or /files/:name - Create an upload
//! - HEAD /files/:name - Query the upload offset
//! - PATCH /files/:name - Append a chunk
//! - DELETE /files/:name - Terminate an upload
//! - OPTIONS /files/ - Server capabilities

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, Uri},
    routing::any,
    Router,
};

use crate::protocol::{TusRequest, TusResponse};
use crate::state::AppState;

/// Create the upload router mounted at `api_path`
pub fn router(api_path: &str) -> Router<AppState> {
    let base = api_path.trim_end_matches('/');

    let mut router = Router::new();
    if !base.is_empty() {
        router = router.route(base, any(handle));
    }
    router
        .route(&format!("{}/", base), any(handle))
        .route(&format!("{}/*name", base), any(handle))
}

async fn handle(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> TusResponse {
    state
        .tus()
        .handle(TusRequest {
            method,
            uri,
            headers,
            body,
        })
        .await
}
