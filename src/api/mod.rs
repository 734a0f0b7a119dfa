//! API module
//!
//! HTTP API endpoints and middleware.

pub mod middleware;
pub mod routes;

use axum::http::HeaderName;
use axum::{middleware as axum_middleware, routing::get, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::store::TransactionStore;

pub use routes::create_router;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub transactions: Arc<dyn TransactionStore>,
}

impl AppState {
    pub fn new(transactions: Arc<dyn TransactionStore>) -> Self {
        Self { transactions }
    }
}

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    let api_routes =
        create_router().layer(axum_middleware::from_fn(middleware::logging_middleware));

    let request_id = HeaderName::from_static(middleware::REQUEST_ID_HEADER);

    // Layers run bottom-up: the id is set before tracing and logging see the request
    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api_routes)
        .layer(PropagateRequestIdLayer::new(request_id.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(request_id, MakeRequestUuid))
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> Json<Value> {
    Json(json!({ "ok": true }))
}
