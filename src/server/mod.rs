mod handlers;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::cluster::Cluster;
use crate::config::{BuildInfo, Config};
use crate::engine::Engine;
use crate::error::DbError;
use crate::executor::Executor;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub cluster: Arc<Cluster>,
    pub executor: Arc<Executor>,
    pub config: Arc<Config>,
    pub build: Arc<BuildInfo>,
}

impl IntoResponse for DbError {
    fn into_response(self) -> Response {
        let status = match &self {
            DbError::IndexNotFound(_) | DbError::FieldNotFound(_) | DbError::ViewNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            DbError::IndexAlreadyExists(_) | DbError::FieldAlreadyExists(_) => StatusCode::CONFLICT,
            DbError::InvalidName(_)
            | DbError::InvalidQuery(_)
            | DbError::InvalidPosition(_)
            | DbError::InvalidCacheType(_)
            | DbError::InvalidTimeQuantum(_) => StatusCode::BAD_REQUEST,
            DbError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            DbError::Cancelled | DbError::Timeout => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Query RPC (client-facing and in-cluster).
        .route("/index/:index/query", post(handlers::post_query))
        // Schema lifecycle.
        .route("/index/:index", post(handlers::create_index))
        .route("/index/:index", delete(handlers::delete_index))
        .route("/index/:index/field/:field", post(handlers::create_field))
        .route("/index/:index/field/:field", delete(handlers::delete_field))
        .route("/schema", get(handlers::get_schema))
        // Bulk load.
        .route("/index/:index/field/:field/import", post(handlers::post_import))
        // Node and cluster introspection.
        .route("/status", get(handlers::get_status))
        .route("/version", get(handlers::get_version))
        // In-cluster internals.
        .route("/internal/message", post(handlers::post_message))
        .route("/internal/fragment/blocks", get(handlers::get_fragment_blocks))
        .route("/internal/fragment/block-pairs", post(handlers::post_block_pairs))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
