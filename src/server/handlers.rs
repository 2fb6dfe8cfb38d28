use std::time::Duration;

use axum::extract::{Path, Query as UrlQuery, State};
use axum::response::Json;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::AppState;
use crate::antientropy::{BlockPairsRequest, BlockPairsResponse, BlocksResponse};
use crate::broadcast::ClusterMessage;
use crate::error::{DbError, DbResult};
use crate::executor::{ImportRequest, QueryRequest, QueryResponse};
use crate::field::FieldOptions;
use crate::index::IndexOptions;
use crate::pql;

/// The Query RPC. Parses the PQL body, executes it under the configured
/// deadline, and returns one result per call.
pub async fn post_query(
    State(state): State<AppState>,
    Path(index): Path<String>,
    Json(req): Json<QueryRequest>,
) -> DbResult<Json<QueryResponse>> {
    let query = pql::parse(&req.query)?;
    let ctx = CancellationToken::new();
    let deadline = Duration::from_secs(state.config.query_timeout_secs.max(1));

    let run = state
        .executor
        .execute(&index, &query, req.slices.clone(), req.remote, &ctx);
    let results = match tokio::time::timeout(deadline, run).await {
        Ok(results) => results?,
        Err(_) => {
            ctx.cancel();
            return Err(DbError::Timeout);
        }
    };
    Ok(Json(QueryResponse { results }))
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateIndexBody {
    #[serde(default)]
    pub options: IndexOptions,
}

pub async fn create_index(
    State(state): State<AppState>,
    Path(index): Path<String>,
    body: Option<Json<CreateIndexBody>>,
) -> DbResult<Json<serde_json::Value>> {
    let options = body.map(|Json(b)| b.options).unwrap_or_default();
    state.engine.create_index(&index, &options)?;

    let msg = ClusterMessage::CreateIndex {
        index,
        options,
    };
    crate::broadcast::broadcast(
        state.executor.broadcaster(),
        &state.cluster.nodes,
        state.executor.host(),
        &msg,
    )
    .await;
    Ok(Json(serde_json::json!({})))
}

pub async fn delete_index(
    State(state): State<AppState>,
    Path(index): Path<String>,
) -> DbResult<Json<serde_json::Value>> {
    state.engine.delete_index(&index)?;
    let msg = ClusterMessage::DeleteIndex { index };
    crate::broadcast::broadcast(
        state.executor.broadcaster(),
        &state.cluster.nodes,
        state.executor.host(),
        &msg,
    )
    .await;
    Ok(Json(serde_json::json!({})))
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateFieldBody {
    #[serde(default)]
    pub options: FieldOptions,
}

pub async fn create_field(
    State(state): State<AppState>,
    Path((index, field)): Path<(String, String)>,
    body: Option<Json<CreateFieldBody>>,
) -> DbResult<Json<serde_json::Value>> {
    let options = body.map(|Json(b)| b.options).unwrap_or_default();
    let idx = state.engine.index_required(&index)?;
    idx.create_field(&field, &options)?;

    let msg = ClusterMessage::CreateField {
        index,
        field,
        options,
    };
    crate::broadcast::broadcast(
        state.executor.broadcaster(),
        &state.cluster.nodes,
        state.executor.host(),
        &msg,
    )
    .await;
    Ok(Json(serde_json::json!({})))
}

pub async fn delete_field(
    State(state): State<AppState>,
    Path((index, field)): Path<(String, String)>,
) -> DbResult<Json<serde_json::Value>> {
    let idx = state.engine.index_required(&index)?;
    idx.delete_field(&field)?;

    let msg = ClusterMessage::DeleteField { index, field };
    crate::broadcast::broadcast(
        state.executor.broadcaster(),
        &state.cluster.nodes,
        state.executor.host(),
        &msg,
    )
    .await;
    Ok(Json(serde_json::json!({})))
}

pub async fn get_schema(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "indexes": state.engine.schema() }))
}

pub async fn post_import(
    State(state): State<AppState>,
    Path((index, field)): Path<(String, String)>,
    Json(req): Json<ImportRequest>,
) -> DbResult<Json<serde_json::Value>> {
    let ctx = CancellationToken::new();
    state
        .executor
        .import(&index, &field, req.rows, req.cols, req.remote, &ctx)
        .await?;
    Ok(Json(serde_json::json!({})))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub host: String,
    pub nodes: std::collections::BTreeMap<String, crate::cluster::NodeStatus>,
}

pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        host: state.executor.host().to_string(),
        nodes: state.cluster.health(),
    })
}

pub async fn get_version(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "version": state.build.version }))
}

/// Broadcast receiver: schema changes and max-slice announcements from
/// peers.
pub async fn post_message(
    State(state): State<AppState>,
    Json(msg): Json<ClusterMessage>,
) -> DbResult<Json<serde_json::Value>> {
    state.engine.apply_message(&msg)?;
    Ok(Json(serde_json::json!({})))
}

#[derive(Debug, Deserialize)]
pub struct FragmentQuery {
    pub index: String,
    pub field: String,
    pub view: String,
    pub slice: u64,
}

fn lookup_fragment(
    state: &AppState,
    q: &FragmentQuery,
) -> DbResult<std::sync::Arc<crate::fragment::Fragment>> {
    let idx = state.engine.index_required(&q.index)?;
    let field = idx
        .field(&q.field)
        .ok_or_else(|| DbError::FieldNotFound(q.field.clone()))?;
    let view = field
        .view(&q.view)
        .ok_or_else(|| DbError::ViewNotFound(q.view.clone()))?;
    view.fragment(q.slice)
        .ok_or_else(|| DbError::Unavailable(format!("no fragment for slice {}", q.slice)))
}

pub async fn get_fragment_blocks(
    State(state): State<AppState>,
    UrlQuery(q): UrlQuery<FragmentQuery>,
) -> DbResult<Json<BlocksResponse>> {
    let fragment = lookup_fragment(&state, &q)?;
    Ok(Json(BlocksResponse {
        blocks: fragment.block_checksums(),
    }))
}

pub async fn post_block_pairs(
    State(state): State<AppState>,
    Json(req): Json<BlockPairsRequest>,
) -> DbResult<Json<BlockPairsResponse>> {
    let fragment = lookup_fragment(
        &state,
        &FragmentQuery {
            index: req.index.clone(),
            field: req.field.clone(),
            view: req.view.clone(),
            slice: req.slice,
        },
    )?;
    Ok(Json(BlockPairsResponse {
        pairs: fragment.block_pairs(req.block),
    }))
}
