//! HTTP API handlers: process liveness and a request/response mirror of the
//! streaming protocol's `search`/`delete`/`stats` operations for clients
//! that don't want a persistent socket (spec.md §6.1 describes the wire
//! messages this mirrors one-for-one).

use axum::extract::{Json, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use hybridsearch_core::hybrid::{SearchFilterOpts, SearchOptions};
use hybridsearch_core::pipeline::{self, FileInput};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::AppContext;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    stores: usize,
    uptime_seconds: u64,
}

pub async fn health(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        stores: ctx.store_manager.store_count(),
        uptime_seconds: ctx.start_time.elapsed().as_secs(),
    })
}

fn error_response(err: &hybridsearch_core::CoreError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match err {
        hybridsearch_core::CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        hybridsearch_core::CoreError::AlreadyExists(_) => StatusCode::CONFLICT,
        hybridsearch_core::CoreError::Validation(_) => StatusCode::BAD_REQUEST,
        hybridsearch_core::CoreError::QueueFull(_) => StatusCode::TOO_MANY_REQUESTS,
        hybridsearch_core::CoreError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        hybridsearch_core::CoreError::ModelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        hybridsearch_core::CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "code": err.code(), "message": err.detail() })))
}

#[derive(Deserialize)]
pub struct IndexRequest {
    files: Vec<FileRequest>,
    #[serde(default)]
    force: bool,
}

#[derive(Deserialize)]
pub struct FileRequest {
    path: String,
    content: String,
}

pub async fn index_files(
    State(ctx): State<Arc<AppContext>>,
    Path(store): Path<String>,
    Json(req): Json<IndexRequest>,
) -> impl IntoResponse {
    let handle = match ctx.store_manager.ensure(&store) {
        Ok(h) => h,
        Err(e) => return error_response(&e).into_response(),
    };
    let files: Vec<FileInput> = req.files.into_iter().map(|f| FileInput { path: f.path, content: f.content }).collect();
    match pipeline::index_files(&handle, files, req.force).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

#[derive(Deserialize)]
pub struct SearchRequest {
    query: String,
    #[serde(default = "default_top_k")]
    top_k: usize,
    #[serde(default)]
    path_prefix: Option<String>,
    #[serde(default)]
    languages: Option<Vec<String>>,
    #[serde(default = "default_true")]
    enable_reranking: bool,
}

fn default_top_k() -> usize {
    20
}
fn default_true() -> bool {
    true
}

pub async fn search(
    State(ctx): State<Arc<AppContext>>,
    Path(store): Path<String>,
    Json(req): Json<SearchRequest>,
) -> impl IntoResponse {
    let handle = match ctx.store_manager.ensure(&store) {
        Ok(h) => h,
        Err(e) => return error_response(&e).into_response(),
    };
    let opts = SearchOptions {
        top_k: req.top_k,
        enable_reranking: req.enable_reranking,
        filter: SearchFilterOpts { path_prefix: req.path_prefix, languages: req.languages },
        ..Default::default()
    };
    let result = hybridsearch_core::hybrid::search(&handle.sparse, &handle.vector, &ctx.embedder, &ctx.reranker, &req.query, &opts).await;
    match result {
        Ok(results) => Json(results).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

pub async fn stats(State(ctx): State<Arc<AppContext>>, Path(store): Path<String>) -> impl IntoResponse {
    match ctx.store_manager.stats(&store) {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

pub async fn list_stores(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    Json(ctx.store_manager.list())
}
