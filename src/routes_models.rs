//! Model cache listing, quant discovery, and download-slot control.

use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::download::{fetch_quants, DownloadStatus};
use crate::models::{cache_dir, scan_cached_models};
use crate::state::SharedState;
use crate::web::{api_error, ApiError};

pub async fn list_models() -> Result<Json<Value>, ApiError> {
    let models = scan_cached_models()
        .map_err(|err| api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")))?;
    Ok(Json(json!({
        "cache_dir": cache_dir().display().to_string(),
        "models": models,
    })))
}

pub async fn get_quants(
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<String>>, ApiError> {
    let repo = params
        .get("repo")
        .filter(|r| !r.is_empty())
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "repo parameter is required"))?;
    let quants = fetch_quants(repo)
        .await
        .map_err(|err| api_error(StatusCode::BAD_GATEWAY, format!("{err:#}")))?;
    Ok(Json(quants))
}

#[derive(Deserialize)]
pub struct DownloadRequest {
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub quant: String,
}

pub async fn start_download(
    State(st): State<SharedState>,
    Json(req): Json<DownloadRequest>,
) -> Result<Json<Value>, ApiError> {
    if req.repo.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "repo is required"));
    }
    st.downloads
        .start(&req.repo, &req.quant)
        .map_err(|err| api_error(StatusCode::CONFLICT, format!("{err:#}")))?;
    Ok(Json(json!({ "status": "ok" })))
}

pub async fn download_status(State(st): State<SharedState>) -> Json<DownloadStatus> {
    Json(st.downloads.status())
}

pub async fn stop_download(State(st): State<SharedState>) -> Json<Value> {
    st.downloads.stop();
    Json(json!({ "status": "ok" }))
}
