//! Read-mostly library endpoints: books, import paths, blocked hashes.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use talekeep_model::{BlockedHash, ImportPath};

use crate::errors::{AppError, AppResult};
use crate::state::AppState;

pub async fn list_books(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let books = state.store.list_books().await?;
    Ok(Json(json!({ "books": books })))
}

pub async fn list_import_paths(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let paths = state.store.list_import_paths().await?;
    Ok(Json(json!({ "import_paths": paths })))
}

#[derive(Debug, Deserialize)]
pub struct AddImportPathRequest {
    pub path: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

pub async fn add_import_path(
    State(state): State<AppState>,
    Json(request): Json<AddImportPathRequest>,
) -> AppResult<(StatusCode, Json<Value>)> {
    if request.path.is_empty() {
        return Err(AppError::bad_request("path must not be empty"));
    }
    let import_path = ImportPath {
        path: request.path,
        enabled: request.enabled,
        created_at: Utc::now(),
    };
    state.store.add_import_path(&import_path).await?;
    Ok((StatusCode::CREATED, Json(json!({ "import_path": import_path }))))
}

pub async fn remove_import_path(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> AppResult<Json<Value>> {
    state.store.remove_import_path(&path).await?;
    Ok(Json(json!({ "removed": path })))
}

#[derive(Debug, Deserialize)]
pub struct BlockHashRequest {
    pub hash: String,
    pub reason: Option<String>,
}

pub async fn block_hash(
    State(state): State<AppState>,
    Json(request): Json<BlockHashRequest>,
) -> AppResult<(StatusCode, Json<Value>)> {
    if request.hash.len() != 64 || !request.hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(AppError::bad_request("hash must be 64 hex characters"));
    }
    state
        .store
        .block_hash(&BlockedHash {
            hash: request.hash.clone(),
            reason: request.reason,
            blocked_at: Utc::now(),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "blocked": request.hash }))))
}

pub async fn list_blocked_hashes(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let hashes = state.store.list_blocked_hashes().await?;
    Ok(Json(json!({ "blocked_hashes": hashes })))
}
