//! Operation endpoints. Every mutating request enqueues and returns 202
//! with the operation id immediately; observation happens via
//! `GET /operations/:id` and the event stream.

use std::path::PathBuf;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use talekeep_core::ops::{backup, dump, itunes, metadata, organize, scan};
use talekeep_core::queue::OperationFunc;
use talekeep_model::{OperationId, OperationPriority, OperationType};

use crate::errors::{AppError, AppResult};
use crate::state::AppState;

fn mint_id(op_type: OperationType) -> OperationId {
    OperationId::new(format!("{}-{}", op_type.as_str(), Utc::now().timestamp_millis()))
}

async fn enqueue(
    state: &AppState,
    op_type: OperationType,
    priority: OperationPriority,
    folder: Option<String>,
    body: OperationFunc,
) -> AppResult<(StatusCode, Json<Value>)> {
    if state.queue.has_active(op_type).await {
        return Err(AppError::conflict(format!(
            "a {op_type} operation is already running"
        )));
    }
    let id = mint_id(op_type);
    state
        .queue
        .enqueue(id.clone(), op_type, priority, folder, body)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "operation_id": id }))))
}

#[derive(Debug, Default, Deserialize)]
pub struct ScanRequest {
    #[serde(default)]
    pub force_update: bool,
}

pub async fn start_scan(
    State(state): State<AppState>,
    body: Option<Json<ScanRequest>>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let args = scan::ScanArgs {
        store: state.store.clone(),
        root: state.ops.root_dir.clone(),
        force_update: request.force_update,
    };
    enqueue(
        &state,
        OperationType::Scan,
        OperationPriority::Normal,
        None,
        scan::scan(args),
    )
    .await
}

pub async fn start_organize(
    State(state): State<AppState>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let root = state
        .ops
        .root_dir
        .clone()
        .ok_or_else(|| AppError::bad_request("library.root_dir is not configured"))?;
    let args = organize::OrganizeArgs {
        store: state.store.clone(),
        root,
    };
    enqueue(
        &state,
        OperationType::Organize,
        OperationPriority::Normal,
        None,
        organize::organize(args),
    )
    .await
}

pub async fn start_metadata_fetch(
    State(state): State<AppState>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let args = metadata::MetadataArgs {
        store: state.store.clone(),
        cfg: state.ops.metadata.clone(),
    };
    enqueue(
        &state,
        OperationType::MetadataFetch,
        OperationPriority::Low,
        None,
        metadata::fetch(args),
    )
    .await
}

#[derive(Debug, Deserialize)]
pub struct ItunesImportRequest {
    pub library_path: String,
}

pub async fn start_itunes_import(
    State(state): State<AppState>,
    body: Option<Json<ItunesImportRequest>>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let Some(Json(request)) = body else {
        return Err(AppError::bad_request("library_path is required"));
    };
    let xml_path = PathBuf::from(&request.library_path);
    if !xml_path.exists() {
        return Err(AppError::bad_request(format!(
            "iTunes library not found: {}",
            xml_path.display()
        )));
    }
    let args = itunes::ItunesImportArgs {
        store: state.store.clone(),
        xml_path,
        root: state.ops.root_dir.clone(),
    };
    enqueue(
        &state,
        OperationType::ItunesImport,
        OperationPriority::Normal,
        Some(request.library_path),
        itunes::import(args),
    )
    .await
}

#[derive(Debug, Deserialize)]
pub struct ItunesWritebackRequest {
    pub library_path: String,
    #[serde(default = "default_true")]
    pub make_backup: bool,
}

fn default_true() -> bool {
    true
}

pub async fn start_itunes_writeback(
    State(state): State<AppState>,
    body: Option<Json<ItunesWritebackRequest>>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let Some(Json(request)) = body else {
        return Err(AppError::bad_request("library_path is required"));
    };
    let xml_path = PathBuf::from(&request.library_path);
    if !xml_path.exists() {
        return Err(AppError::bad_request(format!(
            "iTunes library not found: {}",
            xml_path.display()
        )));
    }
    let args = itunes::ItunesWritebackArgs {
        store: state.store.clone(),
        xml_path,
        make_backup: request.make_backup,
    };
    enqueue(
        &state,
        OperationType::ItunesWriteback,
        OperationPriority::Normal,
        Some(request.library_path),
        itunes::writeback(args),
    )
    .await
}

#[derive(Debug, Deserialize)]
pub struct DumpImportRequest {
    pub dump_path: String,
}

pub async fn start_dump_import(
    State(state): State<AppState>,
    body: Option<Json<DumpImportRequest>>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let Some(Json(request)) = body else {
        return Err(AppError::bad_request("dump_path is required"));
    };
    let dump_path = PathBuf::from(&request.dump_path);
    if !dump_path.exists() {
        return Err(AppError::bad_request(format!(
            "dump file not found: {}",
            dump_path.display()
        )));
    }
    let args = dump::DumpImportArgs {
        store: state.store.clone(),
        dump_path,
    };
    enqueue(
        &state,
        OperationType::DumpImport,
        OperationPriority::Low,
        Some(request.dump_path),
        dump::import(args),
    )
    .await
}

pub async fn start_backup(State(state): State<AppState>) -> AppResult<(StatusCode, Json<Value>)> {
    let args = backup::BackupArgs {
        data_dir: state.ops.data_dir.clone(),
        cfg: state.ops.backup.clone(),
    };
    enqueue(
        &state,
        OperationType::Backup,
        OperationPriority::High,
        None,
        backup::backup(args),
    )
    .await
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

pub async fn list_operations(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Value>> {
    let limit = query.limit.unwrap_or(50).min(500);
    let operations = state.store.recent_operations(limit).await?;
    Ok(Json(json!({ "operations": operations })))
}

pub async fn get_operation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let id = OperationId::new(id);
    let record = state
        .store
        .get_operation(&id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("operation {id}")))?;
    Ok(Json(json!({ "operation": record })))
}

pub async fn get_operation_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Value>> {
    let id = OperationId::new(id);
    if state.store.get_operation(&id).await?.is_none() {
        return Err(AppError::not_found(format!("operation {id}")));
    }
    let limit = query.limit.unwrap_or(200).min(2000);
    let logs = state.store.operation_logs(&id, limit).await?;
    Ok(Json(json!({ "logs": logs })))
}

pub async fn cancel_operation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let id = OperationId::new(id);
    state.queue.cancel(&id).await?;
    Ok(Json(json!({ "operation_id": id, "status": "canceled" })))
}

pub async fn active_operations(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let active: Vec<Value> = state
        .queue
        .active_operations()
        .await
        .into_iter()
        .map(|(id, op_type)| json!({ "id": id, "type": op_type }))
        .collect();
    Ok(Json(json!({ "active": active })))
}
