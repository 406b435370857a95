//! System status: entity counts, queue metrics, and the cached size
//! aggregates. Sizes are only ever read through the cache.

use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use crate::errors::AppResult;
use crate::state::AppState;

pub async fn status(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let counts = state.store.library_counts().await?;
    let import_paths = state.store.list_import_paths().await?;
    let (library_bytes, import_bytes) = state
        .cache
        .library_sizes(state.ops.root_dir.as_deref(), &import_paths)
        .await?;

    let active: Vec<Value> = state
        .queue
        .active_operations()
        .await
        .into_iter()
        .map(|(id, op_type)| json!({ "id": id, "type": op_type }))
        .collect();

    Ok(Json(json!({
        "library": {
            "books": counts.books,
            "authors": counts.authors,
            "works": counts.works,
            "library_size_bytes": library_bytes,
            "import_size_bytes": import_bytes,
        },
        "operations": {
            "active": active,
            "metrics": state.queue.metrics().snapshot(),
        },
        "events": {
            "clients": state.hub.client_count().await,
            "dropped": state.hub.dropped_events(),
        },
    })))
}
