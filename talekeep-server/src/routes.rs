use axum::Router;
use axum::routing::{delete, get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{events, library, operations, settings, system};
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        // Long-running work: enqueue and observe.
        .route("/operations/scan", post(operations::start_scan))
        .route("/operations/organize", post(operations::start_organize))
        .route(
            "/operations/metadata_fetch",
            post(operations::start_metadata_fetch),
        )
        .route(
            "/operations/itunes/import",
            post(operations::start_itunes_import),
        )
        .route(
            "/operations/itunes/writeback",
            post(operations::start_itunes_writeback),
        )
        .route("/operations/dump_import", post(operations::start_dump_import))
        .route("/operations/backup", post(operations::start_backup))
        .route("/operations", get(operations::list_operations))
        .route("/operations/active", get(operations::active_operations))
        .route(
            "/operations/{id}",
            get(operations::get_operation).delete(operations::cancel_operation),
        )
        .route("/operations/{id}/logs", get(operations::get_operation_logs))
        // Event stream.
        .route("/events", get(events::events))
        // Library reads and small mutations.
        .route("/books", get(library::list_books))
        .route(
            "/import_paths",
            get(library::list_import_paths).post(library::add_import_path),
        )
        .route("/import_paths/{path}", delete(library::remove_import_path))
        .route(
            "/blocked_hashes",
            get(library::list_blocked_hashes).post(library::block_hash),
        )
        // Settings.
        .route(
            "/settings/{key}",
            get(settings::get_setting).put(settings::put_setting),
        )
        // Status.
        .route("/system/status", get(system::status))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
