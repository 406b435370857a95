use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use talekeep_config::Config;
use talekeep_core::cache::SizeCache;
use talekeep_core::events::EventHub;
use talekeep_core::ops::OpsContext;
use talekeep_core::queue::OperationQueue;
use talekeep_core::store::{SledStore, Store};
use tower::ServiceExt;

use crate::routes;
use crate::state::AppState;

struct TestApp {
    router: Router,
    store: Arc<dyn Store>,
    _data_dir: tempfile::TempDir,
}

fn test_app() -> TestApp {
    let data_dir = tempfile::tempdir().unwrap();
    let config = Config::default();
    let store: Arc<dyn Store> = Arc::new(SledStore::open_temporary().unwrap());
    let hub = EventHub::new(config.event_hub.client_buffer);
    let queue = OperationQueue::with_store(store.clone(), hub.clone(), &config.queue);
    queue.start();

    let ops = OpsContext {
        store: store.clone(),
        root_dir: None,
        data_dir: data_dir.path().to_path_buf(),
        backup: config.backup.clone(),
        metadata: config.metadata.clone(),
    };
    let state = AppState {
        store: store.clone(),
        hub,
        cache: Arc::new(SizeCache::new(Duration::from_secs(60))),
        queue,
        ops,
        config,
        vault: Some(talekeep_core::secrets::Vault::from_passphrase("test-key")),
    };
    TestApp {
        router: routes::router(state),
        store,
        _data_dir: data_dir,
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn system_status_serves_counts_and_sizes() {
    let app = test_app();
    let response = app.router.oneshot(get("/system/status")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["library"]["books"], json!(0));
    assert_eq!(body["library"]["library_size_bytes"], json!(0));
    assert_eq!(body["events"]["clients"], json!(0));
}

#[tokio::test]
async fn unknown_operation_is_404() {
    let app = test_app();
    let response = app
        .router
        .oneshot(get("/operations/ghost-1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancel_of_unknown_operation_is_404() {
    let app = test_app();
    let request = Request::builder()
        .method("DELETE")
        .uri("/operations/ghost-2")
        .body(Body::empty())
        .unwrap();
    let response = app.router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn organize_without_root_is_400() {
    let app = test_app();
    let response = app
        .router
        .oneshot(post_json("/operations/organize", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn itunes_import_without_library_path_is_400() {
    let app = test_app();
    let request = Request::builder()
        .method("POST")
        .uri("/operations/itunes/import")
        .body(Body::empty())
        .unwrap();
    let response = app.router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn scan_returns_202_and_reaches_the_store() {
    let app = test_app();
    let response = app
        .router
        .clone()
        .oneshot(post_json("/operations/scan", json!({ "force_update": false })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let body = body_json(response).await;
    let id = body["operation_id"].as_str().unwrap().to_owned();
    assert!(id.starts_with("scan-"));

    // The record is observable and reaches a terminal state (no root is
    // configured, so the scan finds nothing and completes).
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let record = app
            .store
            .get_operation(&talekeep_model::OperationId::new(id.clone()))
            .await
            .unwrap()
            .expect("record exists");
        if record.status.is_terminal() {
            assert_eq!(record.status, talekeep_model::OperationStatus::Completed);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn secret_settings_round_trip_through_the_vault() {
    let app = test_app();
    let response = app
        .router
        .clone()
        .oneshot(post_put(
            "/settings/provider.token",
            json!({ "value": "sk-very-secret", "is_secret": true }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Stored value is ciphertext, not the plaintext.
    let stored = app
        .store
        .get_setting("provider.token")
        .await
        .unwrap()
        .unwrap();
    assert!(stored.is_secret);
    assert_ne!(stored.value, "sk-very-secret");

    // The read path decrypts through the vault.
    let response = app
        .router
        .oneshot(get("/settings/provider.token"))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["value"], json!("sk-very-secret"));
    assert_eq!(body["is_secret"], json!(true));
}

fn post_put(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}
