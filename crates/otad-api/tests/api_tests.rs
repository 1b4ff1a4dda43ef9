//! ---
//! ota_section: "04-local-interfaces"
//! ota_subsection: "tests"
//! ota_type: "source"
//! ota_scope: "test"
//! ota_description: "HTTP adapter status code and payload tests."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use otad_api::{router, spawn_socket_server, ApiState};
use otad_core::{new_registry, ManagerMetrics, Update, UpdateManager};
use otad_testharness::{release_for, FakeBackend, StaticReleaseIndex, DEFAULT_COMPATIBLE};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

fn app(backend: &Arc<FakeBackend>, updates: Vec<Update>) -> Router {
    let registry = new_registry();
    let manager = UpdateManager::builder(Arc::new(StaticReleaseIndex::new(updates)))
        .backend(backend.clone())
        .metrics(ManagerMetrics::new(registry.clone()).unwrap())
        .build()
        .unwrap();
    router(Arc::new(ApiState::new(
        Arc::new(manager),
        Some(registry),
        CancellationToken::new(),
    )))
}

fn installed(version: &str) -> Arc<FakeBackend> {
    Arc::new(FakeBackend::new(DEFAULT_COMPATIBLE).with_installed_version(version))
}

async fn send(app: &Router, method: &str, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

async fn send_json(app: &Router, method: &str, uri: &str) -> (StatusCode, Value) {
    let (status, body) = send(app, method, uri).await;
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn check_returns_camel_case_update() {
    let backend = installed("1.8.1");
    let app = app(&backend, vec![release_for(DEFAULT_COMPATIBLE, "1.8.2").with_name("Penguin")]);

    let (status, body) = send_json(&app, "GET", "/update/check").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], "1.8.2");
    assert_eq!(body["name"], "Penguin");
    assert_eq!(body["prerelease"], false);
    assert!(body.get("releaseDate").is_some());
}

#[tokio::test]
async fn check_without_update_is_not_found() {
    let backend = installed("1.8.2");
    let app = app(&backend, vec![release_for(DEFAULT_COMPATIBLE, "1.8.2")]);

    let (status, body) = send_json(&app, "GET", "/update/check").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "no update");
}

#[tokio::test]
async fn busy_backend_rejects_check_and_install() {
    let backend = Arc::new(
        FakeBackend::new(DEFAULT_COMPATIBLE)
            .with_installed_version("1.8.1")
            .with_progress_script([64]),
    );
    backend.set_operation("installing");
    let app = app(&backend, vec![release_for(DEFAULT_COMPATIBLE, "1.8.2")]);

    let (status, _) = send_json(&app, "GET", "/update/check").await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, _) = send_json(&app, "POST", "/update").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(backend.installs().is_empty());

    let (status, body) = send_json(&app, "GET", "/update/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "installing");
    assert_eq!(body["progress"], 64);

    let (status, body) = send_json(&app, "GET", "/update/progress").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["progress"], 64);
}

#[tokio::test]
async fn progress_without_operation_is_conflict() {
    let backend = installed("1.8.1");
    let app = app(&backend, Vec::new());

    let (status, body) = send_json(&app, "GET", "/update/progress").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "no operation in progress");
}

#[tokio::test]
async fn post_update_starts_background_install() {
    let backend = installed("1.8.1");
    let release = release_for(DEFAULT_COMPATIBLE, "1.8.2");
    let expected_url = release.bundles[0].url.clone();
    let app = app(&backend, vec![release]);

    let (status, body) = send_json(&app, "POST", "/update").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body, serde_json::json!({"status": "installing"}));

    for _ in 0..100 {
        if !backend.installs().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(backend.installs(), vec![expected_url]);
}

#[tokio::test]
async fn idle_status_resolves_next_update_on_every_request() {
    let backend = installed("1.8.1");
    let app = app(&backend, vec![release_for(DEFAULT_COMPATIBLE, "1.8.2")]);

    let (status, body) = send_json(&app, "GET", "/update/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "idle");
    assert_eq!(body["nextUpdate"]["version"], "1.8.2");
    assert!(body.get("progress").is_none());
}

#[tokio::test]
async fn idle_status_without_update_omits_next_update() {
    let backend = installed("1.8.2");
    let app = app(&backend, vec![release_for(DEFAULT_COMPATIBLE, "1.8.2")]);

    let (status, body) = send_json(&app, "GET", "/update/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!({"status": "idle"}));
}

#[tokio::test]
async fn idle_status_reports_release_index_failure() {
    let backend = installed("1.8.1");
    let manager = UpdateManager::builder(Arc::new(StaticReleaseIndex::failing("feed offline")))
        .backend(backend)
        .build()
        .unwrap();
    let app = router(Arc::new(ApiState::new(
        Arc::new(manager),
        None,
        CancellationToken::new(),
    )));

    let (status, body) = send_json(&app, "GET", "/update/status").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("feed offline"));
}

#[tokio::test]
async fn metrics_expose_manager_counters() {
    let backend = installed("1.8.1");
    let app = app(&backend, Vec::new());

    send(&app, "GET", "/update/check").await;
    let (status, body) = send(&app, "GET", "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("otad_update_checks_total 1"));
}

#[tokio::test]
async fn socket_server_binds_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("run").join("update.socket");
    std::fs::create_dir_all(socket.parent().unwrap()).unwrap();
    std::fs::write(&socket, b"stale").unwrap();

    let backend = installed("1.8.1");
    let manager = UpdateManager::builder(Arc::new(StaticReleaseIndex::default()))
        .backend(backend)
        .build()
        .unwrap();
    let state = Arc::new(ApiState::new(Arc::new(manager), None, CancellationToken::new()));

    let server = spawn_socket_server(state, &socket).unwrap();
    tokio::net::UnixStream::connect(&socket).await.unwrap();
    server.shutdown().await.unwrap();
    assert!(!socket.exists());
}
