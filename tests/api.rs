//! Control-plane tests: the router is driven directly through tower's
//! `oneshot` without binding a socket, and no child processes are spawned
//! (the configured server binary does not exist).

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use llamafleet::config::{Config, ConfigStore, InstanceConf};
use llamafleet::download::DownloadManager;
use llamafleet::manager::Manager;
use llamafleet::state::AppState;
use llamafleet::web::router;

fn instance_conf(name: &str, port: u16) -> InstanceConf {
    InstanceConf {
        name: name.to_string(),
        model: "org/repo".to_string(),
        port,
        gpu_ids: vec![0],
        ngl: None,
        context_length: None,
        cache_type_k: None,
        cache_type_v: None,
    }
}

fn make_app_with(store: ConfigStore) -> Router {
    let config = Arc::new(store);
    let manager = Manager::new(config.clone());
    let downloads = Arc::new(DownloadManager::new(config.server_bin()));
    router(Arc::new(AppState {
        config,
        manager,
        downloads,
    }))
}

fn make_app() -> Router {
    make_app_with(ConfigStore::ephemeral(Config {
        server_bin: "/nonexistent/llama-server".to_string(),
        instances: vec![instance_conf("a", 9090)],
        ..Config::default()
    }))
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn post_json(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn status_reports_host_and_uptime() {
    let resp = make_app().oneshot(get("/api/status")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert!(json.get("name").is_some());
    assert!(json.get("uptime").is_some());
    assert!(json.get("uptime_sec").is_some());
}

#[tokio::test]
async fn index_serves_html() {
    let resp = make_app().oneshot(get("/")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn instances_list_and_lookup() {
    let app = make_app();
    let resp = app.clone().oneshot(get("/api/instances")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json[0]["name"], "a");
    assert_eq!(json[0]["state"], "stopped");
    assert_eq!(json[0]["restart_count"], 0);

    let resp = app.clone().oneshot(get("/api/instances/a")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app.oneshot(get("/api/instances/missing")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn logs_endpoint_defaults_to_empty() {
    let resp = make_app()
        .oneshot(get("/api/instances/a/logs?n=10"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await, serde_json::json!([]));
}

#[tokio::test]
async fn stop_on_a_stopped_instance_is_ok() {
    let app = make_app();
    let resp = app.clone().oneshot(post("/api/instances/a/stop")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app.clone().oneshot(get("/api/instances/a")).await.unwrap();
    let json = body_json(resp).await;
    assert_eq!(json["state"], "stopped");

    let resp = app
        .clone()
        .oneshot(post("/api/instances/missing/stop"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = app.oneshot(post("/api/instances/a/explode")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn bulk_actions_answer_ok() {
    let app = make_app();
    for action in ["start", "stop", "restart"] {
        let resp = app
            .clone()
            .oneshot(post(&format!("/api/instances/all/{action}")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK, "action {action}");
    }
    let resp = app.oneshot(post("/api/instances/all/explode")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn metrics_fan_out_skips_non_running_instances() {
    let resp = make_app().oneshot(get("/api/metrics")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await, serde_json::json!({}));
}

#[tokio::test]
async fn method_mismatch_is_405() {
    let resp = make_app().oneshot(get("/api/models/download")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);

    let resp = make_app().oneshot(post("/api/instances")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);

    // Actions require POST, logs require GET, bulk requires POST.
    let resp = make_app().oneshot(get("/api/instances/a/start")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    let resp = make_app().oneshot(post("/api/instances/a/logs")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    let resp = make_app()
        .oneshot(get("/api/instances/all/start"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn unknown_route_is_404() {
    let resp = make_app().oneshot(get("/api/nonsense")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cross_origin_writes_are_forbidden() {
    let app = make_app();

    let req = Request::builder()
        .method("POST")
        .uri("/api/instances/a/stop")
        .header("host", "localhost:8080")
        .header("origin", "http://evil.example")
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    // Same-origin writes pass.
    let req = Request::builder()
        .method("POST")
        .uri("/api/instances/a/stop")
        .header("host", "localhost:8080")
        .header("origin", "http://localhost:8080")
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // Reads are exempt from the origin gate.
    let req = Request::builder()
        .uri("/api/instances")
        .header("host", "localhost:8080")
        .header("origin", "http://evil.example")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn config_instance_crud() {
    let app = make_app();

    // Missing gpu_ids is a 400.
    let resp = app
        .clone()
        .oneshot(post_json(
            "POST",
            "/api/config/instances",
            serde_json::json!({"name": "b", "model": "org/x", "port": 9091}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // Valid add lands in both the config and the runtime set.
    let resp = app
        .clone()
        .oneshot(post_json(
            "POST",
            "/api/config/instances",
            serde_json::json!({"name": "b", "model": "org/x", "port": 9091, "gpu_ids": [1]}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app.clone().oneshot(get("/api/config/instances")).await.unwrap();
    let json = body_json(resp).await;
    assert_eq!(json.as_array().unwrap().len(), 2);

    let resp = app.clone().oneshot(get("/api/instances/b")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // Duplicate name and duplicate port are conflicts.
    let resp = app
        .clone()
        .oneshot(post_json(
            "POST",
            "/api/config/instances",
            serde_json::json!({"name": "b", "model": "org/x", "port": 9092, "gpu_ids": [0]}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let resp = app
        .clone()
        .oneshot(post_json(
            "POST",
            "/api/config/instances",
            serde_json::json!({"name": "c", "model": "org/x", "port": 9091, "gpu_ids": [0]}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    // Replace: a port collision with another entry is rejected.
    let resp = app
        .clone()
        .oneshot(post_json(
            "PUT",
            "/api/config/instances/b",
            serde_json::json!({"name": "b", "model": "org/x", "port": 9090, "gpu_ids": [1]}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = app
        .clone()
        .oneshot(post_json(
            "PUT",
            "/api/config/instances/b",
            serde_json::json!({"name": "b2", "model": "org/x", "port": 9093, "gpu_ids": [1]}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = app.clone().oneshot(get("/api/instances/b2")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // Delete removes from both sides; a second delete is a 404.
    let req = Request::builder()
        .method("DELETE")
        .uri("/api/config/instances/b2")
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let req = Request::builder()
        .method("DELETE")
        .uri("/api/config/instances/b2")
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let resp = app.oneshot(get("/api/instances/b2")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn settings_round_trip_and_validation() {
    let app = make_app();

    let resp = app.clone().oneshot(get("/api/settings")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let mut settings = body_json(resp).await;
    assert_eq!(settings["restart_delay"], "5s");
    assert_eq!(settings["gpu_backend"], "vulkan");

    settings["gpu_backend"] = "quantum".into();
    let resp = app
        .clone()
        .oneshot(post_json("PUT", "/api/settings", settings.clone()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    settings["gpu_backend"] = "cuda".into();
    settings["restart_delay"] = "7s".into();
    settings["max_restarts"] = 2.into();
    let resp = app
        .clone()
        .oneshot(post_json("PUT", "/api/settings", settings))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["gpu_backend"], "cuda");
    assert_eq!(json["restart_delay"], "7s");
    assert_eq!(json["max_restarts"], 2);
}

#[tokio::test]
async fn download_slot_starts_empty() {
    let resp = make_app()
        .oneshot(get("/api/models/download/status"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await, serde_json::json!({"active": false}));
}

#[tokio::test]
async fn download_requires_a_repo() {
    let resp = make_app()
        .oneshot(post_json(
            "POST",
            "/api/models/download",
            serde_json::json!({"quant": "Q4_K_M"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn quants_require_a_repo_param() {
    let resp = make_app().oneshot(get("/api/models/quants")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn export_and_import_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "server_bin: /usr/bin/llama-server\n").unwrap();
    let app = make_app_with(ConfigStore::load(&path).unwrap());

    let resp = app.clone().oneshot(get("/api/config/export")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()["content-type"].to_str().unwrap(),
        "application/x-yaml"
    );
    let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
    assert!(std::str::from_utf8(&bytes).unwrap().contains("server_bin"));

    let upload = "server_bin: /new/llama-server\nrestart_delay: 9s\n";
    let boundary = "XBOUNDARYX";
    let body = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"config.yaml\"\r\nContent-Type: application/octet-stream\r\n\r\n{upload}\r\n--{boundary}--\r\n"
    );
    let req = Request::builder()
        .method("POST")
        .uri("/api/config/import")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // The scalar subset is live, and the raw upload landed on disk.
    let resp = app.oneshot(get("/api/settings")).await.unwrap();
    let json = body_json(resp).await;
    assert_eq!(json["server_bin"], "/new/llama-server");
    assert_eq!(json["restart_delay"], "9s");
    assert_eq!(std::fs::read_to_string(&path).unwrap(), upload);
}

#[tokio::test]
async fn import_rejects_invalid_yaml() {
    let boundary = "XBOUNDARYX";
    let body = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"c.yaml\"\r\n\r\ninstances: {{broken: [\r\n--{boundary}--\r\n"
    );
    let req = Request::builder()
        .method("POST")
        .uri("/api/config/import")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap();
    let resp = make_app().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn legacy_gpu_id_is_accepted_on_add() {
    let app = make_app();
    let resp = app
        .clone()
        .oneshot(post_json(
            "POST",
            "/api/config/instances",
            serde_json::json!({"name": "legacy", "model": "org/x", "port": 9099, "gpu_id": 3}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["gpu_ids"], serde_json::json!([3]));
}
