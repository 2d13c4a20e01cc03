//! Router assembly and cross-cutting HTTP policy for the control plane.

use axum::extract::{DefaultBodyLimit, Request};
use axum::http::{header, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{any, get, post, put};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::state::SharedState;
use crate::{routes_config, routes_instances, routes_models, routes_status};

const MAX_JSON_BODY: usize = 1 << 20;
const MAX_UPLOAD_SIZE: usize = 10 << 20;

pub type ApiError = (StatusCode, Json<serde_json::Value>);

pub(crate) fn api_error(status: StatusCode, msg: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": msg.into() })))
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/status", get(routes_status::get_status))
        .route("/api/instances", get(routes_instances::list_instances))
        .route("/api/metrics", get(routes_instances::all_metrics))
        .route("/api/instances/:name", get(routes_instances::get_instance))
        // Logs, operator actions, and the reserved `all` bulk name share one
        // route; matchit 0.7 rejects a static sibling next to a param, so the
        // handler dispatches on name, action, and method instead.
        .route(
            "/api/instances/:name/:action",
            any(routes_instances::instance_action),
        )
        .route("/api/models", get(routes_models::list_models))
        .route("/api/models/quants", get(routes_models::get_quants))
        .route("/api/models/download", post(routes_models::start_download))
        .route(
            "/api/models/download/status",
            get(routes_models::download_status),
        )
        .route(
            "/api/models/download/stop",
            post(routes_models::stop_download),
        )
        .route(
            "/api/config/instances",
            get(routes_config::list_instance_confs).post(routes_config::add_instance_conf),
        )
        .route(
            "/api/config/instances/:name",
            put(routes_config::update_instance_conf).delete(routes_config::delete_instance_conf),
        )
        .route("/api/config/export", get(routes_config::export_config))
        .route(
            "/api/config/import",
            post(routes_config::import_config).layer(DefaultBodyLimit::max(MAX_UPLOAD_SIZE)),
        )
        .route(
            "/api/settings",
            get(routes_config::get_settings).put(routes_config::put_settings),
        )
        .layer(middleware::from_fn(enforce_same_origin))
        .layer(DefaultBodyLimit::max(MAX_JSON_BODY))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(include_str!("../templates/index.html"))
}

/// Cross-origin writes are refused: any non-idempotent request carrying an
/// `Origin` header must originate from this host.
async fn enforce_same_origin(req: Request, next: Next) -> Response {
    let idempotent = matches!(*req.method(), Method::GET | Method::HEAD | Method::OPTIONS);
    if !idempotent {
        let origin = req
            .headers()
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !origin.is_empty() {
            let host = req
                .headers()
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if origin != format!("http://{host}") && origin != format!("https://{host}") {
                return api_error(StatusCode::FORBIDDEN, "forbidden: origin mismatch")
                    .into_response();
            }
        }
    }
    next.run(req).await
}
