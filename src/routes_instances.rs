//! Runtime instance endpoints: status, logs, metrics, and operator actions.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::Json;
use serde_json::{json, Value};
use tokio::task::JoinSet;

use crate::instance::{InstanceMetrics, InstanceState, InstanceStatus};
use crate::state::SharedState;
use crate::web::{api_error, ApiError};

const DEFAULT_LOG_LINES: usize = 100;

pub async fn list_instances(State(st): State<SharedState>) -> Json<Vec<InstanceStatus>> {
    Json(st.manager.instances().iter().map(|i| i.status()).collect())
}

pub async fn get_instance(
    State(st): State<SharedState>,
    Path(name): Path<String>,
) -> Result<Json<InstanceStatus>, ApiError> {
    let inst = st
        .manager
        .get(&name)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "instance not found"))?;
    Ok(Json(inst.status()))
}

/// Dispatch for `/api/instances/{name}/{action}`. The route is registered for
/// every method and disambiguated here, including the reserved `all` name for
/// bulk actions; per-action method checks answer 405 the way a plain mux
/// handler would.
pub async fn instance_action(
    State(st): State<SharedState>,
    method: Method,
    Path((name, action)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    if name == "all" {
        return bulk_action(&st, &method, &action).await;
    }

    let inst = st
        .manager
        .get(&name)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "instance not found"))?;

    match action.as_str() {
        "logs" => {
            if method != Method::GET {
                return Err(api_error(
                    StatusCode::METHOD_NOT_ALLOWED,
                    "method not allowed",
                ));
            }
            let n = params
                .get("n")
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_LOG_LINES);
            let mut lines = inst.logs();
            if lines.len() > n {
                lines = lines.split_off(lines.len() - n);
            }
            Ok(Json(json!(lines)))
        }
        "start" | "stop" | "restart" => {
            if method != Method::POST {
                return Err(api_error(
                    StatusCode::METHOD_NOT_ALLOWED,
                    "method not allowed",
                ));
            }
            match action.as_str() {
                "start" => st.manager.start_instance(&name),
                "stop" => st.manager.stop_instance(&name),
                _ => st.manager.restart_instance(&name).await,
            }
            Ok(Json(json!({ "status": "ok" })))
        }
        _ => Err(api_error(StatusCode::NOT_FOUND, "unknown action")),
    }
}

/// Bulk operator actions. `start` only touches instances that are down;
/// `restart` sweeps the fleet in the background.
async fn bulk_action(
    st: &SharedState,
    method: &Method,
    action: &str,
) -> Result<Json<Value>, ApiError> {
    if *method != Method::POST {
        return Err(api_error(
            StatusCode::METHOD_NOT_ALLOWED,
            "method not allowed",
        ));
    }
    match action {
        "start" => {
            for inst in st.manager.instances() {
                if matches!(
                    inst.state(),
                    InstanceState::Stopped | InstanceState::Crashed
                ) {
                    st.manager.start_instance(inst.name());
                }
            }
        }
        "stop" => {
            for inst in st.manager.instances() {
                st.manager.stop_instance(inst.name());
            }
        }
        "restart" => {
            let mgr = st.manager.clone();
            tokio::spawn(async move {
                for inst in mgr.instances() {
                    mgr.restart_instance(inst.name()).await;
                }
            });
        }
        _ => return Err(api_error(StatusCode::NOT_FOUND, "unknown action")),
    }
    Ok(Json(json!({ "status": "ok" })))
}

/// Scrape every running instance in parallel; instances that are down or
/// unreachable are simply absent from the map.
pub async fn all_metrics(
    State(st): State<SharedState>,
) -> Json<HashMap<String, InstanceMetrics>> {
    let mut tasks = JoinSet::new();
    for inst in st.manager.instances() {
        tasks.spawn(async move {
            let name = inst.name().to_string();
            (name, inst.fetch_metrics().await)
        });
    }

    let mut result = HashMap::new();
    while let Some(joined) = tasks.join_next().await {
        if let Ok((name, Some(metrics))) = joined {
            result.insert(name, metrics);
        }
    }
    Json(result)
}
