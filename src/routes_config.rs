//! Declared-config endpoints: instance CRUD, settings, export, and import.

use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::config::{parse_patch, InstanceConf, Settings};
use crate::state::SharedState;
use crate::web::{api_error, ApiError};

fn validate_instance_conf(ic: &InstanceConf) -> Result<(), ApiError> {
    if ic.name.is_empty() || ic.model.is_empty() || ic.port == 0 {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "name, model, and port are required",
        ));
    }
    if ic.gpu_ids.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "gpu_ids must contain at least one GPU ID",
        ));
    }
    Ok(())
}

pub async fn list_instance_confs(State(st): State<SharedState>) -> Json<Vec<InstanceConf>> {
    Json(st.config.instances())
}

pub async fn add_instance_conf(
    State(st): State<SharedState>,
    Json(ic): Json<InstanceConf>,
) -> Result<Json<InstanceConf>, ApiError> {
    validate_instance_conf(&ic)?;
    st.config
        .add_instance(ic.clone())
        .map_err(|err| api_error(StatusCode::CONFLICT, format!("{err:#}")))?;
    st.manager.add_instance(ic.clone());
    Ok(Json(ic))
}

/// Replace a declared instance: the runtime instance is removed first, the
/// config updated, and a fresh (stopped) runtime instance registered.
pub async fn update_instance_conf(
    State(st): State<SharedState>,
    Path(name): Path<String>,
    Json(ic): Json<InstanceConf>,
) -> Result<Json<InstanceConf>, ApiError> {
    validate_instance_conf(&ic)?;
    st.manager.remove_instance(&name);
    st.config
        .update_instance(&name, ic.clone())
        .map_err(|err| api_error(StatusCode::BAD_REQUEST, format!("{err:#}")))?;
    st.manager.add_instance(ic.clone());
    Ok(Json(ic))
}

pub async fn delete_instance_conf(
    State(st): State<SharedState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    st.manager.remove_instance(&name);
    st.config
        .delete_instance(&name)
        .map_err(|err| api_error(StatusCode::NOT_FOUND, format!("{err:#}")))?;
    Ok(Json(json!({ "status": "ok" })))
}

pub async fn export_config(State(st): State<SharedState>) -> Result<Response, ApiError> {
    let data = std::fs::read(st.config.path())
        .map_err(|err| api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/x-yaml"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"config.yaml\"",
            ),
        ],
        data,
    )
        .into_response())
}

/// Import a config file. The upload is validated by a full parse and written
/// to disk, but only scalar settings are applied to the live config;
/// instance-list changes require a restart.
pub async fn import_config(
    State(st): State<SharedState>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let mut data = None;
    while let Some(field) = multipart.next_field().await.map_err(|err| {
        api_error(
            StatusCode::BAD_REQUEST,
            format!("file upload required: {err}"),
        )
    })? {
        if field.name() == Some("file") {
            data = Some(field.bytes().await.map_err(|err| {
                api_error(StatusCode::BAD_REQUEST, format!("reading file: {err}"))
            })?);
        }
    }
    let data = data.ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "file upload required"))?;
    let text = std::str::from_utf8(&data)
        .map_err(|_| api_error(StatusCode::BAD_REQUEST, "invalid yaml: not valid utf-8"))?;

    let patch =
        parse_patch(text).map_err(|err| api_error(StatusCode::BAD_REQUEST, format!("{err:#}")))?;
    st.config.apply_patch(text, patch).map_err(|err| {
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("writing config: {err:#}"),
        )
    })?;

    Ok(Json(json!({
        "status": "ok",
        "message": "config imported, settings applied. restart to apply instance changes",
    })))
}

pub async fn get_settings(State(st): State<SharedState>) -> Json<Settings> {
    Json(st.config.settings())
}

pub async fn put_settings(
    State(st): State<SharedState>,
    Json(settings): Json<Settings>,
) -> Result<Json<Settings>, ApiError> {
    st.config
        .update_settings(settings)
        .map_err(|err| api_error(StatusCode::BAD_REQUEST, format!("{err:#}")))?;
    Ok(Json(st.config.settings()))
}
