use axum::Json;
use serde::Serialize;

use crate::duration::format_human;
use crate::uptime::system_uptime;

#[derive(Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub uptime: String,
    pub uptime_sec: f64,
}

fn host_name() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return name;
        }
    }
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

pub async fn get_status() -> Json<ServerStatus> {
    let uptime = system_uptime();
    Json(ServerStatus {
        name: host_name(),
        uptime: format_human(uptime),
        uptime_sec: uptime.as_secs_f64(),
    })
}
