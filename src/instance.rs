//! One supervised llama-server child process: lifecycle state machine, log
//! capture, health probing, and metrics scraping.

use std::fmt;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, ConfigStore, InstanceConf};
use crate::duration::format_human;
use crate::ring::LogRing;

const LOG_CAPACITY: usize = 200;
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const METRICS_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Stopped,
    Starting,
    Running,
    Crashed,
    Restarting,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Stopped => "stopped",
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Crashed => "crashed",
            InstanceState::Restarting => "restarting",
        };
        f.write_str(s)
    }
}

pub struct Instance {
    conf: InstanceConf,
    config: Arc<ConfigStore>,
    http: reqwest::Client,
    inner: Mutex<Inner>,
}

struct Inner {
    state: InstanceState,
    pid: Option<u32>,
    started_at: Option<Instant>,
    restart_count: u32,
    last_error: String,
    logs: LogRing,
    /// Stop signal of the current incarnation. Cancelled exactly once per
    /// incarnation, by `stop` or by the exit observer.
    stop: Option<CancellationToken>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub name: String,
    pub model: String,
    pub port: u16,
    pub gpu_ids: Vec<u32>,
    pub state: InstanceState,
    pub uptime: String,
    pub uptime_sec: f64,
    pub restart_count: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_error: String,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct InstanceMetrics {
    pub prompt_tokens_sec: f64,
    pub predicted_tokens_sec: f64,
    pub prompt_tokens_total: f64,
    pub predicted_total: f64,
    pub kv_cache_usage: f64,
    pub requests_processing: f64,
    pub requests_deferred: f64,
}

impl Instance {
    pub fn new(conf: InstanceConf, config: Arc<ConfigStore>) -> Self {
        Self {
            conf,
            config,
            http: reqwest::Client::new(),
            inner: Mutex::new(Inner {
                state: InstanceState::Stopped,
                pid: None,
                started_at: None,
                restart_count: 0,
                last_error: String::new(),
                logs: LogRing::new(LOG_CAPACITY),
                stop: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.conf.name
    }

    pub fn conf(&self) -> &InstanceConf {
        &self.conf
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("instance lock poisoned")
    }

    pub fn state(&self) -> InstanceState {
        self.lock().state
    }

    pub fn set_state(&self, state: InstanceState) {
        self.lock().state = state;
    }

    pub fn logs(&self) -> Vec<String> {
        self.lock().logs.snapshot()
    }

    pub fn restart_count(&self) -> u32 {
        self.lock().restart_count
    }

    pub fn increment_restarts(&self) {
        self.lock().restart_count += 1;
    }

    pub fn reset_restarts(&self) {
        self.lock().restart_count = 0;
    }

    /// Stop token of the running incarnation, if any. Health probing holds a
    /// clone of this and exits when it fires.
    pub fn incarnation_token(&self) -> Option<CancellationToken> {
        self.lock().stop.clone()
    }

    pub fn status(&self) -> InstanceStatus {
        let inner = self.lock();
        let mut status = InstanceStatus {
            name: self.conf.name.clone(),
            model: self.conf.model.clone(),
            port: self.conf.port,
            gpu_ids: self.conf.gpu_ids.clone(),
            state: inner.state,
            uptime: String::new(),
            uptime_sec: 0.0,
            restart_count: inner.restart_count,
            last_error: inner.last_error.clone(),
        };
        if matches!(inner.state, InstanceState::Running | InstanceState::Starting) {
            if let Some(started) = inner.started_at {
                let d = started.elapsed();
                status.uptime_sec = d.as_secs_f64();
                status.uptime = format_human(d);
            }
        }
        status
    }

    /// Spawn a new incarnation of the child process. Returns a receiver that
    /// fires once the child has exited and its state transition is recorded.
    /// Fails without a state change if the instance is already live or the
    /// spawn itself fails.
    pub fn start(self: &Arc<Self>) -> Result<oneshot::Receiver<()>> {
        let mut inner = self.lock();
        if matches!(inner.state, InstanceState::Running | InstanceState::Starting) {
            bail!(
                "instance {:?} is already {}",
                self.conf.name,
                inner.state
            );
        }

        let cfg = self.config.snapshot();
        let (args, gpu_env) = build_command(&self.conf, &cfg);

        let mut cmd = Command::new(&cfg.server_bin);
        cmd.args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some((var, devices)) = &gpu_env {
            cmd.env(var, devices);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("starting process {}", cfg.server_bin))?;
        let stdout = child.stdout.take().context("stdout pipe")?;
        let stderr = child.stderr.take().context("stderr pipe")?;
        let pid = child.id().unwrap_or_default();

        let stop = CancellationToken::new();
        inner.state = InstanceState::Starting;
        inner.pid = Some(pid);
        inner.started_at = Some(Instant::now());
        inner.last_error.clear();
        inner.stop = Some(stop.clone());
        drop(inner);

        match &gpu_env {
            Some((var, devices)) => info!(
                "[{}] process started (pid {pid}) on port {}, gpus {:?} ({var}={devices})",
                self.conf.name, self.conf.port, self.conf.gpu_ids
            ),
            None => info!(
                "[{}] process started (pid {pid}) on port {} (metal)",
                self.conf.name, self.conf.port
            ),
        }

        tokio::spawn(Self::drain(self.clone(), stdout));
        tokio::spawn(Self::drain(self.clone(), stderr));

        let (exit_tx, exit_rx) = oneshot::channel();
        let inst = self.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = stop.cancelled() => {
                    // Stop requested: SIGKILL, then reap.
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            let mut inner = inst.lock();
            if inner.state != InstanceState::Stopped {
                inner.state = InstanceState::Crashed;
                inner.last_error = match &status {
                    Ok(st) if st.success() => "process exited unexpectedly".to_string(),
                    Ok(st) => format!("process exited with {st}"),
                    Err(err) => format!("waiting on process: {err}"),
                };
                warn!("[{}] process exited: {}", inst.conf.name, inner.last_error);
                if let Some(token) = inner.stop.take() {
                    token.cancel();
                }
            }
            inner.pid = None;
            drop(inner);

            let _ = exit_tx.send(());
        });

        Ok(exit_rx)
    }

    /// Transition to stopped and cancel the incarnation token; the exit
    /// observer delivers the SIGKILL. A no-op when already stopped.
    pub fn stop(&self) {
        let mut inner = self.lock();
        if inner.state == InstanceState::Stopped {
            return;
        }
        inner.state = InstanceState::Stopped;
        if let Some(pid) = inner.pid {
            info!("[{}] stopping process (pid {pid})", self.conf.name);
        }
        if let Some(token) = inner.stop.take() {
            token.cancel();
        }
    }

    async fn drain<R: AsyncRead + Unpin>(inst: Arc<Self>, reader: R) {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            inst.lock().logs.push(line);
        }
    }

    fn probe_host(&self) -> String {
        resolve_probe_host(&self.config.host()).to_string()
    }

    /// One health probe against the child. True only on HTTP 200.
    pub async fn check_health(&self) -> bool {
        let url = format!("http://{}:{}/health", self.probe_host(), self.conf.port);
        match self.http.get(&url).timeout(HEALTH_TIMEOUT).send().await {
            Ok(resp) => resp.status() == reqwest::StatusCode::OK,
            Err(_) => false,
        }
    }

    /// Promotion path of the health loop: a healthy probe pins the state to
    /// running, but never resurrects an instance stopped in the meantime.
    pub fn mark_running(&self) {
        let mut inner = self.lock();
        if matches!(inner.state, InstanceState::Starting | InstanceState::Running) {
            inner.state = InstanceState::Running;
        }
    }

    /// Scrape the child's metrics endpoint. Returns nothing unless the
    /// instance is currently running and the scrape parses.
    pub async fn fetch_metrics(&self) -> Option<InstanceMetrics> {
        if self.state() != InstanceState::Running {
            return None;
        }
        let url = format!("http://{}:{}/metrics", self.probe_host(), self.conf.port);
        let resp = self
            .http
            .get(&url)
            .timeout(METRICS_TIMEOUT)
            .send()
            .await
            .ok()?;
        if resp.status() != reqwest::StatusCode::OK {
            return None;
        }
        let body = resp.text().await.ok()?;
        Some(parse_metrics(&body))
    }
}

/// Probe target for health and metrics: wildcard binds are reached through
/// loopback, anything else through the configured host.
fn resolve_probe_host(host: &str) -> &str {
    if host.is_empty() || host == "0.0.0.0" || host == "::" {
        "127.0.0.1"
    } else {
        host
    }
}

/// Argument vector and visible-devices assignment for one incarnation.
/// Per-instance overrides win over the global defaults.
fn build_command(conf: &InstanceConf, cfg: &Config) -> (Vec<String>, Option<(String, String)>) {
    let ngl = conf.ngl.unwrap_or(cfg.ngl);
    let ctx_len = conf.context_length.unwrap_or(cfg.context_length);
    let cache_k = conf.cache_type_k.as_deref().unwrap_or(&cfg.cache_type_k);
    let cache_v = conf.cache_type_v.as_deref().unwrap_or(&cfg.cache_type_v);

    let mut args: Vec<String> = Vec::new();
    if conf.model.starts_with('/') || conf.model.ends_with(".gguf") {
        args.push("-m".to_string());
    } else {
        args.push("-hf".to_string());
    }
    args.push(conf.model.clone());
    args.extend([
        "--port".to_string(),
        conf.port.to_string(),
        "--host".to_string(),
        cfg.host.clone(),
        "-ngl".to_string(),
        ngl.to_string(),
        "-c".to_string(),
        ctx_len.to_string(),
    ]);

    let gpu_env = cfg.gpu_backend.visible_devices_var().map(|var| {
        let devices = conf
            .gpu_ids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        (var.to_string(), devices)
    });

    if gpu_env.is_some() {
        if conf.gpu_ids.len() > 1 {
            let ratio = format!("{:.2}", 1.0 / conf.gpu_ids.len() as f64);
            let split = vec![ratio; conf.gpu_ids.len()].join(",");
            args.extend(["-mg".to_string(), "0".to_string()]);
            args.extend(["--tensor-split".to_string(), split]);
        } else {
            args.extend(["-mg".to_string(), cfg.main_gpu.to_string()]);
        }
    }

    if !cache_k.is_empty() {
        args.extend(["-ctk".to_string(), cache_k.to_string()]);
    }
    if !cache_v.is_empty() {
        args.extend(["-ctv".to_string(), cache_v.to_string()]);
    }
    args.push("--metrics".to_string());

    (args, gpu_env)
}

/// Parse the line-oriented metrics text format: comments and blanks skipped,
/// key taken up to any `{`, value from the last whitespace-separated field.
fn parse_metrics(body: &str) -> InstanceMetrics {
    let mut m = InstanceMetrics::default();
    for line in body.lines() {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 2 {
            continue;
        }
        let Ok(val) = fields[fields.len() - 1].parse::<f64>() else {
            continue;
        };
        let key = fields[0].split('{').next().unwrap_or(fields[0]);
        match key {
            "llamacpp:prompt_tokens_seconds" => m.prompt_tokens_sec = val,
            "llamacpp:predicted_tokens_seconds" => m.predicted_tokens_sec = val,
            "llamacpp:prompt_tokens_total" => m.prompt_tokens_total = val,
            "llamacpp:tokens_predicted_total" => m.predicted_total = val,
            "llamacpp:kv_cache_usage_ratio" => m.kv_cache_usage = val,
            "llamacpp:requests_processing" => m.requests_processing = val,
            "llamacpp:requests_deferred" => m.requests_deferred = val,
            _ => {}
        }
    }
    m
}
