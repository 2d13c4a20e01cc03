//! Typed configuration store: global settings plus the declared instance set,
//! persisted back to the YAML file on every successful mutation.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::duration::{format_duration, parse_duration, ConfDuration};

/// Accelerator backend the child binary is built for. Selecting one decides
/// which visible-devices environment variable the instance launch sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuBackend {
    #[default]
    Vulkan,
    Cuda,
    Rocm,
    RocmRocr,
    Metal,
}

impl GpuBackend {
    /// Environment variable that scopes device visibility for this backend.
    /// Metal has no such variable; the whole host is visible.
    pub fn visible_devices_var(self) -> Option<&'static str> {
        match self {
            GpuBackend::Cuda => Some("CUDA_VISIBLE_DEVICES"),
            GpuBackend::Rocm => Some("HIP_VISIBLE_DEVICES"),
            GpuBackend::RocmRocr => Some("ROCR_VISIBLE_DEVICES"),
            GpuBackend::Metal => None,
            GpuBackend::Vulkan => Some("GGML_VK_VISIBLE_DEVICES"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GpuBackend::Vulkan => "vulkan",
            GpuBackend::Cuda => "cuda",
            GpuBackend::Rocm => "rocm",
            GpuBackend::RocmRocr => "rocm_rocr",
            GpuBackend::Metal => "metal",
        }
    }
}

impl fmt::Display for GpuBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GpuBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "vulkan" => Ok(GpuBackend::Vulkan),
            "cuda" => Ok(GpuBackend::Cuda),
            "rocm" => Ok(GpuBackend::Rocm),
            "rocm_rocr" => Ok(GpuBackend::RocmRocr),
            "metal" => Ok(GpuBackend::Metal),
            _ => bail!("gpu_backend must be one of: vulkan, cuda, rocm, rocm_rocr, metal"),
        }
    }
}

fn default_manager_port() -> u16 {
    8080
}
fn default_restart_delay() -> ConfDuration {
    ConfDuration::from_secs(5)
}
fn default_max_restarts() -> u32 {
    10
}
fn default_health_check_interval() -> ConfDuration {
    ConfDuration::from_secs(30)
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_ngl() -> u32 {
    99
}
fn default_context_length() -> u32 {
    16384
}
fn default_cache_type() -> String {
    "q8_0".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server_bin: String,
    #[serde(default = "default_manager_port")]
    pub manager_port: u16,
    #[serde(default = "default_restart_delay")]
    pub restart_delay: ConfDuration,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: ConfDuration,
    #[serde(default)]
    pub gpu_backend: GpuBackend,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_ngl")]
    pub ngl: u32,
    #[serde(default)]
    pub main_gpu: u32,
    #[serde(default = "default_context_length")]
    pub context_length: u32,
    #[serde(default = "default_cache_type")]
    pub cache_type_k: String,
    #[serde(default = "default_cache_type")]
    pub cache_type_v: String,
    #[serde(default)]
    pub instances: Vec<InstanceConf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_bin: String::new(),
            manager_port: default_manager_port(),
            restart_delay: default_restart_delay(),
            max_restarts: default_max_restarts(),
            health_check_interval: default_health_check_interval(),
            gpu_backend: GpuBackend::default(),
            host: default_host(),
            ngl: default_ngl(),
            main_gpu: 0,
            context_length: default_context_length(),
            cache_type_k: default_cache_type(),
            cache_type_v: default_cache_type(),
            instances: Vec::new(),
        }
    }
}

/// Declared configuration of one instance. Required fields are validated at
/// the API boundary, not here, so a partial body decodes cleanly and gets a
/// proper 400 instead of a deserialization error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawInstanceConf")]
pub struct InstanceConf {
    pub name: String,
    pub model: String,
    pub port: u16,
    pub gpu_ids: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ngl: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_type_k: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_type_v: Option<String>,
}

/// Ingestion form of [`InstanceConf`]: accepts the historical scalar `gpu_id`
/// key and rewrites it into the `gpu_ids` list. Only the list form is ever
/// written back out.
#[derive(Debug, Deserialize)]
struct RawInstanceConf {
    #[serde(default)]
    name: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    port: u16,
    #[serde(default)]
    gpu_ids: Vec<u32>,
    #[serde(default)]
    gpu_id: Option<u32>,
    #[serde(default)]
    ngl: Option<u32>,
    #[serde(default)]
    context_length: Option<u32>,
    #[serde(default)]
    cache_type_k: Option<String>,
    #[serde(default)]
    cache_type_v: Option<String>,
}

impl From<RawInstanceConf> for InstanceConf {
    fn from(raw: RawInstanceConf) -> Self {
        let gpu_ids = if raw.gpu_ids.is_empty() {
            raw.gpu_id.map(|id| vec![id]).unwrap_or_default()
        } else {
            raw.gpu_ids
        };
        InstanceConf {
            name: raw.name,
            model: raw.model,
            port: raw.port,
            gpu_ids,
            ngl: raw.ngl,
            context_length: raw.context_length,
            cache_type_k: raw.cache_type_k,
            cache_type_v: raw.cache_type_v,
        }
    }
}

/// Flat settings projection served over `GET/PUT /api/settings`. Durations
/// travel as strings so the UI can echo them back untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server_bin: String,
    #[serde(default)]
    pub manager_port: u16,
    #[serde(default)]
    pub restart_delay: String,
    #[serde(default)]
    pub max_restarts: u32,
    #[serde(default)]
    pub health_check_interval: String,
    #[serde(default)]
    pub gpu_backend: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub ngl: u32,
    #[serde(default)]
    pub main_gpu: u32,
    #[serde(default)]
    pub context_length: u32,
    #[serde(default)]
    pub cache_type_k: String,
    #[serde(default)]
    pub cache_type_v: String,
}

/// Scalar subset of a config upload that is applied to the live store.
/// Instance-list changes in an import take effect on the next restart.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigPatch {
    #[serde(default)]
    pub server_bin: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub gpu_backend: Option<GpuBackend>,
    #[serde(default)]
    pub restart_delay: Option<ConfDuration>,
    #[serde(default)]
    pub health_check_interval: Option<ConfDuration>,
    #[serde(default)]
    pub max_restarts: Option<u32>,
    #[serde(default)]
    pub ngl: Option<u32>,
    #[serde(default)]
    pub context_length: Option<u32>,
    #[serde(default)]
    pub cache_type_k: Option<String>,
    #[serde(default)]
    pub cache_type_v: Option<String>,
    #[serde(default)]
    pub manager_port: Option<u16>,
    #[serde(default)]
    pub main_gpu: Option<u32>,
    #[serde(default)]
    pub instances: Vec<InstanceConf>,
}

/// Parse an uploaded config for validation. Any YAML error rejects the whole
/// upload before a byte is written to disk.
pub fn parse_patch(data: &str) -> Result<ConfigPatch> {
    serde_yaml::from_str(data).context("invalid yaml")
}

/// Reader/writer-disciplined configuration store. Reads hand out defensive
/// copies; writes validate, mutate, and persist under the same writer lock.
pub struct ConfigStore {
    inner: RwLock<Config>,
    path: PathBuf,
}

impl ConfigStore {
    /// Load the config file, applying defaults for everything unspecified.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg: Config = serde_yaml::from_str(&data).context("parsing config")?;
        if cfg.server_bin.is_empty() {
            bail!("server_bin is required");
        }
        Ok(Self {
            inner: RwLock::new(cfg),
            path: path.to_path_buf(),
        })
    }

    /// Store without a backing file; persistence is skipped. Test mode.
    pub fn ephemeral(cfg: Config) -> Self {
        Self {
            inner: RwLock::new(cfg),
            path: PathBuf::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> RwLockReadGuard<'_, Config> {
        self.inner.read().expect("config lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, Config> {
        self.inner.write().expect("config lock poisoned")
    }

    pub fn snapshot(&self) -> Config {
        self.read().clone()
    }

    pub fn server_bin(&self) -> String {
        self.read().server_bin.clone()
    }

    pub fn host(&self) -> String {
        self.read().host.clone()
    }

    pub fn manager_port(&self) -> u16 {
        self.read().manager_port
    }

    pub fn max_restarts(&self) -> u32 {
        self.read().max_restarts
    }

    pub fn restart_delay(&self) -> Duration {
        self.read().restart_delay.0
    }

    pub fn health_check_interval(&self) -> Duration {
        self.read().health_check_interval.0
    }

    pub fn settings(&self) -> Settings {
        let cfg = self.read();
        Settings {
            server_bin: cfg.server_bin.clone(),
            manager_port: cfg.manager_port,
            restart_delay: format_duration(cfg.restart_delay.0),
            max_restarts: cfg.max_restarts,
            health_check_interval: format_duration(cfg.health_check_interval.0),
            gpu_backend: cfg.gpu_backend.to_string(),
            host: cfg.host.clone(),
            ngl: cfg.ngl,
            main_gpu: cfg.main_gpu,
            context_length: cfg.context_length,
            cache_type_k: cfg.cache_type_k.clone(),
            cache_type_v: cfg.cache_type_v.clone(),
        }
    }

    /// Validate and apply a settings update. Empty strings mean "leave as is";
    /// the manager port is intentionally not applied live.
    pub fn update_settings(&self, s: Settings) -> Result<()> {
        let mut cfg = self.write();

        if s.context_length == 0 {
            bail!("context_length must be > 0");
        }
        let backend = if s.gpu_backend.is_empty() {
            None
        } else {
            Some(s.gpu_backend.parse::<GpuBackend>()?)
        };
        let restart_delay = if s.restart_delay.is_empty() {
            None
        } else {
            let d = parse_duration(&s.restart_delay)
                .with_context(|| format!("invalid restart_delay {:?}", s.restart_delay))?;
            if d.is_zero() {
                bail!("restart_delay must be > 0");
            }
            Some(d)
        };
        let health_interval = if s.health_check_interval.is_empty() {
            None
        } else {
            let d = parse_duration(&s.health_check_interval).with_context(|| {
                format!("invalid health_check_interval {:?}", s.health_check_interval)
            })?;
            if d.is_zero() {
                bail!("health_check_interval must be > 0");
            }
            Some(d)
        };

        if !s.server_bin.is_empty() {
            cfg.server_bin = s.server_bin;
        }
        if let Some(d) = restart_delay {
            cfg.restart_delay = ConfDuration(d);
        }
        if let Some(d) = health_interval {
            cfg.health_check_interval = ConfDuration(d);
        }
        cfg.max_restarts = s.max_restarts;
        if let Some(b) = backend {
            cfg.gpu_backend = b;
        }
        if !s.host.is_empty() {
            cfg.host = s.host;
        }
        cfg.ngl = s.ngl;
        cfg.main_gpu = s.main_gpu;
        cfg.context_length = s.context_length;
        if !s.cache_type_k.is_empty() {
            cfg.cache_type_k = s.cache_type_k;
        }
        if !s.cache_type_v.is_empty() {
            cfg.cache_type_v = s.cache_type_v;
        }

        self.save_locked(&cfg)
    }

    pub fn instances(&self) -> Vec<InstanceConf> {
        self.read().instances.clone()
    }

    pub fn add_instance(&self, ic: InstanceConf) -> Result<()> {
        let mut cfg = self.write();
        for existing in &cfg.instances {
            if existing.name == ic.name {
                bail!("duplicate instance name: {:?}", ic.name);
            }
            if existing.port == ic.port {
                bail!("duplicate port: {}", ic.port);
            }
        }
        cfg.instances.push(ic);
        self.save_locked(&cfg)
    }

    pub fn update_instance(&self, name: &str, ic: InstanceConf) -> Result<()> {
        let mut cfg = self.write();
        let Some(idx) = cfg.instances.iter().position(|e| e.name == name) else {
            bail!("instance {name:?} not found");
        };
        for (j, other) in cfg.instances.iter().enumerate() {
            if j == idx {
                continue;
            }
            if other.port == ic.port {
                bail!("duplicate port: {}", ic.port);
            }
            if other.name == ic.name {
                bail!("duplicate instance name: {:?}", ic.name);
            }
        }
        cfg.instances[idx] = ic;
        self.save_locked(&cfg)
    }

    pub fn delete_instance(&self, name: &str) -> Result<()> {
        let mut cfg = self.write();
        let Some(idx) = cfg.instances.iter().position(|e| e.name == name) else {
            bail!("instance {name:?} not found");
        };
        cfg.instances.remove(idx);
        self.save_locked(&cfg)
    }

    /// Persist the raw upload and fold its scalar fields into the live config.
    /// The caller has already validated `patch` by parsing it.
    pub fn apply_patch(&self, raw: &str, patch: ConfigPatch) -> Result<()> {
        let mut cfg = self.write();
        if !self.path.as_os_str().is_empty() {
            std::fs::write(&self.path, raw)
                .with_context(|| format!("writing config {}", self.path.display()))?;
        }
        if let Some(v) = patch.server_bin.filter(|v| !v.is_empty()) {
            cfg.server_bin = v;
        }
        if let Some(v) = patch.host.filter(|v| !v.is_empty()) {
            cfg.host = v;
        }
        if let Some(v) = patch.gpu_backend {
            cfg.gpu_backend = v;
        }
        if let Some(v) = patch.restart_delay.filter(|v| !v.0.is_zero()) {
            cfg.restart_delay = v;
        }
        if let Some(v) = patch.health_check_interval.filter(|v| !v.0.is_zero()) {
            cfg.health_check_interval = v;
        }
        if let Some(v) = patch.max_restarts.filter(|v| *v > 0) {
            cfg.max_restarts = v;
        }
        if let Some(v) = patch.ngl.filter(|v| *v > 0) {
            cfg.ngl = v;
        }
        if let Some(v) = patch.context_length.filter(|v| *v > 0) {
            cfg.context_length = v;
        }
        if let Some(v) = patch.cache_type_k.filter(|v| !v.is_empty()) {
            cfg.cache_type_k = v;
        }
        if let Some(v) = patch.cache_type_v.filter(|v| !v.is_empty()) {
            cfg.cache_type_v = v;
        }
        Ok(())
    }

    fn save_locked(&self, cfg: &Config) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        let data = serde_yaml::to_string(cfg).context("marshaling config")?;
        std::fs::write(&self.path, data)
            .with_context(|| format!("writing config {}", self.path.display()))
    }
}
