//! Enumeration of `.gguf` files in the llama.cpp download cache.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedModel {
    pub name: String,
    pub file_name: String,
    pub size_mb: u64,
    pub path: String,
}

/// Resolve the model cache directory: `LLAMA_CACHE` wins, then the platform
/// default used by llama.cpp itself.
pub fn cache_dir() -> PathBuf {
    if let Ok(env) = std::env::var("LLAMA_CACHE") {
        if !env.is_empty() {
            return PathBuf::from(env);
        }
    }
    let home = dirs::home_dir().unwrap_or_default();
    if cfg!(target_os = "macos") {
        home.join("Library").join("Caches").join("llama.cpp")
    } else if cfg!(target_os = "windows") {
        match std::env::var("LOCALAPPDATA") {
            Ok(local) if !local.is_empty() => PathBuf::from(local).join("llama.cpp"),
            _ => home.join("AppData").join("Local").join("llama.cpp"),
        }
    } else {
        match std::env::var("XDG_CACHE_HOME") {
            Ok(xdg) if !xdg.is_empty() => PathBuf::from(xdg).join("llama.cpp"),
            _ => home.join(".cache").join("llama.cpp"),
        }
    }
}

pub fn scan_cached_models() -> Result<Vec<CachedModel>> {
    scan_dir(&cache_dir())
}

fn scan_dir(dir: &Path) -> Result<Vec<CachedModel>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("reading cache dir {}", dir.display()))
        }
    };

    let mut models = Vec::new();
    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_dir() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let Some(name) = file_name.strip_suffix(".gguf") else {
            continue;
        };
        models.push(CachedModel {
            name: name.to_string(),
            file_name: file_name.clone(),
            size_mb: meta.len() / (1024 * 1024),
            path: dir.join(&file_name).display().to_string(),
        });
    }
    Ok(models)
}
