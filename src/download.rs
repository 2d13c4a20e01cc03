//! Single-slot model prefetch: runs the server binary against a Hugging Face
//! repo on port 0 and watches its logs for proof the download finished.

use std::collections::BTreeSet;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::duration::format_human;
use crate::ring::LogRing;

const LOG_CAPACITY: usize = 500;
const QUANTS_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    Downloading,
    Done,
    Failed,
    Stopped,
}

pub struct DownloadManager {
    server_bin: String,
    active: Mutex<Option<Arc<DownloadJob>>>,
}

struct DownloadJob {
    repo: String,
    quant: String,
    started: Instant,
    /// Fires when the job should die: user stop or the completion heuristic.
    /// The exit observer owns the child and performs the SIGKILL.
    cancel: CancellationToken,
    inner: Mutex<JobInner>,
}

struct JobInner {
    status: DownloadState,
    logs: LogRing,
}

#[derive(Debug, Default, Serialize)]
pub struct DownloadStatus {
    pub active: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub repo: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub quant: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<DownloadState>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub elapsed: String,
}

impl DownloadJob {
    fn lock(&self) -> MutexGuard<'_, JobInner> {
        self.inner.lock().expect("download job lock poisoned")
    }

    fn status(&self) -> DownloadState {
        self.lock().status
    }

    async fn drain<R: AsyncRead + Unpin>(self: Arc<Self>, reader: R) {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut inner = self.lock();
            let ready = is_server_ready_line(&line);
            inner.logs.push(line);
            if ready && inner.status == DownloadState::Downloading {
                // The server came up, so the model is cached; we are done
                // with the child.
                inner.status = DownloadState::Done;
                inner
                    .logs
                    .push("model downloaded, stopping server".to_string());
                self.cancel.cancel();
            }
        }
    }
}

impl DownloadManager {
    pub fn new(server_bin: String) -> Self {
        Self {
            server_bin,
            active: Mutex::new(None),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<DownloadJob>>> {
        self.active.lock().expect("download slot lock poisoned")
    }

    /// Begin a prefetch. Fails while a download is in flight; a finished job
    /// in any terminal state is replaced.
    pub fn start(&self, repo: &str, quant: &str) -> Result<()> {
        let mut slot = self.slot();
        if let Some(job) = slot.as_ref() {
            if job.status() == DownloadState::Downloading {
                bail!("download already in progress: {}:{}", job.repo, job.quant);
            }
        }

        let model = if quant.is_empty() {
            repo.to_string()
        } else {
            format!("{repo}:{quant}")
        };

        let mut cmd = Command::new(&self.server_bin);
        cmd.args(["-hf", &model, "--port", "0"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().context("starting download")?;
        let stdout = child.stdout.take().context("stdout pipe")?;
        let stderr = child.stderr.take().context("stderr pipe")?;

        let job = Arc::new(DownloadJob {
            repo: repo.to_string(),
            quant: quant.to_string(),
            started: Instant::now(),
            cancel: CancellationToken::new(),
            inner: Mutex::new(JobInner {
                status: DownloadState::Downloading,
                logs: LogRing::new(LOG_CAPACITY),
            }),
        });
        *slot = Some(job.clone());

        info!("[download] started: {model}");

        tokio::spawn(job.clone().drain(stdout));
        tokio::spawn(job.clone().drain(stderr));

        let observer = job.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = observer.cancel.cancelled() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            let mut inner = observer.lock();
            match inner.status {
                DownloadState::Stopped => {}
                DownloadState::Downloading => match status {
                    Ok(st) if st.success() => {
                        inner.status = DownloadState::Done;
                        inner.logs.push("download complete".to_string());
                        info!("[download] completed: {model}");
                    }
                    Ok(st) => {
                        inner.status = DownloadState::Failed;
                        inner.logs.push(format!("process exited: {st}"));
                        warn!("[download] failed: {model} - {st}");
                    }
                    Err(err) => {
                        inner.status = DownloadState::Failed;
                        inner.logs.push(format!("process exited: {err}"));
                        warn!("[download] failed: {model} - {err}");
                    }
                },
                // The completion heuristic already settled the job.
                _ => {}
            }
        });

        Ok(())
    }

    /// Kill the current download, whatever state it is in.
    pub fn stop(&self) {
        let slot = self.slot();
        let Some(job) = slot.as_ref() else { return };
        {
            let mut inner = job.lock();
            inner.status = DownloadState::Stopped;
            inner.logs.push("download stopped by user".to_string());
        }
        job.cancel.cancel();
        info!("[download] stopped by user");
    }

    pub fn status(&self) -> DownloadStatus {
        let slot = self.slot();
        let Some(job) = slot.as_ref() else {
            return DownloadStatus::default();
        };
        let inner = job.lock();
        DownloadStatus {
            active: inner.status == DownloadState::Downloading,
            repo: job.repo.clone(),
            quant: job.quant.clone(),
            status: Some(inner.status),
            logs: inner.logs.snapshot(),
            elapsed: format_human(job.started.elapsed()),
        }
    }
}

/// A line proving the server finished loading, i.e. the model is fully
/// present in the local cache.
fn is_server_ready_line(line: &str) -> bool {
    line.contains("listening on") || line.contains("all slots are idle")
}

#[derive(Debug, Deserialize)]
struct RepoInfo {
    #[serde(default)]
    siblings: Vec<RepoFile>,
}

#[derive(Debug, Deserialize)]
struct RepoFile {
    rfilename: String,
}

fn quant_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-([A-Za-z0-9_]+)\.gguf$").expect("quant pattern"))
}

/// Ask the Hugging Face API which quantizations a repo ships, judging by its
/// `.gguf` file names.
pub async fn fetch_quants(repo: &str) -> Result<Vec<String>> {
    let url = format!("https://huggingface.co/api/models/{repo}");
    let resp = reqwest::Client::new()
        .get(&url)
        .timeout(QUANTS_TIMEOUT)
        .send()
        .await
        .context("fetching repo info")?;
    if resp.status() != reqwest::StatusCode::OK {
        bail!("HuggingFace API returned {}", resp.status().as_u16());
    }
    let info: RepoInfo = resp.json().await.context("decoding response")?;
    Ok(quants_from_files(
        info.siblings.iter().map(|s| s.rfilename.as_str()),
    ))
}

fn quants_from_files<'a>(files: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut quants = BTreeSet::new();
    for name in files {
        if !name.ends_with(".gguf") {
            continue;
        }
        if let Some(caps) = quant_pattern().captures(name) {
            quants.insert(caps[1].to_string());
        }
    }
    quants.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_server_ready_lines() {
        assert!(is_server_ready_line(
            "main: server is listening on http://127.0.0.1:8080"
        ));
        assert!(is_server_ready_line("srv  update_slots: all slots are idle"));
        assert!(!is_server_ready_line("downloading model shard 2/5"));
    }

    #[test]
    fn extracts_sorted_unique_quants() {
        let files = [
            "tiny-Q4_K_M.gguf",
            "tiny-Q4_K_M.gguf.part",
            "tiny-Q8_0.gguf",
            "big-Q8_0.gguf",
            "tiny-IQ2_XS.gguf",
            "README.md",
            "plain.gguf",
        ];
        let quants = quants_from_files(files.iter().copied());
        assert_eq!(quants, vec!["IQ2_XS", "Q4_K_M", "Q8_0"]);
    }

    #[tokio::test]
    async fn spawn_failure_leaves_the_slot_empty() {
        let dm = DownloadManager::new("/nonexistent/llama-server".to_string());
        assert!(dm.start("org/repo", "Q4_K_M").is_err());
        assert!(!dm.status().active);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slot_is_single_occupancy_until_terminal() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-server.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let dm = DownloadManager::new(script.display().to_string());
        dm.start("org/repo", "Q4_K_M").unwrap();
        let status = dm.status();
        assert!(status.active);
        assert_eq!(status.repo, "org/repo");
        assert_eq!(status.quant, "Q4_K_M");
        assert!(dm.start("org/other", "").is_err());

        dm.stop();
        assert_eq!(dm.status().status, Some(DownloadState::Stopped));
        assert!(!dm.status().active);

        // A stopped slot can be replaced.
        dm.start("org/other", "").unwrap();
        assert!(dm.status().active);
        dm.stop();
        // Let the exit observers reap the killed children.
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
