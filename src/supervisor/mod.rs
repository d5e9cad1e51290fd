//! Process Supervisor: owns the set of live worker processes, one per
//! loaded model.
//!
//! Grounded on `runtime/runner.rs::RunnerManager` end to end: a
//! `DashMap<String, _>` process table, `tokio::process::Command` spawn,
//! `wait_for_ready` as the HTTP-poll readiness fallback, and a
//! graceful-then-kill stop sequence. Stdout/stderr merging into one
//! per-model line stream follows `server/handlers.rs::stream_logs`.

pub mod argv;
pub mod port;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex as TokioMutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const GRACE_WINDOW: Duration = Duration::from_secs(5);
const READINESS_DEADLINE: Duration = Duration::from_secs(600);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);
const OUTPUT_BUFFER_LINES: usize = 256;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn worker process: {0}")]
    SpawnFailed(String),
    #[error("readiness not observed within {0:?}")]
    ReadinessTimeout(Duration),
    #[error("no worker process for model {0}")]
    NotFound(String),
}

/// A line from a worker's combined stdout+stderr, tagged by model and
/// stream.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub model_id: String,
    pub stream: OutputStream,
    pub line: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

pub type OutputHandler = Arc<dyn Fn(OutputLine) + Send + Sync>;

/// A live worker process, owned exclusively by the supervisor until reaped.
#[derive(Debug, Clone)]
pub struct WorkerProcess {
    pub id: String,
    pub name: String,
    pub pid: Option<u32>,
    pub port: u16,
    pub binary_path: PathBuf,
    pub argv: Vec<String>,
    pub started_at: DateTime<Utc>,
}

struct ProcessEntry {
    info: WorkerProcess,
    child: TokioMutex<Child>,
}

/// How the supervisor should detect that a worker has finished starting up.
pub enum ReadinessCheck {
    /// Watch stdout/stderr for a substring.
    Marker(String),
    /// No marker configured; poll `GET http://127.0.0.1:<port>/health`.
    HealthPoll,
}

pub struct ProcessSupervisor {
    processes: DashMap<String, ProcessEntry>,
}

impl ProcessSupervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            processes: DashMap::new(),
        })
    }

    /// Start a worker. Returns its process record and a one-shot receiver
    /// that fires `true` on readiness, `false` on failure/timeout.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        &self,
        model_id: &str,
        display_name: &str,
        executable: &Path,
        args: &[String],
        port: u16,
        readiness: ReadinessCheck,
        output_handler: Option<OutputHandler>,
    ) -> Result<(WorkerProcess, oneshot::Receiver<bool>), SupervisorError> {
        let mut command = Command::new(executable);
        command
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| SupervisorError::SpawnFailed(e.to_string()))?;

        let pid = child.id();
        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let (ready_tx, ready_rx) = oneshot::channel();

        let (line_tx, line_rx) = mpsc::channel::<OutputLine>(OUTPUT_BUFFER_LINES);
        spawn_line_reader(model_id.to_string(), OutputStream::Stdout, stdout, line_tx.clone());
        spawn_line_reader(model_id.to_string(), OutputStream::Stderr, stderr, line_tx);

        match readiness {
            ReadinessCheck::Marker(marker) => {
                spawn_output_dispatcher(line_rx, Some(marker), output_handler, Some(ready_tx));
            }
            ReadinessCheck::HealthPoll => {
                spawn_output_dispatcher(line_rx, None, output_handler, None);
                spawn_health_poll(port, ready_tx);
            }
        }

        let info = WorkerProcess {
            id: model_id.to_string(),
            name: display_name.to_string(),
            pid,
            port,
            binary_path: executable.to_path_buf(),
            argv: args.to_vec(),
            started_at: Utc::now(),
        };

        self.processes.insert(
            model_id.to_string(),
            ProcessEntry {
                info: info.clone(),
                child: TokioMutex::new(child),
            },
        );

        info!(model_id, pid, port, "worker process started");
        Ok((info, ready_rx))
    }

    /// Stop a worker: graceful signal, grace window, then forceful kill.
    /// Idempotent: stopping an unknown model is a no-op success.
    pub async fn stop(&self, model_id: &str) -> Result<(), SupervisorError> {
        let Some((_, entry)) = self.processes.remove(model_id) else {
            return Ok(());
        };

        let mut child = entry.child.lock().await;
        request_graceful_stop(&mut child);

        if timeout(GRACE_WINDOW, child.wait()).await.is_err() {
            warn!(model_id, "worker did not exit within grace window, killing");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }

        info!(model_id, "worker process stopped");
        Ok(())
    }

    pub fn get(&self, model_id: &str) -> Option<WorkerProcess> {
        self.processes.get(model_id).map(|e| e.info.clone())
    }

    pub fn list(&self) -> Vec<WorkerProcess> {
        self.processes.iter().map(|e| e.info.clone()).collect()
    }

    /// Stop every tracked worker. Used on node shutdown.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.processes.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                error!(model_id = %id, error = %e, "error stopping worker during shutdown");
            }
        }
    }
}

#[cfg(unix)]
fn request_graceful_stop(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: `pid` is this child's own OS process id, valid until reaped.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn request_graceful_stop(child: &mut Child) {
    let _ = child.start_kill();
}

fn spawn_line_reader<R>(model_id: String, stream: OutputStream, reader: R, tx: mpsc::Sender<OutputLine>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let item = OutputLine {
                        model_id: model_id.clone(),
                        stream,
                        line,
                    };
                    // Debugging channel, not a reliable transport: drop
                    // rather than block process I/O if the buffer is full.
                    let _ = tx.try_send(item);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(model_id, error = %e, "worker output stream closed with error");
                    break;
                }
            }
        }
    });
}

fn spawn_output_dispatcher(
    mut rx: mpsc::Receiver<OutputLine>,
    marker: Option<String>,
    output_handler: Option<OutputHandler>,
    ready_tx: Option<oneshot::Sender<bool>>,
) {
    tokio::spawn(async move {
        let mut ready_tx = ready_tx;
        while let Some(item) = rx.recv().await {
            if let Some(marker) = &marker {
                if item.line.contains(marker.as_str()) {
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(true);
                    }
                }
            }
            if let Some(handler) = &output_handler {
                handler(item);
            }
        }
    });
}

fn spawn_health_poll(port: u16, ready_tx: oneshot::Sender<bool>) {
    tokio::spawn(async move {
        let url = format!("http://127.0.0.1:{port}/health");
        let client = reqwest::Client::new();
        let deadline = tokio::time::Instant::now() + READINESS_DEADLINE;

        loop {
            if tokio::time::Instant::now() >= deadline {
                let _ = ready_tx.send(false);
                return;
            }
            match client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let _ = ready_tx.send(true);
                    return;
                }
                _ => tokio::time::sleep(HEALTH_POLL_INTERVAL).await,
            }
        }
    });
}
