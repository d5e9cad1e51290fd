//! Command Executor: bounded-concurrency dispatcher of typed commands
//! inside a node, run by MASTER and HYBRID nodes (and reachable on CLIENT
//! nodes that expose `/api/client/commands`).
//!
//! Grounded on the teacher's semaphore-gated dispatch pattern in
//! `runtime/runner.rs` (acquire with a timeout, release on every exit path)
//! generalized from "one inference worker at a time" to "N commands of any
//! recognized type at a time". The in-flight table and its
//! graceful-then-kill cancellation follow `supervisor/mod.rs`'s
//! `ProcessSupervisor::stop`/`request_graceful_stop` pair, keyed by command
//! id instead of model id and signaling by pid rather than a held `Child`,
//! since a command's cancel path runs concurrently with the task awaiting
//! that same child.

use std::collections::HashSet;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tokio::process::Command as TokioCommand;
use tokio::sync::{watch, Semaphore};
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::types::{Command, CommandResult, CommandType};
use crate::models::{LoadOptions, ModelRegistry};
use crate::supervisor::port::PortAllocator;
use crate::supervisor::ProcessSupervisor;

/// Grace window between a cancelled command's graceful signal and a
/// forceful kill, matching `supervisor::GRACE_WINDOW`.
const CANCEL_GRACE_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub max_concurrent: usize,
    pub default_timeout: Duration,
    pub allowed_commands: HashSet<CommandType>,
    pub acquire_timeout: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            default_timeout: Duration::from_secs(3600),
            allowed_commands: [
                CommandType::LoadModel,
                CommandType::UnloadModel,
                CommandType::RunInference,
                CommandType::StopProcess,
                CommandType::UpdateConfig,
                CommandType::CollectLogs,
                CommandType::ScanModels,
            ]
            .into_iter()
            .collect(),
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("command id is missing or empty")]
    InvalidId,
    #[error("command type {0:?} is not in the allow-list")]
    NotAllowed(CommandType),
    #[error("no executor slot available within the acquisition timeout")]
    SemaphoreTimeout,
    #[error("command {0} is not in flight")]
    NotInFlight(Uuid),
}

/// One in-flight command: a cancel signal, and the pid of the child process
/// it owns, if any (only `run_inference` owns one directly).
struct InFlightCommand {
    cancel_tx: watch::Sender<bool>,
    pid: Option<u32>,
}

pub struct CommandExecutor {
    settings: ExecutorSettings,
    semaphore: Arc<Semaphore>,
    model_registry: Arc<ModelRegistry>,
    process_supervisor: Arc<ProcessSupervisor>,
    port_allocator: Arc<PortAllocator>,
    base_load_options: LoadOptions,
    in_flight: DashMap<Uuid, InFlightCommand>,
}

impl CommandExecutor {
    pub fn new(
        settings: ExecutorSettings,
        model_registry: Arc<ModelRegistry>,
        process_supervisor: Arc<ProcessSupervisor>,
        port_allocator: Arc<PortAllocator>,
    ) -> Arc<Self> {
        Self::with_load_defaults(settings, model_registry, process_supervisor, port_allocator, LoadOptions::default())
    }

    /// `load_defaults` carries the binary directory/name and baseline
    /// flags resolved from node config; a `load_model` command's payload
    /// may override individual fields per request.
    pub fn with_load_defaults(
        settings: ExecutorSettings,
        model_registry: Arc<ModelRegistry>,
        process_supervisor: Arc<ProcessSupervisor>,
        port_allocator: Arc<PortAllocator>,
        load_defaults: LoadOptions,
    ) -> Arc<Self> {
        let semaphore = Arc::new(Semaphore::new(settings.max_concurrent));
        Arc::new(Self {
            settings,
            semaphore,
            model_registry,
            process_supervisor,
            port_allocator,
            base_load_options: load_defaults,
            in_flight: DashMap::new(),
        })
    }

    /// Validate, acquire a slot, run the type-specific handler, and return
    /// a `CommandResult` with elapsed duration. The slot is released on
    /// every exit path, including a handler panic (the `Semaphore` permit
    /// is dropped when `_permit` goes out of scope regardless of how the
    /// enclosing scope unwinds). The command is tracked in the in-flight
    /// table for the duration so `cancel` can locate it.
    pub async fn execute(&self, command: Command) -> Result<CommandResult, ExecutorError> {
        if command.id.is_nil() {
            return Err(ExecutorError::InvalidId);
        }
        if !self.settings.allowed_commands.contains(&command.command_type) {
            return Err(ExecutorError::NotAllowed(command.command_type));
        }

        let _permit = timeout(self.settings.acquire_timeout, self.semaphore.clone().acquire_owned())
            .await
            .map_err(|_| ExecutorError::SemaphoreTimeout)?
            .expect("semaphore is never closed");

        let per_command_timeout = command
            .timeout
            .map(Duration::from_secs)
            .map(|t| t.min(self.settings.default_timeout))
            .unwrap_or(self.settings.default_timeout);

        let started = Instant::now();
        let id = command.id;

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        self.in_flight.insert(id, InFlightCommand { cancel_tx, pid: None });

        let outcome = tokio::select! {
            result = timeout(per_command_timeout, self.dispatch(&command, id)) => {
                match result {
                    Ok(Ok(value)) => CommandResult::ok(id, value, started.elapsed().as_millis() as u64),
                    Ok(Err(message)) => CommandResult::err(id, message, started.elapsed().as_millis() as u64),
                    Err(_) => CommandResult::err(id, "command timed out".to_string(), started.elapsed().as_millis() as u64),
                }
            }
            _ = cancel_rx.changed() => {
                CommandResult::err(id, "command cancelled".to_string(), started.elapsed().as_millis() as u64)
            }
        };

        self.in_flight.remove(&id);
        Ok(outcome)
    }

    /// Cancel an in-flight command. Signals the command's own cancel
    /// channel (unblocks `execute`'s `select!` immediately) and, if the
    /// command owns a child process, sends it a graceful stop signal
    /// followed by a forceful kill after `CANCEL_GRACE_WINDOW`.
    pub async fn cancel(&self, id: Uuid) -> Result<(), ExecutorError> {
        let pid = {
            let entry = self.in_flight.get(&id).ok_or(ExecutorError::NotInFlight(id))?;
            let _ = entry.cancel_tx.send(true);
            entry.pid
        };

        let Some(pid) = pid else {
            return Ok(());
        };

        request_graceful_stop(pid);
        tokio::time::sleep(CANCEL_GRACE_WINDOW).await;
        if self.in_flight.contains_key(&id) {
            warn!(command_id = %id, pid, "command did not exit within grace window, killing");
            force_kill(pid);
        }

        Ok(())
    }

    async fn dispatch(&self, command: &Command, id: Uuid) -> Result<serde_json::Value, String> {
        match command.command_type {
            CommandType::LoadModel => self.handle_load_model(command).await,
            CommandType::UnloadModel => self.handle_unload_model(command).await,
            CommandType::RunInference => self.handle_run_inference(command, id).await,
            other => Err(format!("command type {other:?} is not implemented")),
        }
    }

    /// Start from the node's configured defaults and apply any fields the
    /// caller explicitly overrode in the command payload.
    fn resolve_load_options(&self, overrides: Option<&serde_json::Value>) -> LoadOptions {
        let mut options = self.base_load_options.clone();
        let Some(overrides) = overrides else {
            return options;
        };

        if let Some(v) = overrides.get("contextSize").and_then(|v| v.as_u64()) {
            options.context_size = v as u32;
        }
        if let Some(v) = overrides.get("threads").and_then(|v| v.as_u64()) {
            options.threads = v as u32;
        }
        if let Some(v) = overrides.get("gpuLayers").and_then(|v| v.as_u64()) {
            options.gpu_layers = v as u32;
        }
        if let Some(v) = overrides.get("flashAttention").and_then(|v| v.as_bool()) {
            options.flash_attention = v;
        }
        if let Some(v) = overrides.get("noMmap").and_then(|v| v.as_bool()) {
            options.no_mmap = v;
        }
        if let Some(v) = overrides.get("mlock").and_then(|v| v.as_bool()) {
            options.mlock = v;
        }
        if let Some(v) = overrides.get("readinessMarker").and_then(|v| v.as_str()) {
            options.readiness_marker = Some(v.to_string());
        }
        if let Some(v) = overrides.get("extraArgs").and_then(|v| v.as_array()) {
            options.extra_args = v.iter().filter_map(|a| a.as_str().map(str::to_string)).collect();
        }
        options
    }

    async fn handle_load_model(&self, command: &Command) -> Result<serde_json::Value, String> {
        let model_id = command
            .payload
            .get("modelId")
            .and_then(|v| v.as_str())
            .ok_or("payload missing modelId")?;

        let options = self.resolve_load_options(command.payload.get("options"));

        let outcome = self
            .model_registry
            .load_model(model_id, &self.process_supervisor, &self.port_allocator, options)
            .await
            .map_err(|e| e.to_string())?;

        Ok(serde_json::json!({
            "modelId": outcome.model_id,
            "port": outcome.port,
            "durationMillis": outcome.duration_millis,
        }))
    }

    async fn handle_unload_model(&self, command: &Command) -> Result<serde_json::Value, String> {
        let model_id = command
            .payload
            .get("modelId")
            .and_then(|v| v.as_str())
            .ok_or("payload missing modelId")?;

        self.model_registry
            .unload_model(model_id, &self.process_supervisor, &self.port_allocator)
            .await
            .map_err(|e| e.to_string())?;

        Ok(serde_json::json!({"modelId": model_id, "unloaded": true}))
    }

    async fn handle_run_inference(&self, command: &Command, id: Uuid) -> Result<serde_json::Value, String> {
        let binary_path = command
            .payload
            .get("binaryPath")
            .and_then(|v| v.as_str())
            .ok_or("payload missing binaryPath")?;
        let model_path = command
            .payload
            .get("modelPath")
            .and_then(|v| v.as_str())
            .ok_or("payload missing modelPath")?;
        let extra_args: Vec<String> = command
            .payload
            .get("args")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        let mut child = TokioCommand::new(binary_path)
            .arg("-m")
            .arg(model_path)
            .args(&extra_args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to spawn inference binary: {e}"))?;

        if let Some(pid) = child.id() {
            if let Some(mut entry) = self.in_flight.get_mut(&id) {
                entry.pid = Some(pid);
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| format!("failed to run inference binary: {e}"))?;

        Ok(serde_json::json!({
            "exitCode": output.status.code(),
            "stdout": String::from_utf8_lossy(&output.stdout),
            "stderr": String::from_utf8_lossy(&output.stderr),
        }))
    }
}

#[cfg(unix)]
fn request_graceful_stop(pid: u32) {
    // SAFETY: `pid` is a live child process id owned by this executor.
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn request_graceful_stop(_pid: u32) {}

#[cfg(unix)]
fn force_kill(pid: u32) {
    // SAFETY: `pid` is a live child process id owned by this executor.
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn force_kill(_pid: u32) {
    info!("forceful kill by pid is unix-only; relying on kill_on_drop");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::types::CommandType;
    use std::path::PathBuf;

    fn test_executor() -> Arc<CommandExecutor> {
        let registry = ModelRegistry::new(vec![], PathBuf::from("/tmp/llmesh-test-catalog.json"));
        let supervisor = ProcessSupervisor::new();
        let ports = Arc::new(PortAllocator::new(40000, 40100));
        CommandExecutor::new(ExecutorSettings::default(), registry, supervisor, ports)
    }

    #[tokio::test]
    async fn rejects_command_not_in_allow_list() {
        let mut settings = ExecutorSettings::default();
        settings.allowed_commands = [CommandType::ScanModels].into_iter().collect();
        let registry = ModelRegistry::new(vec![], PathBuf::from("/tmp/llmesh-test-catalog-2.json"));
        let supervisor = ProcessSupervisor::new();
        let ports = Arc::new(PortAllocator::new(40000, 40100));
        let executor = CommandExecutor::new(settings, registry, supervisor, ports);

        let command = Command::new(CommandType::LoadModel, serde_json::json!({}));
        let result = executor.execute(command).await;
        assert!(matches!(result, Err(ExecutorError::NotAllowed(_))));
    }

    #[tokio::test]
    async fn unimplemented_type_reports_not_implemented() {
        let executor = test_executor();
        let command = Command::new(CommandType::UpdateConfig, serde_json::json!({}));
        let result = executor.execute(command).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("not implemented"));
    }

    #[tokio::test]
    async fn nil_command_id_is_rejected() {
        let executor = test_executor();
        let mut command = Command::new(CommandType::ScanModels, serde_json::json!({}));
        command.id = Uuid::nil();
        let result = executor.execute(command).await;
        assert!(matches!(result, Err(ExecutorError::InvalidId)));
    }

    #[tokio::test]
    async fn cancel_unknown_command_errors() {
        let executor = test_executor();
        let result = executor.cancel(Uuid::new_v4()).await;
        assert!(matches!(result, Err(ExecutorError::NotInFlight(_))));
    }

    #[tokio::test]
    async fn cancel_interrupts_in_flight_command() {
        let executor = test_executor();
        let mut command = Command::new(CommandType::RunInference, serde_json::json!({
            "binaryPath": "/bin/sh",
            "modelPath": "-c",
            "args": ["sleep 60"],
        }));
        command.id = Uuid::new_v4();
        let id = command.id;

        let executor_for_run = executor.clone();
        let run = tokio::spawn(async move { executor_for_run.execute(command).await });

        // Give the handler a moment to spawn the child and register its pid.
        tokio::time::sleep(Duration::from_millis(200)).await;
        executor.cancel(id).await.unwrap();

        let result = run.await.unwrap().unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("command cancelled"));
    }
}
