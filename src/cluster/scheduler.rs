//! Scheduler (master-side): task queue, node-selection policy, and HTTP
//! dispatch onto the chosen node's Command Executor.
//!
//! Grounded on `orchestrator.rs::spawn_orchestrator`'s reconcile-loop shape
//! (ticker + shutdown `watch`, HTTP client with a fixed request timeout) and
//! `scoring.rs`'s resource-aware node comparison, generalized from pipeline
//! replica placement to per-task node selection.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use reqwest::Client;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::registry::ClientRegistry;
use super::result_store::CommandResultStore;
use super::types::{Command, CommandResult, NodeState, Task, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingStrategy {
    RoundRobin,
    LeastLoaded,
    ResourceAware,
}

impl SchedulingStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "round_robin" => Some(Self::RoundRobin),
            "least_loaded" => Some(Self::LeastLoaded),
            "resource_aware" => Some(Self::ResourceAware),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub strategy: SchedulingStrategy,
    pub max_queue_size: usize,
    pub offer_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            strategy: SchedulingStrategy::RoundRobin,
            max_queue_size: 1024,
            offer_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task queue is full")]
    QueueFull,
    #[error("task {0} not found")]
    NotFound(Uuid),
    #[error("task {0} is not in a cancellable state")]
    NotCancellable(Uuid),
    #[error("task {0} is not in a retryable state")]
    NotRetryable(Uuid),
}

pub struct Scheduler {
    tasks: DashMap<Uuid, Task>,
    queue_tx: mpsc::Sender<Uuid>,
    queue_rx: tokio::sync::Mutex<Option<mpsc::Receiver<Uuid>>>,
    registry: Arc<ClientRegistry>,
    settings: SchedulerSettings,
    http_client: Client,
    result_store: Arc<CommandResultStore>,
}

impl Scheduler {
    pub fn new(settings: SchedulerSettings, registry: Arc<ClientRegistry>, result_store: Arc<CommandResultStore>) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(settings.max_queue_size);
        Arc::new(Self {
            tasks: DashMap::new(),
            queue_tx,
            queue_rx: tokio::sync::Mutex::new(Some(queue_rx)),
            registry,
            settings,
            http_client: Client::new(),
            result_store,
        })
    }

    /// Submit a task. If `pin_to` is set, the task is pinned to that node
    /// and bypasses strategy selection at dispatch time.
    pub async fn submit(&self, task_type: super::types::CommandType, payload: serde_json::Value, pin_to: Option<String>) -> Result<Uuid, SchedulerError> {
        let task = Task::new(task_type, payload, pin_to);
        let id = task.id;
        self.tasks.insert(id, task);

        match tokio::time::timeout(self.settings.offer_timeout, self.queue_tx.send(id)).await {
            Ok(Ok(())) => Ok(id),
            _ => {
                self.tasks.remove(&id);
                Err(SchedulerError::QueueFull)
            }
        }
    }

    pub fn get(&self, task_id: Uuid) -> Option<Task> {
        self.tasks.get(&task_id).map(|t| t.clone())
    }

    pub fn list(&self) -> Vec<Task> {
        self.tasks.iter().map(|t| t.clone()).collect()
    }

    /// Look up a previously recorded `CommandResult` by command id. Entries
    /// age out of the bounded store oldest-completed-first.
    pub fn get_result(&self, command_id: Uuid) -> Option<CommandResult> {
        self.result_store.get(command_id)
    }

    pub fn cancel(&self, task_id: Uuid) -> Result<(), SchedulerError> {
        let mut task = self.tasks.get_mut(&task_id).ok_or(SchedulerError::NotFound(task_id))?;
        if task.status != TaskStatus::Pending {
            return Err(SchedulerError::NotCancellable(task_id));
        }
        task.status = TaskStatus::Cancelled;
        Ok(())
    }

    pub async fn retry(&self, task_id: Uuid) -> Result<(), SchedulerError> {
        {
            let mut task = self.tasks.get_mut(&task_id).ok_or(SchedulerError::NotFound(task_id))?;
            if !matches!(task.status, TaskStatus::Failed | TaskStatus::Cancelled) {
                return Err(SchedulerError::NotRetryable(task_id));
            }
            task.reset_for_retry();
        }

        if tokio::time::timeout(self.settings.offer_timeout, self.queue_tx.send(task_id))
            .await
            .is_err()
        {
            return Err(SchedulerError::QueueFull);
        }
        Ok(())
    }

    /// Run the single dispatcher loop until shutdown. Must be called at
    /// most once per `Scheduler`: takes ownership of the queue receiver.
    pub async fn run_dispatcher(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut queue_rx = match self.queue_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                error!("dispatcher already running for this scheduler");
                return;
            }
        };

        loop {
            tokio::select! {
                maybe_id = queue_rx.recv() => {
                    match maybe_id {
                        Some(task_id) => self.dispatch_one(task_id).await,
                        None => return,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn dispatch_one(&self, task_id: Uuid) {
        let Some(mut task) = self.tasks.get_mut(&task_id).map(|t| t.clone()) else {
            return;
        };

        let target = match &task.assigned_to {
            Some(node_id) => match self.registry.get(node_id) {
                Some(info) if info.status == NodeState::Online || info.status == NodeState::Busy => Some(info),
                _ => {
                    task.status = TaskStatus::Failed;
                    task.error = Some(format!("pinned node {node_id} is not available"));
                    self.tasks.insert(task_id, task);
                    return;
                }
            },
            None => self.select_node(&task),
        };

        let Some(target) = target else {
            // No eligible node right now: leave PENDING for a future retry.
            return;
        };

        task.assigned_to = Some(target.id.clone());
        task.status = TaskStatus::Running;
        task.started_at = Some(chrono::Utc::now());
        self.tasks.insert(task_id, task.clone());

        let command = Command::new(task.task_type, task.payload.clone());
        let url = format!("http://{}:{}/api/client/commands", target.address, target.port);
        let started = std::time::Instant::now();

        let outcome = self
            .http_client
            .post(&url)
            .json(&command)
            .timeout(self.settings.request_timeout)
            .send()
            .await;

        let mut final_task = task;
        final_task.completed_at = Some(chrono::Utc::now());

        match outcome {
            Ok(response) if response.status().is_success() => match response.json::<CommandResult>().await {
                Ok(result) => {
                    final_task.status = TaskStatus::Completed;
                    final_task.result = result.result.clone();
                    if !result.success {
                        final_task.status = TaskStatus::Failed;
                        final_task.error = result.error.clone();
                    }
                    self.result_store.record(result);
                }
                Err(e) => {
                    final_task.status = TaskStatus::Failed;
                    final_task.error = Some(format!("malformed command result: {e}"));
                }
            },
            Ok(response) => {
                final_task.status = TaskStatus::Failed;
                final_task.error = Some(format!("node returned {}", response.status()));
            }
            Err(e) => {
                final_task.status = TaskStatus::Failed;
                final_task.error = Some(e.to_string());
            }
        }

        if final_task.status == TaskStatus::Failed {
            warn!(task_id = %task_id, node = %target.id, error = ?final_task.error, "task dispatch failed");
        } else {
            info!(task_id = %task_id, node = %target.id, elapsed_ms = started.elapsed().as_millis(), "task completed");
        }

        self.tasks.insert(task_id, final_task);
    }

    fn select_node(&self, task: &Task) -> Option<super::types::NodeInfo> {
        let candidates = self.registry.list_online();
        if candidates.is_empty() {
            return None;
        }

        match self.settings.strategy {
            SchedulingStrategy::RoundRobin | SchedulingStrategy::LeastLoaded => {
                candidates
                    .into_iter()
                    .min_by_key(|n| self.running_count_for(&n.id))
            }
            SchedulingStrategy::ResourceAware => candidates
                .into_iter()
                .max_by_key(|n| n.capabilities.memory_bytes),
        }
        .map(|n| {
            let _ = task;
            n
        })
    }

    fn running_count_for(&self, node_id: &str) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Running && t.assigned_to.as_deref() == Some(node_id))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::types::{CommandType, NodeCapabilities, NodeInfo, NodeRole};

    fn online_node(id: &str, memory_bytes: u64) -> NodeInfo {
        NodeInfo {
            id: id.to_string(),
            name: id.to_string(),
            role: NodeRole::Client,
            status: NodeState::Online,
            address: "127.0.0.1".to_string(),
            port: 9000,
            tags: vec![],
            metadata: Default::default(),
            capabilities: NodeCapabilities {
                cpu_count: 4,
                memory_bytes,
                gpu: vec![],
                supports_inference: true,
            },
            resources: None,
            created_at: chrono::Utc::now(),
            started_at: None,
        }
    }

    #[tokio::test]
    async fn submit_assigns_pending_state() {
        let registry = ClientRegistry::new();
        let scheduler = Scheduler::new(SchedulerSettings::default(), registry, Arc::new(CommandResultStore::new()));
        let id = scheduler.submit(CommandType::ScanModels, serde_json::json!({}), None).await.unwrap();
        let task = scheduler.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn resource_aware_picks_greatest_memory() {
        let registry = ClientRegistry::new();
        registry.register(online_node("small", 8_000_000_000));
        registry.register(online_node("large", 64_000_000_000));

        let settings = SchedulerSettings {
            strategy: SchedulingStrategy::ResourceAware,
            ..Default::default()
        };
        let scheduler = Scheduler::new(settings, registry, Arc::new(CommandResultStore::new()));
        let task = Task::new(CommandType::LoadModel, serde_json::json!({}), None);
        let chosen = scheduler.select_node(&task).unwrap();
        assert_eq!(chosen.id, "large");
    }

    #[tokio::test]
    async fn cancel_only_allowed_while_pending() {
        let registry = ClientRegistry::new();
        let scheduler = Scheduler::new(SchedulerSettings::default(), registry, Arc::new(CommandResultStore::new()));
        let id = scheduler.submit(CommandType::ScanModels, serde_json::json!({}), None).await.unwrap();
        assert!(scheduler.cancel(id).is_ok());
        assert!(matches!(scheduler.cancel(id), Err(SchedulerError::NotCancellable(_))));
    }

    #[test]
    fn strategy_parses_recognized_names() {
        assert_eq!(SchedulingStrategy::parse("round_robin"), Some(SchedulingStrategy::RoundRobin));
        assert_eq!(SchedulingStrategy::parse("resource_aware"), Some(SchedulingStrategy::ResourceAware));
        assert_eq!(SchedulingStrategy::parse("bogus"), None);
    }
}
