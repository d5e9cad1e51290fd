//! Node: aggregates identity, state, and per-role subsystems on one host.
//!
//! Grounded on `cluster/node.rs` (identity/capability fields, builder style)
//! and `cluster/mod.rs`'s subsystem-oriented module doc; `SubsystemManager`'s
//! ordered start with reverse-order rollback is new, modeled on
//! `cluster/orchestrator.rs::spawn_orchestrator`'s structured startup
//! logging.

pub mod info;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cluster::executor::{CommandExecutor, ExecutorSettings};
use crate::cluster::heartbeat::{self, HeartbeatSettings};
use crate::cluster::registry::ClientRegistry;
use crate::cluster::result_store::CommandResultStore;
use crate::cluster::scheduler::{Scheduler, SchedulerSettings};
use crate::cluster::types::{NodeRole, NodeState};
use crate::models::{LoadOptions, ModelRegistry};
use crate::monitor::ResourceMonitor;
use crate::supervisor::port::PortAllocator;
use crate::supervisor::ProcessSupervisor;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("subsystem {0} failed to start: {1}")]
    SubsystemStartFailed(String, String),
    #[error("node is already running")]
    AlreadyRunning,
    #[error("role changes are forbidden while the node is running")]
    RoleChangeForbidden,
}

/// Everything `Node::new` needs, collected in one place so config loading
/// has a single target struct to populate.
pub struct NodeParams {
    pub id: String,
    pub name: String,
    pub role: NodeRole,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub master_address: Option<String>,
    pub scan_roots: Vec<PathBuf>,
    pub catalog_path: PathBuf,
    pub port_range: (u16, u16),
    pub heartbeat: HeartbeatSettings,
    pub scheduler: SchedulerSettings,
    pub executor: ExecutorSettings,
    pub supports_inference: bool,
    /// Binary path / readiness marker resolved from the node's configured
    /// inference binaries, used as the Command Executor's baseline
    /// `load_model` options.
    pub load_defaults: LoadOptions,
}

/// Shared state reachable from every subsystem. No subsystem struct
/// (`CommandExecutor`, `Scheduler`, `ClientRegistry`) stores a handle back
/// to this at all; only the task closures `Node::start_subsystem` spawns
/// hold a cloned `Arc`, for their own lifetime. See the back-reference
/// design note in DESIGN.md.
pub struct NodeShared {
    pub id: String,
    pub name: RwLock<String>,
    pub role: NodeRole,
    pub address: String,
    pub port: u16,
    pub status: RwLock<NodeState>,
    pub tags: RwLock<Vec<String>>,
    pub metadata: RwLock<HashMap<String, String>>,
    pub created_at: DateTime<Utc>,
    pub started_at: RwLock<Option<DateTime<Utc>>>,
    pub supports_inference: bool,
    pub master_address: Option<String>,

    pub resource_monitor: Arc<ResourceMonitor>,
    pub model_registry: Arc<ModelRegistry>,
    pub port_allocator: Arc<PortAllocator>,
    pub process_supervisor: Arc<ProcessSupervisor>,
    pub command_executor: Arc<CommandExecutor>,
    pub client_registry: Option<Arc<ClientRegistry>>,
    pub scheduler: Option<Arc<Scheduler>>,
    pub result_store: Option<Arc<CommandResultStore>>,
    pub heartbeat_settings: HeartbeatSettings,

    pub http_client: reqwest::Client,
}

/// One running background activity, tracked so `Stop()` can join it and a
/// partial `Start()` failure can roll earlier ones back.
struct RunningSubsystem {
    name: &'static str,
    handle: JoinHandle<()>,
}

pub struct Node {
    pub shared: Arc<NodeShared>,
    running: RwLock<Vec<RunningSubsystem>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Subsystems appropriate to each role, in required start order. `commands`
/// and `resource` entries are shared by more than one role. `dispatcher` and
/// `sweep` run only where a scheduler / client registry exist, i.e. on
/// MASTER and HYBRID.
pub fn subsystems_for_role(role: NodeRole) -> Vec<&'static str> {
    match role {
        NodeRole::Standalone => vec!["resource"],
        NodeRole::Client => vec!["registration", "heartbeat", "resource"],
        NodeRole::Hybrid => vec!["registration", "heartbeat", "commands", "dispatcher", "sweep", "resource"],
        NodeRole::Master => vec!["commands", "dispatcher", "sweep", "resource"],
    }
}

impl Node {
    pub fn new(params: NodeParams) -> Self {
        let model_registry = ModelRegistry::new(params.scan_roots, params.catalog_path);
        let port_allocator = Arc::new(PortAllocator::new(params.port_range.0, params.port_range.1));
        let process_supervisor = ProcessSupervisor::new();
        let command_executor = CommandExecutor::with_load_defaults(
            params.executor,
            Arc::clone(&model_registry),
            Arc::clone(&process_supervisor),
            Arc::clone(&port_allocator),
            params.load_defaults,
        );

        let client_registry = params.role.is_master().then(ClientRegistry::new);
        let result_store = params.role.is_master().then(|| Arc::new(CommandResultStore::new()));
        let scheduler = params.role.is_master().then(|| {
            Scheduler::new(
                params.scheduler,
                client_registry.clone().unwrap(),
                result_store.clone().unwrap(),
            )
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(NodeShared {
            id: params.id,
            name: RwLock::new(params.name),
            role: params.role,
            address: params.address,
            port: params.port,
            status: RwLock::new(NodeState::Offline),
            tags: RwLock::new(params.tags),
            metadata: RwLock::new(params.metadata),
            created_at: Utc::now(),
            started_at: RwLock::new(None),
            supports_inference: params.supports_inference,
            master_address: params.master_address,
            resource_monitor: Arc::new(ResourceMonitor::new()),
            model_registry,
            port_allocator,
            process_supervisor,
            command_executor,
            client_registry,
            scheduler,
            result_store,
            heartbeat_settings: params.heartbeat,
            http_client: reqwest::Client::new(),
        });

        Self {
            shared,
            running: RwLock::new(Vec::new()),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub async fn start(&self) -> Result<(), NodeError> {
        if *self.shared.status.read().await != NodeState::Offline {
            return Err(NodeError::AlreadyRunning);
        }

        let order = subsystems_for_role(self.shared.role);
        let mut started = Vec::new();

        for name in order {
            match self.start_subsystem(name).await {
                Ok(handle) => started.push(RunningSubsystem { name, handle }),
                Err(e) => {
                    error!(subsystem = name, error = %e, "subsystem failed to start, rolling back");
                    for running in started.into_iter().rev() {
                        running.handle.abort();
                    }
                    *self.shared.status.write().await = NodeState::Error;
                    return Err(NodeError::SubsystemStartFailed(name.to_string(), e));
                }
            }
        }

        *self.running.write().await = started;
        *self.shared.status.write().await = NodeState::Online;
        *self.shared.started_at.write().await = Some(Utc::now());
        info!(node_id = %self.shared.id, role = ?self.shared.role, "node started");
        Ok(())
    }

    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        *self.shared.status.write().await = NodeState::Offline;

        let running = std::mem::take(&mut *self.running.write().await);
        for subsystem in running.into_iter().rev() {
            if let Err(e) = subsystem.handle.await {
                if !e.is_cancelled() {
                    warn!(subsystem = subsystem.name, error = %e, "subsystem task panicked");
                }
            }
        }

        self.shared.process_supervisor.stop_all().await;
        info!(node_id = %self.shared.id, "node stopped");
    }

    async fn start_subsystem(&self, name: &str) -> Result<JoinHandle<()>, String> {
        let shared = Arc::clone(&self.shared);
        let shutdown_rx = self.shutdown_rx.clone();

        match name {
            "resource" => Ok(tokio::spawn(async move {
                shared.resource_monitor.clone().run(shutdown_rx).await;
            })),
            "registration" => {
                heartbeat::register_once(&shared).await;
                Ok(tokio::spawn(async move {
                    // Registration is one-shot; nothing to keep running.
                    let _ = shutdown_rx;
                    let _ = shared;
                }))
            }
            "heartbeat" => Ok(tokio::spawn(async move {
                heartbeat::run_heartbeat_loop(shared, shutdown_rx).await;
            })),
            "commands" => {
                let addr = format!("0.0.0.0:{}", shared.port);
                let listener = tokio::net::TcpListener::bind(&addr)
                    .await
                    .map_err(|e| format!("bind {addr}: {e}"))?;
                let app = crate::cluster::api::build_router(Arc::clone(&shared));
                Ok(tokio::spawn(async move {
                    let mut shutdown_rx = shutdown_rx;
                    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                        let _ = shutdown_rx.changed().await;
                    });
                    if let Err(e) = serve.await {
                        error!(error = %e, "HTTP API server exited with error");
                    }
                }))
            }
            "dispatcher" => {
                let scheduler = shared
                    .scheduler
                    .clone()
                    .ok_or_else(|| "node has no scheduler".to_string())?;
                Ok(tokio::spawn(async move {
                    scheduler.run_dispatcher(shutdown_rx).await;
                }))
            }
            "sweep" => {
                let client_registry = shared
                    .client_registry
                    .clone()
                    .ok_or_else(|| "node has no client registry".to_string())?;
                Ok(tokio::spawn(async move {
                    client_registry.run_sweep(shutdown_rx).await;
                }))
            }
            other => Err(format!("unknown subsystem {other}")),
        }
    }
}
