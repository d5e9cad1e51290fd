//! Scheduler dispatch integration tests: a master's `Scheduler` picking a
//! real node over HTTP, pinned-node failure, and task lifecycle.
//!
//! Grounded on `cluster/api.rs`'s `master_shared()` test helper and the
//! teacher's `remote_deployment.rs` localhost-multi-port style, adapted to
//! drive a real node's `/api/client/commands` endpoint from a real
//! `Scheduler::run_dispatcher`.

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use llmesh::cluster::registry::ClientRegistry;
use llmesh::cluster::scheduler::{Scheduler, SchedulerSettings};
use llmesh::cluster::types::{CommandType, NodeInfo, NodeRole, NodeState, TaskStatus};
use llmesh::models::ModelRegistry;
use llmesh::monitor::ResourceMonitor;
use llmesh::node::NodeShared;
use llmesh::supervisor::port::PortAllocator;
use llmesh::supervisor::ProcessSupervisor;
use tokio::sync::{watch, RwLock};
use tokio::time::sleep;

fn find_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn node_info(id: &str, port: u16, status: NodeState) -> NodeInfo {
    NodeInfo {
        id: id.to_string(),
        name: id.to_string(),
        role: NodeRole::Client,
        status,
        address: "127.0.0.1".to_string(),
        port,
        tags: vec![],
        metadata: Default::default(),
        capabilities: Default::default(),
        resources: None,
        created_at: chrono::Utc::now(),
        started_at: None,
    }
}

/// Start a bare worker node's HTTP API (commands endpoint only) on a real
/// port, returning the port and a shutdown handle.
async fn spawn_worker(port: u16) -> watch::Sender<bool> {
    let model_registry = ModelRegistry::new(vec![], std::env::temp_dir().join(format!("llmesh-test-{port}.json")));
    let shared = Arc::new(NodeShared {
        id: format!("worker-{port}"),
        name: RwLock::new(format!("worker-{port}")),
        role: NodeRole::Hybrid,
        address: "127.0.0.1".to_string(),
        port,
        status: RwLock::new(NodeState::Online),
        tags: RwLock::new(vec![]),
        metadata: RwLock::new(Default::default()),
        created_at: chrono::Utc::now(),
        started_at: RwLock::new(None),
        supports_inference: false,
        master_address: None,
        resource_monitor: Arc::new(ResourceMonitor::new()),
        model_registry: model_registry.clone(),
        port_allocator: Arc::new(PortAllocator::new(42000, 42100)),
        process_supervisor: ProcessSupervisor::new(),
        command_executor: llmesh::cluster::executor::CommandExecutor::new(
            Default::default(),
            model_registry,
            ProcessSupervisor::new(),
            Arc::new(PortAllocator::new(42000, 42100)),
        ),
        client_registry: None,
        scheduler: None,
        heartbeat_settings: Default::default(),
        http_client: reqwest::Client::new(),
    });

    let app = llmesh::cluster::api::build_router(shared);
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{port}")).await.unwrap();
    let (tx, mut rx) = watch::channel(false);
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = rx.changed().await;
            })
            .await
            .unwrap();
    });
    sleep(Duration::from_millis(100)).await;
    tx
}

/// S2: submit an unpinned `load_model` task against two ONLINE nodes with
/// no running tasks; expect dispatch to one of them and a terminal status.
#[tokio::test]
async fn unpinned_task_dispatches_to_an_online_node() {
    let port = find_available_port();
    let _shutdown = spawn_worker(port).await;

    let registry = ClientRegistry::new();
    registry.register(node_info("worker-a", port, NodeState::Online));
    registry.register(node_info("worker-b", find_available_port(), NodeState::Online));

    let scheduler = Scheduler::new(SchedulerSettings::default(), registry);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher = tokio::spawn(Scheduler::run_dispatcher(Arc::clone(&scheduler), shutdown_rx));

    let task_id = scheduler
        .submit(CommandType::ScanModels, serde_json::json!({}), None)
        .await
        .unwrap();

    let mut task = scheduler.get(task_id).unwrap();
    for _ in 0..50 {
        if task.status != TaskStatus::Pending {
            break;
        }
        sleep(Duration::from_millis(50)).await;
        task = scheduler.get(task_id).unwrap();
    }

    assert!(task.assigned_to.is_some());
    assert_ne!(task.status, TaskStatus::Pending);

    let _ = shutdown_tx.send(true);
    dispatcher.abort();
}

/// S3: a task pinned to an OFFLINE node fails immediately, naming the
/// pinned node.
#[tokio::test]
async fn pinned_task_to_offline_node_fails_immediately() {
    let registry = ClientRegistry::new();
    registry.register(node_info("offline-node", 9999, NodeState::Offline));

    let scheduler = Scheduler::new(SchedulerSettings::default(), registry);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher = tokio::spawn(Scheduler::run_dispatcher(Arc::clone(&scheduler), shutdown_rx));

    let task_id = scheduler
        .submit(CommandType::LoadModel, serde_json::json!({}), Some("offline-node".to_string()))
        .await
        .unwrap();

    let mut task = scheduler.get(task_id).unwrap();
    for _ in 0..50 {
        if task.status != TaskStatus::Pending {
            break;
        }
        sleep(Duration::from_millis(20)).await;
        task = scheduler.get(task_id).unwrap();
    }

    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().contains("offline-node"));

    let _ = shutdown_tx.send(true);
    dispatcher.abort();
}
