//! HTTP API exposed by a node: `/api/master/nodes/register` and
//! `/api/master/heartbeat` on MASTER/HYBRID nodes, `/api/client/commands`
//! on any node that runs a Command Executor, plus a shared `/health`.
//!
//! Grounded on the teacher's `create_control_plane_router`, an
//! `axum::Router` built from a `State<T>` extractor and `IntoResponse`
//! handlers returning `(StatusCode, Json<_>)` pairs.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tracing::warn;

use super::types::{Command, Heartbeat, NodeInfo};
use crate::node::NodeShared;

pub fn build_router(shared: Arc<NodeShared>) -> Router {
    let mut router = Router::new().route("/health", get(health_check));

    if shared.role.is_master() {
        router = router
            .route("/api/master/nodes/register", post(register_node))
            .route("/api/master/heartbeat", post(heartbeat));
    }
    if shared.role.runs_commands() {
        router = router.route("/api/client/commands", post(run_command));
    }

    router.with_state(shared)
}

async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

async fn register_node(State(shared): State<Arc<NodeShared>>, Json(info): Json<NodeInfo>) -> impl IntoResponse {
    let Some(registry) = &shared.client_registry else {
        return (StatusCode::NOT_FOUND, Json(ErrorBody { error: "this node does not run a client registry".into() })).into_response();
    };
    registry.register(info);
    StatusCode::CREATED.into_response()
}

async fn heartbeat(State(shared): State<Arc<NodeShared>>, Json(heartbeat): Json<Heartbeat>) -> impl IntoResponse {
    let Some(registry) = &shared.client_registry else {
        return (StatusCode::NOT_FOUND, Json(ErrorBody { error: "this node does not run a client registry".into() })).into_response();
    };
    match registry.apply_heartbeat(heartbeat) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            warn!(error = %e, "heartbeat rejected");
            (StatusCode::NOT_FOUND, Json(ErrorBody { error: e.to_string() })).into_response()
        }
    }
}

async fn run_command(State(shared): State<Arc<NodeShared>>, Json(command): Json<Command>) -> impl IntoResponse {
    match shared.command_executor.execute(command).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(e) => {
            warn!(error = %e, "command rejected before execution");
            (StatusCode::BAD_REQUEST, Json(ErrorBody { error: e.to_string() })).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::executor::{CommandExecutor, ExecutorSettings};
    use crate::cluster::registry::ClientRegistry;
    use crate::cluster::result_store::CommandResultStore;
    use crate::cluster::scheduler::{Scheduler, SchedulerSettings};
    use crate::cluster::types::{CommandType, NodeRole, NodeState};
    use crate::models::ModelRegistry;
    use crate::monitor::ResourceMonitor;
    use crate::node::NodeShared;
    use crate::supervisor::port::PortAllocator;
    use crate::supervisor::ProcessSupervisor;
    use axum::body::Body;
    use axum::http::Request;
    use std::path::PathBuf;
    use tokio::sync::RwLock;
    use tower::ServiceExt;

    fn master_shared() -> Arc<NodeShared> {
        let model_registry = ModelRegistry::new(vec![], PathBuf::from("/tmp/llmesh-api-test-catalog.json"));
        let process_supervisor = ProcessSupervisor::new();
        let port_allocator = Arc::new(PortAllocator::new(41000, 41100));
        let client_registry = ClientRegistry::new();
        let command_executor = CommandExecutor::new(
            ExecutorSettings::default(),
            model_registry.clone(),
            process_supervisor.clone(),
            port_allocator.clone(),
        );
        let result_store = Arc::new(CommandResultStore::new());
        let scheduler = Scheduler::new(SchedulerSettings::default(), client_registry.clone(), result_store.clone());

        Arc::new(NodeShared {
            id: "master-1".to_string(),
            name: RwLock::new("master-1".to_string()),
            role: NodeRole::Master,
            address: "127.0.0.1".to_string(),
            port: 9100,
            status: RwLock::new(NodeState::Online),
            tags: RwLock::new(vec![]),
            metadata: RwLock::new(Default::default()),
            created_at: chrono::Utc::now(),
            started_at: RwLock::new(None),
            supports_inference: false,
            master_address: None,
            resource_monitor: Arc::new(ResourceMonitor::new()),
            model_registry,
            port_allocator,
            process_supervisor,
            command_executor,
            client_registry: Some(client_registry),
            scheduler: Some(scheduler),
            result_store: Some(result_store),
            heartbeat_settings: crate::cluster::heartbeat::HeartbeatSettings::default(),
            http_client: reqwest::Client::new(),
        })
    }

    #[tokio::test]
    async fn health_check_returns_200() {
        let router = build_router(master_shared());
        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn register_then_heartbeat_round_trips() {
        let shared = master_shared();
        let router = build_router(shared.clone());

        let info = NodeInfo {
            id: "node-1".to_string(),
            name: "node-1".to_string(),
            role: NodeRole::Client,
            status: NodeState::Online,
            address: "127.0.0.1".to_string(),
            port: 9001,
            tags: vec![],
            metadata: Default::default(),
            capabilities: Default::default(),
            resources: None,
            created_at: chrono::Utc::now(),
            started_at: None,
        };

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/master/nodes/register")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&info).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(shared.client_registry.as_ref().unwrap().get("node-1").is_some());

        let heartbeat_msg = Heartbeat {
            node_id: "node-1".to_string(),
            timestamp: chrono::Utc::now(),
            status: NodeState::Online,
            resources: None,
            sequence: 1,
        };
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/master/heartbeat")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&heartbeat_msg).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn command_endpoint_runs_executor() {
        let shared = master_shared();
        let router = build_router(shared);
        let command = Command::new(CommandType::ScanModels, serde_json::json!({}));

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/client/commands")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&command).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
