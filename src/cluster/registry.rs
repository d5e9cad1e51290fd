//! Client Registry: the master's view of every node that has registered or
//! sent a heartbeat, with a background sweep marking stale nodes OFFLINE.
//!
//! Grounded on `ClusterController`'s `DashMap<String, Node>` node table and
//! `ControllerConfig::node_heartbeat_timeout` (heartbeat interval x3); the
//! sweep loop follows `health_checker.rs`'s periodic-probe task shape.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use super::types::{Heartbeat, NodeInfo, NodeState};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("node {0} is not registered")]
    NotFound(String),
}

struct Entry {
    info: NodeInfo,
    last_seen: chrono::DateTime<Utc>,
}

/// Nodes that have not heartbeated within this many multiples of the
/// expected interval are swept to OFFLINE.
const OFFLINE_MULTIPLIER: u32 = 3;
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

pub struct ClientRegistry {
    nodes: DashMap<String, Entry>,
    heartbeat_interval: std::sync::Mutex<Duration>,
}

impl ClientRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: DashMap::new(),
            heartbeat_interval: std::sync::Mutex::new(Duration::from_secs(10)),
        })
    }

    pub fn set_expected_heartbeat_interval(&self, interval: Duration) {
        *self.heartbeat_interval.lock().unwrap() = interval;
    }

    pub fn register(&self, info: NodeInfo) {
        info!(node_id = %info.id, name = %info.name, role = ?info.role, "node registered");
        self.nodes.insert(
            info.id.clone(),
            Entry {
                info,
                last_seen: Utc::now(),
            },
        );
    }

    /// Apply a heartbeat: update status/resources and refresh `last_seen`.
    pub fn apply_heartbeat(&self, heartbeat: Heartbeat) -> Result<(), RegistryError> {
        let mut entry = self
            .nodes
            .get_mut(&heartbeat.node_id)
            .ok_or_else(|| RegistryError::NotFound(heartbeat.node_id.clone()))?;
        entry.info.status = heartbeat.status;
        entry.info.resources = heartbeat.resources;
        entry.last_seen = heartbeat.timestamp;
        Ok(())
    }

    pub fn get(&self, node_id: &str) -> Option<NodeInfo> {
        self.nodes.get(node_id).map(|e| e.info.clone())
    }

    pub fn list(&self) -> Vec<NodeInfo> {
        self.nodes.iter().map(|e| e.info.clone()).collect()
    }

    pub fn list_online(&self) -> Vec<NodeInfo> {
        self.nodes
            .iter()
            .filter(|e| e.info.status == NodeState::Online || e.info.status == NodeState::Busy)
            .map(|e| e.info.clone())
            .collect()
    }

    pub fn remove(&self, node_id: &str) {
        self.nodes.remove(node_id);
    }

    /// Mark nodes OFFLINE that have not been seen within the offline
    /// deadline. Returns the ids transitioned this pass.
    fn sweep_offline(&self) -> Vec<String> {
        let deadline = *self.heartbeat_interval.lock().unwrap() * OFFLINE_MULTIPLIER;
        let now = Utc::now();
        let mut went_offline = Vec::new();

        for mut entry in self.nodes.iter_mut() {
            if entry.info.status == NodeState::Offline {
                continue;
            }
            let age = now.signed_duration_since(entry.last_seen);
            if age.to_std().map(|d| d > deadline).unwrap_or(false) {
                entry.info.status = NodeState::Offline;
                went_offline.push(entry.info.id.clone());
            }
        }
        went_offline
    }

    /// Run the background offline sweep until shutdown.
    pub async fn run_sweep(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let went_offline = self.sweep_offline();
                    for id in went_offline {
                        warn!(node_id = %id, "node missed heartbeat deadline, marked offline");
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::types::{NodeCapabilities, NodeRole};

    fn sample_info(id: &str) -> NodeInfo {
        NodeInfo {
            id: id.to_string(),
            name: id.to_string(),
            role: NodeRole::Client,
            status: NodeState::Online,
            address: "127.0.0.1".to_string(),
            port: 9000,
            tags: vec![],
            metadata: Default::default(),
            capabilities: NodeCapabilities::default(),
            resources: None,
            created_at: Utc::now(),
            started_at: None,
        }
    }

    #[test]
    fn register_and_list() {
        let registry = ClientRegistry::new();
        registry.register(sample_info("n1"));
        assert_eq!(registry.list().len(), 1);
        assert!(registry.get("n1").is_some());
    }

    #[test]
    fn heartbeat_for_unknown_node_errors() {
        let registry = ClientRegistry::new();
        let heartbeat = Heartbeat {
            node_id: "ghost".to_string(),
            timestamp: Utc::now(),
            status: NodeState::Online,
            resources: None,
            sequence: 1,
        };
        assert!(matches!(registry.apply_heartbeat(heartbeat), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn stale_node_is_swept_offline() {
        let registry = ClientRegistry::new();
        registry.set_expected_heartbeat_interval(Duration::from_millis(1));
        registry.register(sample_info("n1"));
        {
            let mut entry = registry.nodes.get_mut("n1").unwrap();
            entry.last_seen = Utc::now() - chrono::Duration::seconds(10);
        }
        let went_offline = registry.sweep_offline();
        assert_eq!(went_offline, vec!["n1".to_string()]);
        assert_eq!(registry.get("n1").unwrap().status, NodeState::Offline);
    }
}
