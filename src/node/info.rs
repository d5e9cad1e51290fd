//! Builds the wire `NodeInfo`/capability record from live node state.

use std::collections::HashMap;

use crate::cluster::types::{NodeCapabilities, NodeInfo};
use crate::monitor::ResourceSnapshot;

use super::NodeShared;

/// Detect static capabilities from the most recent resource sample. GPU
/// inventory and `supports_inference` both derive from whether the node has
/// at least one inference binary configured, a flag threaded in by
/// the caller rather than guessed here.
pub fn capabilities_from_snapshot(snapshot: &ResourceSnapshot, supports_inference: bool) -> NodeCapabilities {
    NodeCapabilities {
        cpu_count: snapshot.cpu_count,
        memory_bytes: snapshot.memory_total_bytes,
        gpu: snapshot.gpus.clone(),
        supports_inference,
    }
}

/// Build the `NodeInfo` exchanged at registration and embedded in no other
/// message (heartbeats carry only a `ResourceSnapshot`, per §3).
pub async fn build_node_info(shared: &NodeShared) -> NodeInfo {
    let resources = shared.resource_monitor.snapshot().await;
    let capabilities = capabilities_from_snapshot(&resources, shared.supports_inference);

    NodeInfo {
        id: shared.id.clone(),
        name: shared.name.read().await.clone(),
        role: shared.role,
        status: *shared.status.read().await,
        address: shared.address.clone(),
        port: shared.port,
        tags: shared.tags.read().await.clone(),
        metadata: shared.metadata.read().await.clone(),
        capabilities,
        resources: Some(resources),
        created_at: shared.created_at,
        started_at: *shared.started_at.read().await,
    }
}

pub fn empty_metadata() -> HashMap<String, String> {
    HashMap::new()
}
