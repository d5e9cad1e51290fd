//! Wire types shared between the master and its nodes.
//!
//! Every type here is the camelCase JSON that crosses an HTTP boundary:
//! node registration, heartbeats, task submission, and command dispatch.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::monitor::{GpuInfo, ResourceSnapshot};

/// Role a node plays in the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeRole {
    Standalone,
    Master,
    Client,
    Hybrid,
}

impl NodeRole {
    pub fn runs_registration(&self) -> bool {
        matches!(self, NodeRole::Client | NodeRole::Hybrid)
    }

    pub fn runs_heartbeat(&self) -> bool {
        matches!(self, NodeRole::Client | NodeRole::Hybrid)
    }

    pub fn runs_commands(&self) -> bool {
        matches!(self, NodeRole::Master | NodeRole::Hybrid)
    }

    pub fn is_master(&self) -> bool {
        matches!(self, NodeRole::Master | NodeRole::Hybrid)
    }
}

/// Operational state of a node as seen by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Offline,
    Online,
    Busy,
    Error,
    Degraded,
    Disabled,
}

/// Static description of what a node can do.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeCapabilities {
    #[serde(rename = "cpuCount")]
    pub cpu_count: u32,
    #[serde(rename = "memoryBytes")]
    pub memory_bytes: u64,
    pub gpu: Vec<GpuInfo>,
    #[serde(rename = "supportsInference")]
    pub supports_inference: bool,
}

/// A node's full identity and capability record, exchanged at registration
/// time and carried inside the Client Registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub name: String,
    pub role: NodeRole,
    pub status: NodeState,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub capabilities: NodeCapabilities,
    #[serde(default)]
    pub resources: Option<ResourceSnapshot>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "startedAt")]
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

/// A heartbeat message sent by a node on its fixed interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(rename = "nodeID")]
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: NodeState,
    #[serde(default)]
    pub resources: Option<ResourceSnapshot>,
    pub sequence: u64,
}

/// The closed set of directly-executable command kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    LoadModel,
    UnloadModel,
    RunInference,
    StopProcess,
    UpdateConfig,
    CollectLogs,
    ScanModels,
}

/// A unit of work a node's Command Executor can run directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl Command {
    pub fn new(command_type: CommandType, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            command_type,
            payload,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Some(secs);
        self
    }
}

/// The outcome of running one `Command`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    #[serde(rename = "commandID")]
    pub command_id: Uuid,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "durationMillis")]
    pub duration_millis: u64,
}

impl CommandResult {
    pub fn ok(command_id: Uuid, result: serde_json::Value, duration_millis: u64) -> Self {
        Self {
            command_id,
            success: true,
            result: Some(result),
            error: None,
            duration_millis,
        }
    }

    pub fn err(command_id: Uuid, error: impl Into<String>, duration_millis: u64) -> Self {
        Self {
            command_id,
            success: false,
            result: None,
            error: Some(error.into()),
            duration_millis,
        }
    }
}

/// State of a scheduled task, master-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// A unit of work submitted to the master's Scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub task_type: CommandType,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(rename = "assignedTo")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    pub status: TaskStatus,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "startedAt")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(rename = "completedAt")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "retryCount")]
    pub retry_count: u32,
    #[serde(rename = "maxRetries")]
    pub max_retries: u32,
}

impl Task {
    pub fn new(task_type: CommandType, payload: serde_json::Value, pin_to: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type,
            payload,
            assigned_to: pin_to,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            retry_count: 0,
            max_retries: 3,
        }
    }

    /// Reset a FAILED/CANCELLED task back to PENDING for a retry.
    pub fn reset_for_retry(&mut self) {
        self.error = None;
        self.assigned_to = None;
        self.started_at = None;
        self.completed_at = None;
        self.result = None;
        self.status = TaskStatus::Pending;
        self.retry_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_role_subsystem_table() {
        assert!(!NodeRole::Standalone.runs_registration());
        assert!(NodeRole::Client.runs_heartbeat());
        assert!(!NodeRole::Client.runs_commands());
        assert!(NodeRole::Hybrid.runs_commands());
        assert!(NodeRole::Hybrid.runs_registration());
        assert!(NodeRole::Master.is_master());
        assert!(!NodeRole::Client.is_master());
    }

    #[test]
    fn command_type_serializes_snake_case() {
        let json = serde_json::to_string(&CommandType::LoadModel).unwrap();
        assert_eq!(json, "\"load_model\"");
    }

    #[test]
    fn node_role_serializes_screaming_snake() {
        let json = serde_json::to_string(&NodeRole::Hybrid).unwrap();
        assert_eq!(json, "\"HYBRID\"");
    }

    #[test]
    fn task_retry_resets_fields() {
        let mut task = Task::new(CommandType::RunInference, serde_json::json!({}), None);
        task.status = TaskStatus::Failed;
        task.error = Some("boom".into());
        task.assigned_to = Some("node-1".into());
        task.reset_for_retry();

        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.error.is_none());
        assert!(task.assigned_to.is_none());
        assert_eq!(task.retry_count, 1);
    }
}
