//! Single `Config` struct covering the recognized options: `modelPaths`,
//! `inferenceBinaries`, `heartbeat`, `scheduler`, `node`, `portRange`,
//! `executor`. Deserialized from YAML (or JSON, which is a YAML subset).
//!
//! Grounded on the teacher's `load_composition_file` thin I/O wrapper over a
//! pure parse function, and `context/mod.rs`'s `default_config_path`/
//! `parse_config`/`load_config_from` split between pure logic and
//! filesystem access.

pub mod validation;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::executor::ExecutorSettings;
use crate::cluster::heartbeat::HeartbeatSettings;
use crate::cluster::scheduler::{SchedulerSettings, SchedulingStrategy};
use crate::cluster::types::{CommandType, NodeRole};
pub use validation::{validate_config, ConfigValidationError};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration:\n{0}")]
    Invalid(#[from] ConfigValidationError),
}

/// Default config file location: `~/.llmesh/config.yaml`.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".llmesh")
        .join("config.yaml")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceBinaryConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(rename = "readinessMarker", default)]
    pub readiness_marker: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub interval: u64,
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout: u64,
    #[serde(rename = "maxRetries", default = "default_heartbeat_max_retries")]
    pub max_retries: u32,
}

fn default_heartbeat_interval() -> u64 {
    5
}
fn default_heartbeat_timeout() -> u64 {
    30
}
fn default_heartbeat_max_retries() -> u32 {
    5
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: default_heartbeat_interval(),
            timeout: default_heartbeat_timeout(),
            max_retries: default_heartbeat_max_retries(),
        }
    }
}

impl From<&HeartbeatConfig> for HeartbeatSettings {
    fn from(c: &HeartbeatConfig) -> Self {
        let defaults = HeartbeatSettings::default();
        Self {
            interval: Duration::from_secs(c.interval),
            request_timeout: Duration::from_secs(c.timeout),
            max_retries: c.max_retries,
            max_backoff: defaults.max_backoff,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_strategy")]
    pub strategy: String,
    #[serde(rename = "maxQueueSize", default = "default_max_queue_size")]
    pub max_queue_size: usize,
}

fn default_scheduler_strategy() -> String {
    "round_robin".to_string()
}
fn default_max_queue_size() -> usize {
    1024
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: default_scheduler_strategy(),
            max_queue_size: default_max_queue_size(),
        }
    }
}

impl SchedulerConfig {
    /// Resolve to settings, falling back to round-robin for an unrecognized
    /// strategy name. `validate_config` rejects that case on any path that
    /// reaches this, so the fallback only matters for ad-hoc construction.
    pub fn to_settings(&self) -> SchedulerSettings {
        let defaults = SchedulerSettings::default();
        SchedulerSettings {
            strategy: SchedulingStrategy::parse(&self.strategy).unwrap_or(SchedulingStrategy::RoundRobin),
            max_queue_size: self.max_queue_size,
            offer_timeout: defaults.offer_timeout,
            request_timeout: defaults.request_timeout,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSectionConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_node_role")]
    pub role: NodeRole,
    #[serde(default = "default_node_address")]
    pub address: String,
    #[serde(default = "default_node_port")]
    pub port: u16,
    #[serde(rename = "masterAddress", default)]
    pub master_address: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_node_role() -> NodeRole {
    NodeRole::Standalone
}
fn default_node_address() -> String {
    "0.0.0.0".to_string()
}
fn default_node_port() -> u16 {
    9100
}

impl Default for NodeSectionConfig {
    fn default() -> Self {
        Self {
            name: None,
            role: default_node_role(),
            address: default_node_address(),
            port: default_node_port(),
            master_address: None,
            tags: Vec::new(),
            metadata: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PortRangeConfig {
    #[serde(default = "default_port_base")]
    pub base: u16,
    #[serde(default = "default_port_max")]
    pub max: u16,
}

fn default_port_base() -> u16 {
    40000
}
fn default_port_max() -> u16 {
    41000
}

impl Default for PortRangeConfig {
    fn default() -> Self {
        Self {
            base: default_port_base(),
            max: default_port_max(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(rename = "maxConcurrent", default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_executor_timeout")]
    pub timeout: u64,
    #[serde(rename = "allowedCommands", default = "default_allowed_commands")]
    pub allowed_commands: Vec<CommandType>,
}

fn default_max_concurrent() -> usize {
    4
}
fn default_executor_timeout() -> u64 {
    3600
}
fn default_allowed_commands() -> Vec<CommandType> {
    vec![
        CommandType::LoadModel,
        CommandType::UnloadModel,
        CommandType::RunInference,
        CommandType::StopProcess,
        CommandType::UpdateConfig,
        CommandType::CollectLogs,
        CommandType::ScanModels,
    ]
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            timeout: default_executor_timeout(),
            allowed_commands: default_allowed_commands(),
        }
    }
}

impl From<&ExecutorConfig> for ExecutorSettings {
    fn from(c: &ExecutorConfig) -> Self {
        let defaults = ExecutorSettings::default();
        Self {
            max_concurrent: c.max_concurrent,
            default_timeout: Duration::from_secs(c.timeout),
            allowed_commands: c.allowed_commands.iter().copied().collect(),
            acquire_timeout: defaults.acquire_timeout,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(rename = "modelPaths", default)]
    pub model_paths: Vec<PathBuf>,
    #[serde(rename = "inferenceBinaries", default)]
    pub inference_binaries: Vec<InferenceBinaryConfig>,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub node: NodeSectionConfig,
    #[serde(rename = "portRange", default)]
    pub port_range: PortRangeConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl Config {
    /// Build the Command Executor's baseline `load_model` options from the
    /// first configured inference binary, if any. Per-request payload
    /// fields (see `CommandExecutor::resolve_load_options`) can still
    /// override individual fields.
    pub fn resolve_load_defaults(&self) -> crate::models::LoadOptions {
        let mut options = crate::models::LoadOptions::default();
        if let Some(binary) = self.inference_binaries.first() {
            options.executable_override = Some(binary.path.clone());
            options.readiness_marker = binary.readiness_marker.clone();
        }
        options
    }
}

// ============================================================================
// SBIO: pure parse (no I/O)
// ============================================================================

/// Parse a `Config` from a YAML (or JSON, a YAML subset) string and
/// validate it. Validation is part of parsing: a config with an
/// unrecognized scheduler strategy or an inverted port range is not
/// meaningfully "parsed" yet.
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_yaml::from_str(content)?;
    validate_config(&config)?;
    Ok(config)
}

// ============================================================================
// I/O boundary
// ============================================================================

/// Load and validate the config at `path`.
pub fn load_config_file(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_match_spec_defaults() {
        let config = Config::default();
        assert_eq!(config.heartbeat.interval, 5);
        assert_eq!(config.heartbeat.max_retries, 5);
        assert_eq!(config.scheduler.strategy, "round_robin");
        assert_eq!(config.executor.max_concurrent, 4);
        assert_eq!(config.node.role, NodeRole::Standalone);
    }

    #[test]
    fn parses_recognized_options() {
        let yaml = r#"
modelPaths:
  - /srv/models
inferenceBinaries:
  - name: llama-server
    path: /usr/local/bin/llama-server
    readinessMarker: "all slots are idle"
heartbeat:
  interval: 10
  timeout: 20
  maxRetries: 3
scheduler:
  strategy: least_loaded
  maxQueueSize: 256
node:
  role: HYBRID
  address: 10.0.0.5
  port: 9200
  masterAddress: "http://10.0.0.1:9100"
  tags: [gpu]
portRange:
  base: 45000
  max: 45100
executor:
  maxConcurrent: 8
  timeout: 1800
  allowedCommands: [load_model, unload_model]
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.model_paths, vec![PathBuf::from("/srv/models")]);
        assert_eq!(config.inference_binaries[0].name, "llama-server");
        assert_eq!(config.heartbeat.interval, 10);
        assert_eq!(config.scheduler.strategy, "least_loaded");
        assert_eq!(config.node.role, NodeRole::Hybrid);
        assert_eq!(config.node.master_address.as_deref(), Some("http://10.0.0.1:9100"));
        assert_eq!(config.port_range.base, 45000);
        assert_eq!(config.executor.max_concurrent, 8);
    }

    #[test]
    fn rejects_unrecognized_scheduler_strategy() {
        let yaml = "scheduler:\n  strategy: quantum\n";
        assert!(matches!(parse_config(yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn load_config_file_reads_from_disk() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "modelPaths: [/srv/models]\n").unwrap();
        let config = load_config_file(file.path()).unwrap();
        assert_eq!(config.model_paths, vec![PathBuf::from("/srv/models")]);
    }

    #[test]
    fn load_config_file_missing_is_io_error() {
        let result = load_config_file(Path::new("/nonexistent/llmesh-config.yaml"));
        assert!(matches!(result, Err(ConfigError::Io(_, _))));
    }
}
