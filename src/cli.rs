//! Argument parsing and the pure dry-run display.
//!
//! Grounded on the teacher's `clap::Parser` derive struct (`ArgAction::Count`
//! verbosity, `--dry-run`) and its `format_dry_run` pure display function,
//! with the composition-file-specific output replaced by a resolved node
//! plan (role, subsystems that will start, listening address).

use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};

use crate::cluster::types::NodeRole;
use crate::config::Config;
use crate::node::subsystems_for_role;

#[derive(Parser, Debug)]
#[command(name = "llmesh")]
#[command(about = "Control plane for a distributed LLM inference worker fleet")]
#[command(version)]
pub struct Args {
    /// Path to the config file (YAML)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Override the node role from config
    #[arg(long, value_enum)]
    pub role: Option<CliNodeRole>,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Validate configuration and print the resolved node plan without
    /// starting any subsystem
    #[arg(long)]
    pub dry_run: bool,

    /// Override the bind address from config
    #[arg(long, value_name = "ADDR")]
    pub bind_addr: Option<String>,

    /// Override the listen port from config
    #[arg(short, long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Path to a .env file for loading secrets referenced by config (e.g. a
    /// master auth token)
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliNodeRole {
    Standalone,
    Master,
    Client,
    Hybrid,
}

impl From<CliNodeRole> for NodeRole {
    fn from(role: CliNodeRole) -> Self {
        match role {
            CliNodeRole::Standalone => NodeRole::Standalone,
            CliNodeRole::Master => NodeRole::Master,
            CliNodeRole::Client => NodeRole::Client,
            CliNodeRole::Hybrid => NodeRole::Hybrid,
        }
    }
}

// ============================================================================
// SBIO: pure display logic (no I/O - returns formatted strings)
// ============================================================================

/// Apply CLI overrides onto a loaded `Config`. Pure function.
pub fn apply_overrides(mut config: Config, args: &Args) -> Config {
    if let Some(role) = args.role {
        config.node.role = role.into();
    }
    if let Some(addr) = &args.bind_addr {
        config.node.address = addr.clone();
    }
    if let Some(port) = args.port {
        config.node.port = port;
    }
    config
}

/// Format the resolved node plan: role, subsystems that will start in
/// order, and listening address. Pure function, mirrors the teacher's
/// `format_dry_run`.
pub fn format_node_plan(config: &Config) -> String {
    let mut output = String::new();

    output.push_str("llmesh - Dry Run Mode\n\n");
    output.push_str(&format!(
        "Node: {} [{:?}]\n",
        config.node.name.as_deref().unwrap_or("(unnamed)"),
        config.node.role
    ));
    output.push_str(&format!("Listening: {}:{}\n", config.node.address, config.node.port));
    if let Some(master) = &config.node.master_address {
        output.push_str(&format!("Master: {master}\n"));
    }
    if !config.node.tags.is_empty() {
        output.push_str(&format!("Tags: {}\n", config.node.tags.join(", ")));
    }

    output.push_str(&format!("\nModel paths ({}):\n", config.model_paths.len()));
    for path in &config.model_paths {
        output.push_str(&format!("  - {}\n", path.display()));
    }

    output.push_str(&format!("\nInference binaries ({}):\n", config.inference_binaries.len()));
    for binary in &config.inference_binaries {
        output.push_str(&format!("  - {} -> {}\n", binary.name, binary.path.display()));
    }

    output.push_str("\nSubsystems that will start, in order:\n");
    for (i, name) in subsystems_for_role(config.node.role).iter().enumerate() {
        output.push_str(&format!("  {}. {name}\n", i + 1));
    }

    output.push_str(&format!(
        "\nPort range: {}-{}\n",
        config.port_range.base, config.port_range.max
    ));
    output.push_str(&format!(
        "Scheduler strategy: {} (maxQueueSize={})\n",
        config.scheduler.strategy, config.scheduler.max_queue_size
    ));
    output.push_str(&format!(
        "Executor: maxConcurrent={}, timeout={}s, allowedCommands={:?}\n",
        config.executor.max_concurrent, config.executor.timeout, config.executor.allowed_commands
    ));

    output.push_str("\nValidation: PASSED\n");
    output.push_str("Ready to start. Remove --dry-run to execute.\n");

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clap_parses_defaults() {
        let args = Args::parse_from(["llmesh"]);
        assert_eq!(args.verbose, 0);
        assert!(!args.dry_run);
        assert!(args.config.is_none());
    }

    #[test]
    fn clap_parses_verbose_and_dry_run() {
        let args = Args::parse_from(["llmesh", "-vvv", "--dry-run"]);
        assert_eq!(args.verbose, 3);
        assert!(args.dry_run);
    }

    #[test]
    fn clap_parses_role_and_overrides() {
        let args = Args::parse_from(["llmesh", "--role", "master", "--bind-addr", "127.0.0.1", "--port", "9100"]);
        assert_eq!(args.role, Some(CliNodeRole::Master));
        assert_eq!(args.bind_addr, Some("127.0.0.1".to_string()));
        assert_eq!(args.port, Some(9100));
    }

    #[test]
    fn apply_overrides_updates_node_section() {
        let config = Config::default();
        let args = Args::parse_from(["llmesh", "--role", "hybrid", "--port", "9200"]);
        let config = apply_overrides(config, &args);
        assert_eq!(config.node.role, NodeRole::Hybrid);
        assert_eq!(config.node.port, 9200);
    }

    #[test]
    fn format_node_plan_lists_subsystems_in_order() {
        let mut config = Config::default();
        config.node.role = NodeRole::Hybrid;
        let output = format_node_plan(&config);
        let registration_pos = output.find("registration").unwrap();
        let heartbeat_pos = output.find("heartbeat").unwrap();
        let commands_pos = output.find("commands").unwrap();
        assert!(registration_pos < heartbeat_pos && heartbeat_pos < commands_pos);
        assert!(output.contains("Validation: PASSED"));
    }
}
