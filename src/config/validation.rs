//! Config validation: collect every problem before reporting, rather than
//! failing on the first one found.
//!
//! Grounded on the teacher's `ValidationResult` builder (`.error()`/
//! `.warning()`/`.info()`, `has_errors()`), narrowed here to the one thing
//! `Config` needs: a list of hard errors, since a control-plane config
//! either starts clean or doesn't start at all.

use std::fmt;

use super::Config;
use crate::cluster::scheduler::SchedulingStrategy;
use crate::cluster::types::NodeRole;

/// A config failed validation. Carries every problem found, not just the
/// first, matching the teacher's "collect all problems" `ValidationResult`.
#[derive(Debug)]
pub struct ConfigValidationError {
    problems: Vec<String>,
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, problem) in self.problems.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "  - {problem}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ConfigValidationError {}

impl ConfigValidationError {
    pub fn problems(&self) -> &[String] {
        &self.problems
    }
}

/// Validate a `Config`, collecting every problem rather than stopping at
/// the first. Port-range sanity, scheduler strategy name, and allow-listed
/// command types are checked here; `CommandType` itself already rejects
/// unrecognized wire values at deserialization time.
pub fn validate_config(config: &Config) -> Result<(), ConfigValidationError> {
    let mut problems = Vec::new();

    if SchedulingStrategy::parse(&config.scheduler.strategy).is_none() {
        problems.push(format!(
            "scheduler.strategy {:?} is not one of round_robin, least_loaded, resource_aware",
            config.scheduler.strategy
        ));
    }
    if config.scheduler.max_queue_size == 0 {
        problems.push("scheduler.maxQueueSize must be at least 1".to_string());
    }

    if config.port_range.base == 0 || config.port_range.max == 0 {
        problems.push("portRange.base and portRange.max must be non-zero".to_string());
    } else if config.port_range.base >= config.port_range.max {
        problems.push(format!(
            "portRange.base ({}) must be less than portRange.max ({})",
            config.port_range.base, config.port_range.max
        ));
    }

    if config.node.port == 0 {
        problems.push("node.port must be non-zero".to_string());
    }
    if matches!(config.node.role, NodeRole::Client | NodeRole::Hybrid) && config.node.master_address.is_none() {
        problems.push(format!(
            "node.role {:?} requires node.masterAddress to be set",
            config.node.role
        ));
    }

    if config.executor.max_concurrent == 0 {
        problems.push("executor.maxConcurrent must be at least 1".to_string());
    }
    if config.executor.timeout == 0 {
        problems.push("executor.timeout must be at least 1 second".to_string());
    }
    if config.executor.allowed_commands.is_empty() {
        problems.push("executor.allowedCommands must name at least one command type".to_string());
    }

    for binary in &config.inference_binaries {
        if binary.name.trim().is_empty() {
            problems.push("inferenceBinaries entry has an empty name".to_string());
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(ConfigValidationError { problems })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeSectionConfig, PortRangeConfig, SchedulerConfig};

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn rejects_unrecognized_strategy() {
        let config = Config {
            scheduler: SchedulerConfig {
                strategy: "quantum".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = validate_config(&config).unwrap_err();
        assert!(err.problems().iter().any(|p| p.contains("scheduler.strategy")));
    }

    #[test]
    fn rejects_inverted_port_range() {
        let config = Config {
            port_range: PortRangeConfig { base: 5000, max: 4000 },
            ..Default::default()
        };
        let err = validate_config(&config).unwrap_err();
        assert!(err.problems().iter().any(|p| p.contains("portRange")));
    }

    #[test]
    fn client_role_requires_master_address() {
        let config = Config {
            node: NodeSectionConfig {
                role: NodeRole::Client,
                master_address: None,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = validate_config(&config).unwrap_err();
        assert!(err.problems().iter().any(|p| p.contains("masterAddress")));
    }

    #[test]
    fn collects_multiple_problems_at_once() {
        let config = Config {
            scheduler: SchedulerConfig {
                strategy: "bogus".to_string(),
                max_queue_size: 0,
            },
            port_range: PortRangeConfig { base: 0, max: 0 },
            ..Default::default()
        };
        let err = validate_config(&config).unwrap_err();
        assert!(err.problems().len() >= 3);
    }
}
