//! Orchestrator settings
//!
//! All fields have defaults so an empty file (or no file at all) yields a
//! working configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::ServiceError;
use crate::types::Environment;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub pipeline: PipelineSettings,
    pub monitor: MonitorSettings,
    pub testing: TestingSettings,
    pub approval: ApprovalSettings,
    pub rollback: RollbackSettings,
}

/// Command templates and timeout for one pipeline stage
///
/// `{branch}`, `{branch_slug}` and `{environment}` are substituted when the
/// pipeline is generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageTemplate {
    pub commands: Vec<String>,
    pub timeout_secs: u64,
}

impl StageTemplate {
    fn new(commands: &[&str], timeout_secs: u64) -> Self {
        Self {
            commands: commands.iter().map(|c| c.to_string()).collect(),
            timeout_secs,
        }
    }
}

impl Default for StageTemplate {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub default_environment: Environment,
    pub build: StageTemplate,
    pub test: StageTemplate,
    pub security_scan: StageTemplate,
    pub package: StageTemplate,
    pub deploy: StageTemplate,
    /// Words in a change description that add the security-scan stage
    pub security_keywords: Vec<String>,
    /// Run the snapshot integrity pass right after capturing it
    pub verify_snapshot_on_capture: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            default_environment: Environment::Staging,
            build: StageTemplate::new(&["npm ci", "npm run build"], 600),
            test: StageTemplate::new(&["npm test"], 900),
            security_scan: StageTemplate::new(&["npm audit --audit-level=high"], 600),
            package: StageTemplate::new(&["tar -czf dist-{branch_slug}.tar.gz dist"], 300),
            deploy: StageTemplate::new(
                &["./scripts/deploy.sh {environment} dist-{branch_slug}.tar.gz"],
                600,
            ),
            security_keywords: [
                "security",
                "auth",
                "authentication",
                "authorization",
                "login",
                "password",
                "credential",
                "secret",
                "token",
                "encrypt",
                "encryption",
                "crypto",
                "permission",
                "vulnerability",
                "cve",
                "xss",
                "csrf",
                "injection",
                "sanitize",
            ]
            .iter()
            .map(|k| k.to_string())
            .collect(),
            verify_snapshot_on_capture: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// Maximum build-log entries kept per deployment; oldest are evicted
    pub log_buffer_capacity: usize,
    /// How long a completed session stays queryable
    pub session_retention_secs: u64,
    /// Target probed after the deploy stage completes
    pub health_check_target: Option<String>,
    pub health_check_timeout_secs: u64,
    /// Treat an unhealthy post-deploy probe as a deploy-stage failure
    pub fail_on_unhealthy: bool,
    /// Capacity of the status broadcast channel
    pub broadcast_capacity: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            log_buffer_capacity: 1000,
            session_retention_secs: 300,
            health_check_target: None,
            health_check_timeout_secs: 10,
            fail_on_unhealthy: false,
            broadcast_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestingSettings {
    /// Executions kept per project for pre-merge queries
    pub history_limit: usize,
    pub default_max_concurrent_suites: usize,
}

impl Default for TestingSettings {
    fn default() -> Self {
        Self {
            history_limit: 50,
            default_max_concurrent_suites: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalSettings {
    /// How long approved/rejected requests stay queryable
    pub resolved_retention_secs: u64,
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        Self {
            resolved_retention_secs: 7 * 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackSettings {
    /// How long rejected/completed/failed requests are kept
    pub terminal_retention_secs: u64,
    /// Probe target per integrity checklist item, keyed by item name
    pub integrity_targets: HashMap<String, String>,
    /// Snapshots kept per environment when pruning
    pub snapshots_per_environment: usize,
}

impl Default for RollbackSettings {
    fn default() -> Self {
        Self {
            terminal_retention_secs: 24 * 60 * 60,
            integrity_targets: HashMap::new(),
            snapshots_per_environment: 20,
        }
    }
}

impl OrchestratorSettings {
    /// Load settings from a YAML or JSON file, chosen by extension
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ServiceError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ServiceError::Configuration {
            message: format!("Failed to read {}: {}", path.display(), e),
        })?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_yaml_str(&content)
        }
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ServiceError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|e| ServiceError::Configuration {
            message: format!("Invalid YAML settings: {}", e),
        })
    }

    pub fn from_json_str(content: &str) -> Result<Self, ServiceError> {
        serde_json::from_str(content).map_err(|e| ServiceError::Configuration {
            message: format!("Invalid JSON settings: {}", e),
        })
    }
}
