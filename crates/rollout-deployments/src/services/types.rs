use rollout_core::{Environment, PipelineConfig, Record, StageResult, UtcDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Deployment lifecycle status
///
/// Transitions only move forward. A rollback never rewrites a deployment; it
/// creates a new record that starts out as [`DeploymentStatus::RolledBack`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    RolledBack,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::InProgress => "in_progress",
            DeploymentStatus::Success => "success",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Success | DeploymentStatus::Failed | DeploymentStatus::RolledBack
        )
    }

    pub fn can_transition_to(&self, next: DeploymentStatus) -> bool {
        matches!(
            (self, next),
            (DeploymentStatus::Pending, DeploymentStatus::InProgress)
                | (DeploymentStatus::Pending, DeploymentStatus::Failed)
                | (DeploymentStatus::InProgress, DeploymentStatus::Success)
                | (DeploymentStatus::InProgress, DeploymentStatus::Failed)
        )
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub environment: Environment,
    pub version: String,
    pub status: DeploymentStatus,
    pub pipeline_config: PipelineConfig,
    pub snapshot_id: Option<String>,
    pub deployed_by: String,
    pub deployed_at: UtcDateTime,
    pub finished_at: Option<UtcDateTime>,
    pub rollback_available: bool,
    /// Human-readable run log; failing stage name and error end up here
    pub logs: Vec<String>,
    pub stage_results: Vec<StageResult>,
    pub failed_stage: Option<String>,
    pub error: Option<String>,
    /// Set on records created by a rollback: the deployment it replaced
    pub rolled_back_from: Option<String>,
}

impl Record for Deployment {
    const KIND: &'static str = "Deployment";

    fn id(&self) -> &str {
        &self.id
    }
}

/// Captured, restorable system state used as a rollback target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub id: String,
    pub environment: Environment,
    pub source_revision: String,
    pub database_backup_handle: Option<String>,
    pub config_files: Vec<String>,
    pub created_at: UtcDateTime,
    pub verified: bool,
    pub verified_at: Option<UtcDateTime>,
}

impl Record for Snapshot {
    const KIND: &'static str = "Snapshot";

    fn id(&self) -> &str {
        &self.id
    }
}

/// Outcome of one pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentResult {
    pub deployment_id: String,
    pub success: bool,
    pub status: DeploymentStatus,
    pub snapshot_id: Option<String>,
    pub stage_results: Vec<StageResult>,
    pub failed_stage: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub rollback_available: bool,
}

/// A requested change, the input of pipeline generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeSpecification {
    pub id: String,
    pub description: String,
    pub branch_name: String,
    pub environment_hint: Option<Environment>,
}

impl ChangeSpecification {
    pub fn new(description: impl Into<String>, branch_name: impl Into<String>) -> Self {
        Self {
            id: rollout_core::new_id(),
            description: description.into(),
            branch_name: branch_name.into(),
            environment_hint: None,
        }
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment_hint = Some(environment);
        self
    }
}
