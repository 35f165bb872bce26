//! Pipeline model and stage execution ports
//!
//! A pipeline is an ordered list of named stages. The runner drives stages
//! through a [`StageExecutor`] and reports every stage boundary to a
//! [`PipelineObserver`], which is how the deployment monitor follows a run.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::types::{Environment, UtcDateTime};

/// Generated pipeline, immutable once built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub id: String,
    pub source_spec_id: String,
    pub branch_name: String,
    pub stages: Vec<PipelineStage>,
    pub target_environment: Environment,
    pub created_at: UtcDateTime,
}

impl PipelineConfig {
    /// Check the structural invariants: at least one stage and unique stage names
    pub fn validate(&self) -> Result<(), String> {
        if self.stages.is_empty() {
            return Err(format!("Pipeline {} has no stages", self.id));
        }
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(format!("Pipeline {} has a stage without a name", self.id));
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(format!(
                    "Pipeline {} has duplicate stage name '{}'",
                    self.id, stage.name
                ));
            }
        }
        Ok(())
    }

    pub fn stage(&self, name: &str) -> Option<&PipelineStage> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStage {
    pub name: String,
    pub description: String,
    pub commands: Vec<String>,
    pub timeout_secs: u64,
}

impl PipelineStage {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            commands: Vec::new(),
            timeout_secs: 300,
        }
    }

    pub fn with_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands = commands.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Stage execution status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageStatus::Pending => write!(f, "pending"),
            StageStatus::Running => write!(f, "running"),
            StageStatus::Success => write!(f, "success"),
            StageStatus::Failed => write!(f, "failed"),
            StageStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// One stage execution attempt; never mutated after creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage_name: String,
    pub success: bool,
    pub duration_ms: u64,
    pub output: String,
    pub error: Option<String>,
    pub started_at: UtcDateTime,
}

impl StageResult {
    pub fn status(&self) -> StageStatus {
        if self.success {
            StageStatus::Success
        } else {
            StageStatus::Failed
        }
    }
}

/// Stage execution errors
#[derive(Error, Debug, Clone)]
pub enum StageError {
    #[error("Command '{command}' failed: {message}")]
    CommandFailed {
        command: String,
        message: String,
        output: String,
    },

    #[error("Stage '{stage}' timed out after {timeout_secs}s")]
    Timeout { stage: String, timeout_secs: u64 },

    #[error("Stage execution failed: {0}")]
    ExecutionFailed(String),
}

impl StageError {
    /// Output captured before the failure, if any
    pub fn output(&self) -> &str {
        match self {
            StageError::CommandFailed { output, .. } => output,
            _ => "",
        }
    }
}

/// Output of a successful stage
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    pub output: String,
}

impl StageOutput {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
        }
    }
}

/// Context handed to an executor for one stage attempt
#[derive(Clone)]
pub struct StageContext {
    pub deployment_id: String,
    pub environment: Environment,
    pub branch_name: String,
    pub progress: ProgressReporter,
}

impl fmt::Debug for StageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageContext")
            .field("deployment_id", &self.deployment_id)
            .field("environment", &self.environment)
            .field("branch_name", &self.branch_name)
            .field("progress", &"<ProgressReporter>")
            .finish()
    }
}

/// Runs one stage
///
/// Timeouts are enforced by the caller as well, so an executor that hangs
/// still fails its stage.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(
        &self,
        stage: &PipelineStage,
        context: &StageContext,
    ) -> Result<StageOutput, StageError>;
}

/// What an observer wants the runner to do after a stage finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverVerdict {
    Continue,
    /// Fail the stage that just finished with the given reason
    Fail(String),
}

/// Receives stage-boundary events from the pipeline runner
#[async_trait]
pub trait PipelineObserver: Send + Sync {
    async fn on_pipeline_started(&self, _deployment_id: &str, _config: &PipelineConfig) {}

    async fn on_stage_started(
        &self,
        _deployment_id: &str,
        _stage: &PipelineStage,
        _index: usize,
        _total: usize,
    ) {
    }

    async fn on_stage_progress(&self, _deployment_id: &str, _stage_name: &str, _message: &str) {}

    async fn on_stage_finished(&self, _deployment_id: &str, _result: &StageResult) -> ObserverVerdict {
        ObserverVerdict::Continue
    }

    async fn on_pipeline_finished(&self, _deployment_id: &str, _success: bool, _error: Option<&str>) {}
}

/// Observer that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

/// Handle an executor uses to emit sub-stage progress ticks
#[derive(Clone)]
pub struct ProgressReporter {
    deployment_id: String,
    stage_name: String,
    observer: Arc<dyn PipelineObserver>,
}

impl ProgressReporter {
    pub fn new(
        deployment_id: impl Into<String>,
        stage_name: impl Into<String>,
        observer: Arc<dyn PipelineObserver>,
    ) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            stage_name: stage_name.into(),
            observer,
        }
    }

    /// Reporter that discards ticks
    pub fn detached(stage_name: impl Into<String>) -> Self {
        Self::new("", stage_name, Arc::new(NoopObserver))
    }

    pub async fn tick(&self, message: impl AsRef<str>) {
        self.observer
            .on_stage_progress(&self.deployment_id, &self.stage_name, message.as_ref())
            .await;
    }
}
