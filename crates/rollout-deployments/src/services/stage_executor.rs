//! Stage execution
//!
//! [`ShellStageExecutor`] runs a stage's commands on the local host.
//! [`run_stage`] wraps any executor with the stage timeout and turns the
//! outcome into an immutable [`StageResult`].

use async_trait::async_trait;
use rollout_core::{
    CommandError, PipelineStage, ShellCommandRunner, StageContext, StageError, StageExecutor,
    StageOutput, StageResult,
};
use std::time::Instant;
use tracing::{debug, error, info};

/// Runs each command of a stage through `sh -c`, stopping at the first failure
///
/// The stage timeout is shared by all commands of the stage.
#[derive(Debug, Clone, Default)]
pub struct ShellStageExecutor {
    runner: ShellCommandRunner,
}

impl ShellStageExecutor {
    pub fn new(runner: ShellCommandRunner) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl StageExecutor for ShellStageExecutor {
    async fn execute(
        &self,
        stage: &PipelineStage,
        context: &StageContext,
    ) -> Result<StageOutput, StageError> {
        let deadline = Instant::now() + stage.timeout();
        let total = stage.commands.len();
        let mut output = String::new();

        for (index, command) in stage.commands.iter().enumerate() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(StageError::Timeout {
                    stage: stage.name.clone(),
                    timeout_secs: stage.timeout_secs,
                });
            }

            context
                .progress
                .tick(format!("Running command {}/{}: {}", index + 1, total, command))
                .await;

            let result = self
                .runner
                .run(command, remaining)
                .await
                .map_err(|e| match e {
                    CommandError::Timeout { .. } => StageError::Timeout {
                        stage: stage.name.clone(),
                        timeout_secs: stage.timeout_secs,
                    },
                    CommandError::Spawn { .. } => StageError::ExecutionFailed(e.to_string()),
                })?;

            let combined = result.combined();
            if !combined.is_empty() {
                if !output.is_empty() {
                    output.push('\n');
                }
                output.push_str(&combined);
            }

            if !result.success() {
                let message = match result.exit_code {
                    Some(code) => format!("exited with status {}", code),
                    None => "terminated by signal".to_string(),
                };
                return Err(StageError::CommandFailed {
                    command: command.clone(),
                    message,
                    output,
                });
            }
        }

        Ok(StageOutput::new(output))
    }
}

/// Execute one stage attempt, failing it if the executor errors or overruns
/// the stage timeout
pub async fn run_stage(
    executor: &dyn StageExecutor,
    stage: &PipelineStage,
    context: &StageContext,
) -> StageResult {
    let started_at = chrono::Utc::now();
    let started = Instant::now();
    debug!(
        "▶️ Executing stage {} for deployment {}",
        stage.name, context.deployment_id
    );

    let outcome = match tokio::time::timeout(stage.timeout(), executor.execute(stage, context)).await
    {
        Ok(result) => result,
        Err(_) => Err(StageError::Timeout {
            stage: stage.name.clone(),
            timeout_secs: stage.timeout_secs,
        }),
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(output) => {
            info!("✅ Stage {} completed in {}ms", stage.name, duration_ms);
            StageResult {
                stage_name: stage.name.clone(),
                success: true,
                duration_ms,
                output: output.output,
                error: None,
                started_at,
            }
        }
        Err(e) => {
            error!("❌ Stage {} failed after {}ms: {}", stage.name, duration_ms, e);
            StageResult {
                stage_name: stage.name.clone(),
                success: false,
                duration_ms,
                output: e.output().to_string(),
                error: Some(e.to_string()),
                started_at,
            }
        }
    }
}
