//! Deploy Command
//!
//! Generate a pipeline for a change and run it against the local checkout
//! with the shell stage executor, then print the build log.

use clap::Args;
use colored::Colorize;
use rollout_audit::TracingAuditSink;
use rollout_core::{
    BroadcastStatusChannel, HttpHealthProbe, InMemoryRecordStore, OrchestratorSettings,
    RecordLocks, ShellCommandRunner,
};
use rollout_deployments::{
    DeploymentMonitor, ExecutionRequest, LogLevel, PipelineRunner, ShellStageExecutor,
    SnapshotService, WorkspaceSnapshotCapturer,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::plan::ChangeArgs;

#[derive(Args)]
pub struct DeployCommand {
    #[command(flatten)]
    change: ChangeArgs,

    /// Version label recorded on the deployment
    #[arg(long = "release", default_value = "local")]
    version: String,

    /// Checkout the stages run in
    #[arg(long, default_value = ".")]
    workdir: PathBuf,

    /// Who the deployment is recorded as
    #[arg(long, env = "USER", default_value = "local")]
    deployed_by: String,

    /// Only show warnings and errors from the build log
    #[arg(long)]
    quiet: bool,
}

impl DeployCommand {
    pub fn execute(self, settings: &OrchestratorSettings) -> anyhow::Result<()> {
        let config = self.change.generate(settings)?;
        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(self.run(config, settings))
    }

    async fn run(
        &self,
        config: rollout_core::PipelineConfig,
        settings: &OrchestratorSettings,
    ) -> anyhow::Result<()> {
        let locks = Arc::new(RecordLocks::new());
        let audit = Arc::new(TracingAuditSink);

        let capturer = WorkspaceSnapshotCapturer::new(&self.workdir);
        let snapshots = Arc::new(SnapshotService::new(
            InMemoryRecordStore::new_arc(),
            Arc::new(capturer),
            locks.clone(),
        ));

        let mut monitor = DeploymentMonitor::new(
            Arc::new(BroadcastStatusChannel::new(settings.monitor.broadcast_capacity)),
            settings.monitor.clone(),
        );
        if settings.monitor.health_check_target.is_some() {
            let timeout = Duration::from_secs(settings.monitor.health_check_timeout_secs);
            monitor = monitor.with_probe(Arc::new(HttpHealthProbe::new(timeout)?));
        }
        let monitor = Arc::new(monitor);

        let executor = ShellStageExecutor::new(
            ShellCommandRunner::new().with_working_dir(&self.workdir),
        );
        let runner = PipelineRunner::new(
            InMemoryRecordStore::new_arc(),
            snapshots,
            Arc::new(executor),
            audit,
            locks,
        )
        .with_observer(monitor.clone())
        .with_snapshot_verification(settings.pipeline.verify_snapshot_on_capture);

        info!(
            "🚀 Deploying {} to {} ({} stages)",
            config.branch_name,
            config.target_environment,
            config.stages.len()
        );
        let result = runner
            .execute(ExecutionRequest::new(config, &self.version, &self.deployed_by))
            .await?;

        let min_level = self.quiet.then_some(LogLevel::Warning);
        let logs = monitor.logs(&result.deployment_id, min_level).await?;
        println!();
        for entry in logs {
            let level = match entry.level {
                LogLevel::Error => entry.level.to_string().bright_red(),
                LogLevel::Warning => entry.level.to_string().bright_yellow(),
                _ => entry.level.to_string().normal(),
            };
            println!(
                "{} [{}] {:>7} {}",
                entry.timestamp.format("%H:%M:%S").to_string().dimmed(),
                entry.stage.bright_white(),
                level,
                entry.message
            );
        }
        println!();

        if result.success {
            println!(
                "{} Deployment {} succeeded in {} ms",
                "✔".bright_green(),
                result.deployment_id.bright_white().bold(),
                result.duration_ms
            );
            if result.rollback_available {
                println!("  Rollback snapshot: {}", result.snapshot_id.unwrap_or_default());
            }
            Ok(())
        } else {
            println!(
                "{} Deployment {} failed",
                "✘".bright_red(),
                result.deployment_id.bright_white().bold()
            );
            anyhow::bail!(
                "stage '{}' failed: {}",
                result.failed_stage.unwrap_or_else(|| "unknown".to_string()),
                result.error.unwrap_or_default()
            )
        }
    }
}
