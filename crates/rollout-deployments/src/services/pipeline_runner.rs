//! Pipeline Runner
//!
//! Sequences the stages of one deployment. Stages run strictly in order and
//! the first failure aborts the rest of the pipeline; there are no retries at
//! this layer.

use rollout_core::{
    new_id, record_audit, AuditRecord, AuditSink, Environment, NoopObserver, ObserverVerdict,
    PipelineConfig, PipelineObserver, ProgressReporter, RecordFilter, RecordLocks, RecordStore,
    ServiceError, StageContext, StageExecutor, StageResult, StoreError,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::services::snapshot_service::{capture_for_deployment, SnapshotError, SnapshotService};
use crate::services::stage_executor::run_stage;
use crate::services::types::{Deployment, DeploymentResult, DeploymentStatus};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("Deployment {0} not found")]
    DeploymentNotFound(String),

    #[error("Deployment {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: DeploymentStatus,
        to: DeploymentStatus,
    },

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<PipelineError> for ServiceError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::InvalidPipeline(message) => ServiceError::Validation { message },
            PipelineError::DeploymentNotFound(id) => ServiceError::NotFound {
                resource: format!("Deployment {}", id),
            },
            PipelineError::InvalidTransition { .. } => ServiceError::Conflict {
                message: err.to_string(),
            },
            PipelineError::Snapshot(e) => e.into(),
            PipelineError::Store(e) => e.into(),
        }
    }
}

/// One request to run a pipeline
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Reserved id (e.g. from an approval request); generated when absent
    pub deployment_id: Option<String>,
    pub config: PipelineConfig,
    pub environment: Environment,
    pub version: String,
    pub deployed_by: String,
}

impl ExecutionRequest {
    pub fn new(
        config: PipelineConfig,
        version: impl Into<String>,
        deployed_by: impl Into<String>,
    ) -> Self {
        Self {
            deployment_id: None,
            environment: config.target_environment,
            config,
            version: version.into(),
            deployed_by: deployed_by.into(),
        }
    }

    pub fn with_deployment_id(mut self, deployment_id: impl Into<String>) -> Self {
        self.deployment_id = Some(deployment_id.into());
        self
    }
}

pub struct PipelineRunner {
    deployments: Arc<dyn RecordStore<Deployment>>,
    snapshots: Arc<SnapshotService>,
    executor: Arc<dyn StageExecutor>,
    observer: Arc<dyn PipelineObserver>,
    audit: Arc<dyn AuditSink>,
    locks: Arc<RecordLocks>,
    verify_snapshot_on_capture: bool,
}

impl PipelineRunner {
    pub fn new(
        deployments: Arc<dyn RecordStore<Deployment>>,
        snapshots: Arc<SnapshotService>,
        executor: Arc<dyn StageExecutor>,
        audit: Arc<dyn AuditSink>,
        locks: Arc<RecordLocks>,
    ) -> Self {
        Self {
            deployments,
            snapshots,
            executor,
            observer: Arc::new(NoopObserver),
            audit,
            locks,
            verify_snapshot_on_capture: true,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_snapshot_verification(mut self, verify: bool) -> Self {
        self.verify_snapshot_on_capture = verify;
        self
    }

    pub async fn get_deployment(
        &self,
        deployment_id: &str,
    ) -> Result<Option<Deployment>, PipelineError> {
        Ok(self.deployments.get(deployment_id).await?)
    }

    /// Deployments of an environment, newest first
    pub async fn list_deployments(
        &self,
        environment: Environment,
    ) -> Result<Vec<Deployment>, PipelineError> {
        let mut deployments = self
            .deployments
            .list(&RecordFilter::new().eq("environment", environment))
            .await?;
        deployments.sort_by(|a, b| b.deployed_at.cmp(&a.deployed_at));
        Ok(deployments)
    }

    /// Run a pipeline end to end
    ///
    /// Stage failures are reported through the returned [`DeploymentResult`];
    /// `Err` is reserved for invalid input and storage failures.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
    ) -> Result<DeploymentResult, PipelineError> {
        let ExecutionRequest {
            deployment_id,
            config,
            environment,
            version,
            deployed_by,
        } = request;

        config.validate().map_err(PipelineError::InvalidPipeline)?;
        if config.target_environment != environment {
            return Err(PipelineError::InvalidPipeline(format!(
                "pipeline {} targets {} but {} was requested",
                config.id, config.target_environment, environment
            )));
        }

        let started = Instant::now();
        let deployment_id = deployment_id.unwrap_or_else(new_id);
        let deployment = Deployment {
            id: deployment_id.clone(),
            environment,
            version: version.clone(),
            status: DeploymentStatus::Pending,
            pipeline_config: config.clone(),
            snapshot_id: None,
            deployed_by: deployed_by.clone(),
            deployed_at: chrono::Utc::now(),
            finished_at: None,
            rollback_available: false,
            logs: Vec::new(),
            stage_results: Vec::new(),
            failed_stage: None,
            error: None,
            rolled_back_from: None,
        };
        self.deployments.create(deployment).await?;
        info!(
            "🚀 Starting deployment {} of {} to {} ({} stages)",
            deployment_id,
            version,
            environment,
            config.stages.len()
        );

        let verify = self.verify_snapshot_on_capture;
        let snapshot = match capture_for_deployment(&self.snapshots, environment, verify).await {
            Ok(snapshot) => snapshot,
            Err(SnapshotError::Store(e)) => return Err(e.into()),
            Err(e) => {
                let message = format!("Pre-deployment snapshot failed: {}", e);
                error!("❌ Deployment {}: {}", deployment_id, message);
                self.update_deployment(&deployment_id, |d| {
                    d.status = DeploymentStatus::Failed;
                    d.finished_at = Some(chrono::Utc::now());
                    d.logs.push(message.clone());
                    d.error = Some(message.clone());
                })
                .await?;
                self.observer
                    .on_pipeline_finished(&deployment_id, false, Some(&message))
                    .await;
                self.audit_finished(&deployment_id, environment, &deployed_by, false, &message)
                    .await;
                return Ok(DeploymentResult {
                    deployment_id,
                    success: false,
                    status: DeploymentStatus::Failed,
                    snapshot_id: None,
                    stage_results: Vec::new(),
                    failed_stage: None,
                    error: Some(message),
                    duration_ms: started.elapsed().as_millis() as u64,
                    rollback_available: false,
                });
            }
        };

        let snapshot_id = snapshot.id.clone();
        self.update_deployment(&deployment_id, |d| {
            d.status = DeploymentStatus::InProgress;
            d.snapshot_id = Some(snapshot_id.clone());
            d.logs.push(format!(
                "Snapshot {} captured at revision {}",
                snapshot_id, snapshot.source_revision
            ));
        })
        .await?;
        self.observer.on_pipeline_started(&deployment_id, &config).await;

        let total = config.stages.len();
        let mut stage_results: Vec<StageResult> = Vec::with_capacity(total);
        let mut failure: Option<(String, String)> = None;

        for (index, stage) in config.stages.iter().enumerate() {
            self.observer
                .on_stage_started(&deployment_id, stage, index, total)
                .await;

            let context = StageContext {
                deployment_id: deployment_id.clone(),
                environment,
                branch_name: config.branch_name.clone(),
                progress: ProgressReporter::new(
                    deployment_id.clone(),
                    stage.name.clone(),
                    self.observer.clone(),
                ),
            };
            let mut result = run_stage(self.executor.as_ref(), stage, &context).await;

            if let ObserverVerdict::Fail(reason) =
                self.observer.on_stage_finished(&deployment_id, &result).await
            {
                if result.success {
                    warn!("⚠️ Stage {} failed by observer: {}", stage.name, reason);
                    result = StageResult {
                        success: false,
                        error: Some(reason),
                        ..result
                    };
                }
            }

            let log_line = match result.error {
                None => format!("Stage '{}' succeeded in {}ms", stage.name, result.duration_ms),
                Some(ref e) => format!("Stage '{}' failed: {}", stage.name, e),
            };
            let recorded = result.clone();
            self.update_deployment(&deployment_id, |d| {
                d.logs.push(log_line.clone());
                d.stage_results.push(recorded.clone());
            })
            .await?;

            let failed = !result.success;
            let error = result.error.clone().unwrap_or_else(|| "unknown error".to_string());
            stage_results.push(result);
            if failed {
                failure = Some((stage.name.clone(), error));
                break;
            }
        }

        let success = failure.is_none();
        let (failed_stage, error) = match failure {
            Some((stage, error)) => {
                let message = format!("Stage '{}' failed: {}", stage, error);
                (Some(stage), Some(message))
            }
            None => (None, None),
        };
        let status = if success {
            DeploymentStatus::Success
        } else {
            DeploymentStatus::Failed
        };
        let rollback_available = snapshot.verified;

        let finished = self
            .update_deployment(&deployment_id, |d| {
                d.status = status;
                d.finished_at = Some(chrono::Utc::now());
                d.failed_stage = failed_stage.clone();
                d.error = error.clone();
                d.rollback_available = rollback_available;
                d.logs.push(match error {
                    Some(ref e) => format!("Deployment failed. {}", e),
                    None => "Deployment completed successfully".to_string(),
                });
            })
            .await?;

        self.observer
            .on_pipeline_finished(&deployment_id, success, error.as_deref())
            .await;

        if success {
            info!(
                "✅ Deployment {} to {} succeeded in {}ms",
                deployment_id,
                environment,
                started.elapsed().as_millis()
            );
        } else {
            error!(
                "❌ Deployment {} to {} failed at stage {}",
                deployment_id,
                environment,
                failed_stage.as_deref().unwrap_or("unknown")
            );
        }
        self.audit_finished(
            &deployment_id,
            environment,
            &deployed_by,
            success,
            error.as_deref().unwrap_or("all stages passed"),
        )
        .await;

        Ok(DeploymentResult {
            deployment_id,
            success,
            status: finished.status,
            snapshot_id: Some(snapshot.id),
            stage_results,
            failed_stage,
            error,
            duration_ms: started.elapsed().as_millis() as u64,
            rollback_available,
        })
    }

    /// Record a deployment that did not come from a pipeline run
    ///
    /// Rollbacks use this to add a `rolled_back` entry to the history instead
    /// of rewriting the deployment they replace.
    pub async fn record_deployment(
        &self,
        deployment: Deployment,
    ) -> Result<Deployment, PipelineError> {
        let deployment = self.deployments.create(deployment).await?;
        info!(
            "📝 Recorded {} deployment {} for {}",
            deployment.status, deployment.id, deployment.environment
        );
        Ok(deployment)
    }

    /// Read-modify-write one deployment under its record lock
    ///
    /// Status changes must be forward transitions.
    pub async fn update_deployment<F>(
        &self,
        deployment_id: &str,
        mutate: F,
    ) -> Result<Deployment, PipelineError>
    where
        F: FnOnce(&mut Deployment),
    {
        let _guard = self.locks.lock(deployment_id).await;
        let mut deployment = self
            .deployments
            .get(deployment_id)
            .await?
            .ok_or_else(|| PipelineError::DeploymentNotFound(deployment_id.to_string()))?;

        let before = deployment.status;
        mutate(&mut deployment);
        if deployment.status != before && !before.can_transition_to(deployment.status) {
            return Err(PipelineError::InvalidTransition {
                id: deployment_id.to_string(),
                from: before,
                to: deployment.status,
            });
        }
        Ok(self.deployments.update(deployment).await?)
    }

    async fn audit_finished(
        &self,
        deployment_id: &str,
        environment: Environment,
        deployed_by: &str,
        success: bool,
        summary: &str,
    ) {
        let (action, description) = if success {
            ("DEPLOYMENT_SUCCEEDED", format!("Deployment {} succeeded", deployment_id))
        } else {
            ("DEPLOYMENT_FAILED", format!("Deployment {} failed", deployment_id))
        };
        record_audit(
            self.audit.as_ref(),
            AuditRecord::new(action, description)
                .with_actor(deployed_by)
                .with_context(json!({
                    "deployment_id": deployment_id,
                    "environment": environment,
                    "summary": summary,
                })),
        )
        .await;
    }
}
