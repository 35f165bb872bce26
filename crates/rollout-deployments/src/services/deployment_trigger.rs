//! Deployment Trigger
//!
//! User-facing entry point: checks the approval gate, generates the pipeline
//! and either runs it right away or parks it behind an approval request.

use rollout_core::{
    new_id, record_audit, Actor, AuditRecord, AuditSink, Environment, ServiceError, StatusUpdate,
};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::services::approval_gate::{
    ApprovalError, ApprovalGate, DeploymentApprovalRequest, NewApprovalRequest,
};
use crate::services::deployment_monitor::DeploymentMonitor;
use crate::services::pipeline_generator::{PipelineConfigError, PipelineConfigGenerator};
use crate::services::pipeline_runner::{ExecutionRequest, PipelineError, PipelineRunner};
use crate::services::types::{ChangeSpecification, DeploymentResult};

#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("Role {role} cannot trigger deployments")]
    PermissionDenied { role: rollout_core::Role },

    #[error(transparent)]
    Config(#[from] PipelineConfigError),

    #[error(transparent)]
    Approval(#[from] ApprovalError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl From<TriggerError> for ServiceError {
    fn from(err: TriggerError) -> Self {
        match err {
            TriggerError::PermissionDenied { .. } => ServiceError::PermissionDenied {
                action: err.to_string(),
            },
            TriggerError::Config(e) => e.into(),
            TriggerError::Approval(e) => e.into(),
            TriggerError::Pipeline(e) => e.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeploymentTriggerRequest {
    pub project_id: String,
    pub change: ChangeSpecification,
    /// Overrides the change's environment hint
    pub environment: Option<Environment>,
    pub version: String,
}

#[derive(Debug, Clone)]
pub enum TriggerOutcome {
    /// Parked until an approver resolves the request
    PendingApproval(DeploymentApprovalRequest),
    /// The pipeline ran; success or failure is in the result
    Executed(DeploymentResult),
    /// Approve called on a request that was already approved
    AlreadyApproved(DeploymentApprovalRequest),
}

impl TriggerOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            TriggerOutcome::PendingApproval(_) => "pending_approval",
            TriggerOutcome::Executed(result) if result.success => "succeeded",
            TriggerOutcome::Executed(_) => "failed",
            TriggerOutcome::AlreadyApproved(_) => "already_approved",
        }
    }

    pub fn is_pending_approval(&self) -> bool {
        matches!(self, TriggerOutcome::PendingApproval(_))
    }
}

pub struct DeploymentTrigger {
    gate: Arc<ApprovalGate>,
    generator: Arc<PipelineConfigGenerator>,
    runner: Arc<PipelineRunner>,
    monitor: Arc<DeploymentMonitor>,
    audit: Arc<dyn AuditSink>,
}

impl DeploymentTrigger {
    pub fn new(
        gate: Arc<ApprovalGate>,
        generator: Arc<PipelineConfigGenerator>,
        runner: Arc<PipelineRunner>,
        monitor: Arc<DeploymentMonitor>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            gate,
            generator,
            runner,
            monitor,
            audit,
        }
    }

    pub async fn trigger(
        &self,
        request: DeploymentTriggerRequest,
        actor: &Actor,
    ) -> Result<TriggerOutcome, TriggerError> {
        if !self.gate.policy().can_deploy(actor.role) {
            return Err(TriggerError::PermissionDenied { role: actor.role });
        }

        let mut change = request.change;
        if let Some(environment) = request.environment {
            change.environment_hint = Some(environment);
        }
        let config = self.generator.generate(&change)?;
        let environment = config.target_environment;

        record_audit(
            self.audit.as_ref(),
            AuditRecord::new(
                "DEPLOYMENT_TRIGGERED",
                format!("Deployment of {} to {} triggered", request.version, environment),
            )
            .with_actor(&actor.id)
            .with_context(json!({
                "project_id": request.project_id,
                "branch": config.branch_name,
                "pipeline_id": config.id,
                "environment": environment,
            })),
        )
        .await;

        if self.gate.requires_approval(environment, actor.role) {
            let deployment_id = new_id();
            let approval = self
                .gate
                .request_approval(
                    actor,
                    NewApprovalRequest {
                        deployment_id: deployment_id.clone(),
                        project_id: request.project_id,
                        version: request.version,
                        pipeline_config: config,
                    },
                )
                .await?;
            self.monitor.publish(
                StatusUpdate::new(
                    &deployment_id,
                    "pending_approval",
                    format!("Deployment to {} is waiting for approval", environment),
                )
                .with_metadata("approval_request_id", &approval.id),
            );
            return Ok(TriggerOutcome::PendingApproval(approval));
        }

        info!(
            "🚦 {} ({}) deploys to {} without approval",
            actor.id, actor.role, environment
        );
        let result = self
            .runner
            .execute(ExecutionRequest::new(config, request.version, &actor.id))
            .await?;
        Ok(TriggerOutcome::Executed(result))
    }

    /// Approve a pending request and run its pipeline immediately
    pub async fn approve(
        &self,
        request_id: &str,
        approver: &Actor,
        notes: Option<String>,
    ) -> Result<TriggerOutcome, TriggerError> {
        let decision = self.gate.approve(request_id, approver, notes).await?;
        if !decision.newly_resolved {
            return Ok(TriggerOutcome::AlreadyApproved(decision.request));
        }

        let request = decision.request;
        let execution = ExecutionRequest::new(
            request.pipeline_config.clone(),
            request.version.clone(),
            request.requested_by.clone(),
        )
        .with_deployment_id(request.deployment_id.clone());
        let result = self.runner.execute(execution).await?;
        Ok(TriggerOutcome::Executed(result))
    }

    /// Reject a pending request; only the audit trail remains
    pub async fn reject(
        &self,
        request_id: &str,
        approver: &Actor,
        notes: Option<String>,
    ) -> Result<DeploymentApprovalRequest, TriggerError> {
        let decision = self.gate.reject(request_id, approver, notes).await?;
        if decision.newly_resolved {
            self.monitor.publish(StatusUpdate::new(
                &decision.request.deployment_id,
                "rejected",
                format!(
                    "Deployment to {} was rejected by {}",
                    decision.request.environment, approver.id
                ),
            ));
        }
        Ok(decision.request)
    }
}
