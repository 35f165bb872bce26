//! Rollback Controller
//!
//! Request lifecycle:
//! `requested -> pending_approval -> approved -> executing -> completed | failed`,
//! with `rejected` as the other way out of `pending_approval`. There is no
//! path from a request to execution that skips the approval call.

use async_trait::async_trait;
use chrono::Utc;
use rollout_core::{
    new_id, record_audit, Actor, AuditRecord, AuditSink, Environment, NoopBroadcaster,
    PipelineConfig, RecordFilter, RecordLocks, RecordStore, Role, RollbackSettings, ServiceError,
    StatusBroadcaster, StatusUpdate, StoreError, UtcDateTime,
};
use rollout_deployments::{
    Deployment, DeploymentStatus, PipelineError, PipelineRunner, Snapshot, SnapshotError,
    SnapshotService,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::services::error_analysis::{analyze_error, ErrorAnalysis, Severity};
use crate::services::integrity::{IntegrityChecker, IntegrityReport};
use crate::services::recovery::{recovery_options, RecoveryAction};

#[derive(Error, Debug)]
pub enum RollbackError {
    #[error("Snapshot {0} not found")]
    SnapshotNotFound(String),

    #[error("Snapshot {0} has not been verified and cannot be a rollback target")]
    UnverifiedSnapshot(String),

    #[error("Snapshot {snapshot_id} belongs to {actual}, not {expected}")]
    EnvironmentMismatch {
        snapshot_id: String,
        expected: Environment,
        actual: Environment,
    },

    #[error("No verified snapshot available for {0}")]
    NoRollbackTarget(Environment),

    #[error("Rollback request {0} not found")]
    RequestNotFound(String),

    #[error("Role {role} is not allowed to {action} rollbacks")]
    PermissionDenied { role: Role, action: &'static str },

    #[error("Rollback request {id} is already {status}")]
    AlreadyResolved { id: String, status: RollbackStatus },

    #[error("Rollback request {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: RollbackStatus,
        to: RollbackStatus,
    },

    #[error("Invalid rollback request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<RollbackError> for ServiceError {
    fn from(err: RollbackError) -> Self {
        match err {
            RollbackError::SnapshotNotFound(_) | RollbackError::RequestNotFound(_) => {
                ServiceError::NotFound {
                    resource: err.to_string(),
                }
            }
            RollbackError::PermissionDenied { .. } => ServiceError::PermissionDenied {
                action: err.to_string(),
            },
            RollbackError::AlreadyResolved { .. } | RollbackError::InvalidTransition { .. } => {
                ServiceError::Conflict {
                    message: err.to_string(),
                }
            }
            RollbackError::Store(e) => e.into(),
            RollbackError::Pipeline(e) => e.into(),
            RollbackError::Snapshot(e) => e.into(),
            other => ServiceError::Validation {
                message: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    Requested,
    PendingApproval,
    Approved,
    Executing,
    Completed,
    Failed,
    Rejected,
}

impl RollbackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackStatus::Requested => "requested",
            RollbackStatus::PendingApproval => "pending_approval",
            RollbackStatus::Approved => "approved",
            RollbackStatus::Executing => "executing",
            RollbackStatus::Completed => "completed",
            RollbackStatus::Failed => "failed",
            RollbackStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RollbackStatus::Completed | RollbackStatus::Failed | RollbackStatus::Rejected
        )
    }

    pub fn can_transition_to(&self, next: RollbackStatus) -> bool {
        matches!(
            (self, next),
            (RollbackStatus::Requested, RollbackStatus::PendingApproval)
                | (RollbackStatus::PendingApproval, RollbackStatus::Approved)
                | (RollbackStatus::PendingApproval, RollbackStatus::Rejected)
                | (RollbackStatus::Approved, RollbackStatus::Executing)
                | (RollbackStatus::Executing, RollbackStatus::Completed)
                | (RollbackStatus::Executing, RollbackStatus::Failed)
        )
    }
}

impl fmt::Display for RollbackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who or what asked for the rollback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RollbackSource {
    Manual,
    SecurityAlert { alert_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackTransition {
    pub status: RollbackStatus,
    pub actor_id: String,
    pub at: UtcDateTime,
}

/// Outcome of executing a rollback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackResult {
    pub request_id: String,
    pub success: bool,
    /// Human-readable outcome; never empty
    pub summary: String,
    pub integrity: Option<IntegrityReport>,
    pub error: Option<String>,
    pub error_analysis: Option<ErrorAnalysis>,
    /// Ordered next steps, populated on failure
    pub recovery_options: Vec<RecoveryAction>,
    /// The `rolled_back` deployment recorded on success
    pub new_deployment_id: Option<String>,
    pub executor_output: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub id: String,
    pub environment: Environment,
    pub snapshot_id: String,
    /// Deployment being replaced; the newest one in the environment when unset
    pub deployment_id: Option<String>,
    pub reason: String,
    pub requested_by: String,
    pub requester_role: Role,
    pub source: RollbackSource,
    pub status: RollbackStatus,
    pub approved_by: Option<String>,
    pub approval_notes: Option<String>,
    pub transitions: Vec<RollbackTransition>,
    pub created_at: UtcDateTime,
    pub updated_at: UtcDateTime,
    pub completed_at: Option<UtcDateTime>,
    pub result: Option<RollbackResult>,
}

impl rollout_core::Record for RollbackRequest {
    const KIND: &'static str = "RollbackRequest";

    fn id(&self) -> &str {
        &self.id
    }
}

impl RollbackRequest {
    fn transition(&mut self, to: RollbackStatus, actor_id: &str) -> Result<(), RollbackError> {
        if !self.status.can_transition_to(to) {
            return Err(RollbackError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        let now = Utc::now();
        self.status = to;
        self.updated_at = now;
        if to.is_terminal() {
            self.completed_at = Some(now);
        }
        self.transitions.push(RollbackTransition {
            status: to,
            actor_id: actor_id.to_string(),
            at: now,
        });
        Ok(())
    }

    /// Id used on the status broadcast channel
    fn channel_id(&self) -> &str {
        self.deployment_id.as_deref().unwrap_or(&self.id)
    }
}

/// Input for a manual rollback request
#[derive(Debug, Clone)]
pub struct InitiateRollback {
    pub environment: Environment,
    pub snapshot_id: String,
    pub reason: String,
    pub deployment_id: Option<String>,
}

/// A verified snapshot offered as a rollback target
#[derive(Debug, Clone, Serialize)]
pub struct RollbackCandidate {
    pub snapshot: Snapshot,
    /// e.g. "3 hours ago"
    pub age_description: String,
    pub reasoning: String,
    /// Deployment that was made right after this snapshot was taken
    pub following_deployment: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RollbackDecision {
    pub request: RollbackRequest,
    /// False when the call repeated an earlier identical decision
    pub newly_resolved: bool,
}

/// Alert from an external security monitoring feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityAlert {
    pub id: String,
    pub environment: Environment,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub detected_at: UtcDateTime,
}

/// Who may ask for and approve rollbacks
#[derive(Debug, Clone)]
pub struct RollbackPolicy {
    pub requester_roles: Vec<Role>,
    pub approver_roles: Vec<Role>,
}

impl Default for RollbackPolicy {
    fn default() -> Self {
        Self {
            requester_roles: vec![Role::Admin, Role::Lead, Role::Developer],
            approver_roles: vec![Role::Admin, Role::Lead],
        }
    }
}

impl RollbackPolicy {
    pub fn can_request(&self, role: Role) -> bool {
        self.requester_roles.contains(&role)
    }

    pub fn can_approve(&self, role: Role) -> bool {
        self.approver_roles.contains(&role)
    }
}

/// Restores an environment to a snapshot
#[async_trait]
pub trait RollbackExecutor: Send + Sync {
    /// Returns executor output; the error string is categorized on failure
    async fn restore(&self, snapshot: &Snapshot, environment: Environment)
        -> Result<String, String>;
}

/// Opaque text generation used for candidate reasoning
#[async_trait]
pub trait Narrator: Send + Sync {
    async fn narrate(&self, prompt: &str) -> anyhow::Result<String>;
}

/// Human-readable age of a timestamp relative to `now`
pub fn describe_age(then: UtcDateTime, now: UtcDateTime) -> String {
    let seconds = (now - then).num_seconds().max(0);
    let (value, unit) = match seconds {
        s if s < 60 => return "just now".to_string(),
        s if s < 3_600 => (s / 60, "minute"),
        s if s < 86_400 => (s / 3_600, "hour"),
        s => (s / 86_400, "day"),
    };
    if value == 1 {
        format!("1 {} ago", unit)
    } else {
        format!("{} {}s ago", value, unit)
    }
}

fn template_reasoning(snapshot: &Snapshot, age: &str, following: Option<&Deployment>) -> String {
    let revision: String = snapshot.source_revision.chars().take(12).collect();
    let mut reasoning = format!(
        "Verified snapshot of {} at revision {} taken {} with {} configuration file(s)",
        snapshot.environment,
        revision,
        age,
        snapshot.config_files.len()
    );
    if snapshot.database_backup_handle.is_some() {
        reasoning.push_str(" and a database backup");
    }
    reasoning.push('.');
    if let Some(deployment) = following {
        reasoning.push_str(&format!(
            " Restores the state before version {} was deployed ({}).",
            deployment.version, deployment.status
        ));
    }
    reasoning
}

pub struct RollbackController {
    requests: Arc<dyn RecordStore<RollbackRequest>>,
    snapshots: Arc<SnapshotService>,
    runner: Arc<PipelineRunner>,
    executor: Arc<dyn RollbackExecutor>,
    checker: Arc<dyn IntegrityChecker>,
    audit: Arc<dyn AuditSink>,
    locks: Arc<RecordLocks>,
    /// Held while a request is opened and while snapshots are pruned
    targets: Mutex<()>,
    broadcaster: Arc<dyn StatusBroadcaster>,
    narrator: Option<Arc<dyn Narrator>>,
    policy: RollbackPolicy,
    settings: RollbackSettings,
}

impl RollbackController {
    pub fn new(
        requests: Arc<dyn RecordStore<RollbackRequest>>,
        snapshots: Arc<SnapshotService>,
        runner: Arc<PipelineRunner>,
        executor: Arc<dyn RollbackExecutor>,
        checker: Arc<dyn IntegrityChecker>,
        audit: Arc<dyn AuditSink>,
        locks: Arc<RecordLocks>,
    ) -> Self {
        Self {
            requests,
            snapshots,
            runner,
            executor,
            checker,
            audit,
            locks,
            targets: Mutex::new(()),
            broadcaster: Arc::new(NoopBroadcaster),
            narrator: None,
            policy: RollbackPolicy::default(),
            settings: RollbackSettings::default(),
        }
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn StatusBroadcaster>) -> Self {
        self.broadcaster = broadcaster;
        self
    }

    pub fn with_narrator(mut self, narrator: Arc<dyn Narrator>) -> Self {
        self.narrator = Some(narrator);
        self
    }

    pub fn with_policy(mut self, policy: RollbackPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_settings(mut self, settings: RollbackSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Verified snapshots of an environment, newest first, with reasoning
    pub async fn list_candidates(
        &self,
        environment: Environment,
    ) -> Result<Vec<RollbackCandidate>, RollbackError> {
        let snapshots = self.snapshots.list_verified(environment).await?;
        let deployments = self.runner.list_deployments(environment).await?;
        let now = Utc::now();

        let mut candidates = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            let age_description = describe_age(snapshot.created_at, now);
            let following = deployments
                .iter()
                .find(|d| d.snapshot_id.as_deref() == Some(snapshot.id.as_str()));
            let template = template_reasoning(&snapshot, &age_description, following);
            let reasoning = self.narrate(&template).await.unwrap_or(template);

            candidates.push(RollbackCandidate {
                following_deployment: following.map(|d| d.id.clone()),
                snapshot,
                age_description,
                reasoning,
            });
        }
        Ok(candidates)
    }

    async fn narrate(&self, template: &str) -> Option<String> {
        let narrator = self.narrator.as_ref()?;
        let prompt = format!(
            "Explain in two sentences why an operator might roll back to this snapshot: {}",
            template
        );
        match narrator.narrate(&prompt).await {
            Ok(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
            Ok(_) => None,
            Err(e) => {
                warn!("Narrator unavailable, using template reasoning: {}", e);
                None
            }
        }
    }

    /// Validate the target and open a request that waits for approval
    ///
    /// Nothing is stored when validation fails.
    pub async fn initiate(
        &self,
        request: InitiateRollback,
        actor: &Actor,
    ) -> Result<RollbackRequest, RollbackError> {
        if !self.policy.can_request(actor.role) {
            return Err(RollbackError::PermissionDenied {
                role: actor.role,
                action: "request",
            });
        }
        self.open_request(request, actor, RollbackSource::Manual)
            .await
    }

    async fn open_request(
        &self,
        request: InitiateRollback,
        actor: &Actor,
        source: RollbackSource,
    ) -> Result<RollbackRequest, RollbackError> {
        if request.reason.trim().is_empty() {
            return Err(RollbackError::InvalidRequest(
                "a reason is required".to_string(),
            ));
        }

        // The snapshot must not be pruned between validation and create
        let targets_guard = self.targets.lock().await;
        let snapshot = self
            .snapshots
            .get(&request.snapshot_id)
            .await?
            .ok_or_else(|| RollbackError::SnapshotNotFound(request.snapshot_id.clone()))?;
        if snapshot.environment != request.environment {
            return Err(RollbackError::EnvironmentMismatch {
                snapshot_id: snapshot.id,
                expected: request.environment,
                actual: snapshot.environment,
            });
        }
        if !snapshot.verified {
            return Err(RollbackError::UnverifiedSnapshot(snapshot.id));
        }

        let now = Utc::now();
        let mut rollback = RollbackRequest {
            id: new_id(),
            environment: request.environment,
            snapshot_id: snapshot.id.clone(),
            deployment_id: request.deployment_id,
            reason: request.reason,
            requested_by: actor.id.clone(),
            requester_role: actor.role,
            source,
            status: RollbackStatus::Requested,
            approved_by: None,
            approval_notes: None,
            transitions: vec![RollbackTransition {
                status: RollbackStatus::Requested,
                actor_id: actor.id.clone(),
                at: now,
            }],
            created_at: now,
            updated_at: now,
            completed_at: None,
            result: None,
        };
        rollback.transition(RollbackStatus::PendingApproval, &actor.id)?;
        let rollback = self.requests.create(rollback).await?;
        drop(targets_guard);

        info!(
            "⏪ Rollback {} of {} to snapshot {} requested by {}",
            rollback.id, rollback.environment, rollback.snapshot_id, actor.id
        );
        record_audit(
            self.audit.as_ref(),
            AuditRecord::new(
                "ROLLBACK_REQUESTED",
                format!(
                    "Rollback of {} to snapshot {} requested",
                    rollback.environment, rollback.snapshot_id
                ),
            )
            .with_actor(&actor.id)
            .with_context(json!({
                "rollback_request_id": rollback.id,
                "snapshot_id": rollback.snapshot_id,
                "reason": rollback.reason,
                "source": rollback.source,
            })),
        )
        .await;
        self.broadcaster.publish(
            StatusUpdate::new(
                rollback.channel_id(),
                "rollback_pending_approval",
                format!("Rollback of {} is waiting for approval", rollback.environment),
            )
            .with_metadata("rollback_request_id", &rollback.id),
        );
        Ok(rollback)
    }

    pub async fn get(&self, request_id: &str) -> Result<RollbackRequest, RollbackError> {
        self.requests
            .get(request_id)
            .await?
            .ok_or_else(|| RollbackError::RequestNotFound(request_id.to_string()))
    }

    /// Requests for an environment, newest first
    pub async fn list_requests(
        &self,
        environment: Environment,
    ) -> Result<Vec<RollbackRequest>, RollbackError> {
        let mut requests = self
            .requests
            .list(&RecordFilter::new().eq("environment", environment))
            .await?;
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(requests)
    }

    /// Requests waiting for approval, oldest first; empty for non-approvers
    pub async fn pending_for(&self, actor: &Actor) -> Result<Vec<RollbackRequest>, RollbackError> {
        if !self.policy.can_approve(actor.role) {
            return Ok(Vec::new());
        }
        let mut pending = self
            .requests
            .list(&RecordFilter::new().eq("status", RollbackStatus::PendingApproval))
            .await?;
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pending)
    }

    /// Approve a pending request
    ///
    /// The initiator may approve their own request; the explicit call is the
    /// human confirmation. Approving again is a no-op.
    pub async fn approve(
        &self,
        request_id: &str,
        approver: &Actor,
        notes: Option<String>,
    ) -> Result<RollbackDecision, RollbackError> {
        self.resolve(request_id, approver, notes, RollbackStatus::Approved)
            .await
    }

    /// Reject a pending request; rejecting again is a no-op
    pub async fn reject(
        &self,
        request_id: &str,
        approver: &Actor,
        notes: Option<String>,
    ) -> Result<RollbackDecision, RollbackError> {
        self.resolve(request_id, approver, notes, RollbackStatus::Rejected)
            .await
    }

    async fn resolve(
        &self,
        request_id: &str,
        approver: &Actor,
        notes: Option<String>,
        decision: RollbackStatus,
    ) -> Result<RollbackDecision, RollbackError> {
        if !self.policy.can_approve(approver.role) {
            return Err(RollbackError::PermissionDenied {
                role: approver.role,
                action: if decision == RollbackStatus::Approved {
                    "approve"
                } else {
                    "reject"
                },
            });
        }

        let _guard = self.locks.lock(request_id).await;
        let mut request = self.get(request_id).await?;

        let already = match decision {
            RollbackStatus::Approved => matches!(
                request.status,
                RollbackStatus::Approved
                    | RollbackStatus::Executing
                    | RollbackStatus::Completed
                    | RollbackStatus::Failed
            ),
            _ => request.status == decision,
        };
        if already {
            return Ok(RollbackDecision {
                request,
                newly_resolved: false,
            });
        }
        if request.status != RollbackStatus::PendingApproval {
            return Err(RollbackError::AlreadyResolved {
                id: request.id,
                status: request.status,
            });
        }

        request.transition(decision, &approver.id)?;
        request.approved_by = Some(approver.id.clone());
        request.approval_notes = notes;
        let request = self.requests.update(request).await?;

        let action = if decision == RollbackStatus::Approved {
            "ROLLBACK_APPROVED"
        } else {
            "ROLLBACK_REJECTED"
        };
        info!("⏪ Rollback {} {} by {}", request.id, decision, approver.id);
        record_audit(
            self.audit.as_ref(),
            AuditRecord::new(
                action,
                format!("Rollback of {} {}", request.environment, decision),
            )
            .with_actor(&approver.id)
            .with_context(json!({
                "rollback_request_id": request.id,
                "requested_by": request.requested_by,
                "notes": request.approval_notes,
            })),
        )
        .await;
        self.broadcaster.publish(StatusUpdate::new(
            request.channel_id(),
            format!("rollback_{}", decision),
            format!("Rollback of {} {} by {}", request.environment, decision, approver.id),
        ));

        Ok(RollbackDecision {
            request,
            newly_resolved: true,
        })
    }

    /// Execute an approved rollback
    ///
    /// Runs the restore, then the integrity checklist. Any failure is
    /// categorized and paired with recovery options; nothing is retried.
    pub async fn execute(
        &self,
        request_id: &str,
        actor: &Actor,
    ) -> Result<RollbackResult, RollbackError> {
        if !self.policy.can_approve(actor.role) {
            return Err(RollbackError::PermissionDenied {
                role: actor.role,
                action: "execute",
            });
        }

        // Claim the request so a second caller cannot execute it too
        let request = {
            let _guard = self.locks.lock(request_id).await;
            let mut request = self.get(request_id).await?;
            request.transition(RollbackStatus::Executing, &actor.id)?;
            self.requests.update(request).await?
        };
        info!(
            "⏪ Executing rollback {} of {} to snapshot {}",
            request.id, request.environment, request.snapshot_id
        );
        self.broadcaster.publish(StatusUpdate::new(
            request.channel_id(),
            "rollback_executing",
            format!("Rolling back {} to snapshot {}", request.environment, request.snapshot_id),
        ));

        let started = Instant::now();
        let (outcome, integrity, executor_output) = self.perform(&request).await;

        let mut result = RollbackResult {
            request_id: request.id.clone(),
            success: false,
            summary: String::new(),
            integrity,
            error: None,
            error_analysis: None,
            recovery_options: Vec::new(),
            new_deployment_id: None,
            executor_output,
            duration_ms: 0,
        };

        let final_status = match outcome {
            Ok(snapshot) => match self.record_rollback_history(&request, &snapshot).await {
                Ok(deployment) => {
                    result.success = true;
                    result.new_deployment_id = Some(deployment.id);
                    result.summary = format!(
                        "Rolled back {} to revision {}; {}",
                        request.environment,
                        snapshot.source_revision,
                        result
                            .integrity
                            .as_ref()
                            .map(|report| report.pass_summary())
                            .unwrap_or_else(|| "integrity not checked".to_string())
                    );
                    RollbackStatus::Completed
                }
                Err(e) => {
                    error!("Failed to record rollback history for {}: {}", request.id, e);
                    Self::fail_result(&mut result, e.to_string());
                    RollbackStatus::Failed
                }
            },
            Err(message) => {
                Self::fail_result(&mut result, message);
                RollbackStatus::Failed
            }
        };
        result.duration_ms = started.elapsed().as_millis() as u64;

        let request = match self.finish(&request.id, final_status, &result, actor).await {
            Ok(request) => request,
            Err(e) => {
                error!("Failed to record outcome of rollback {}: {}", request.id, e);
                if final_status != RollbackStatus::Failed {
                    if let Err(e) = self
                        .finish(&request.id, RollbackStatus::Failed, &result, actor)
                        .await
                    {
                        error!("Rollback {} left in executing: {}", request.id, e);
                    }
                }
                return Err(e);
            }
        };

        if result.success {
            info!("✅ Rollback {} completed", request.id);
        } else {
            error!("❌ Rollback {} failed: {}", request.id, result.summary);
        }
        record_audit(
            self.audit.as_ref(),
            AuditRecord::new(
                if result.success {
                    "ROLLBACK_COMPLETED"
                } else {
                    "ROLLBACK_FAILED"
                },
                result.summary.clone(),
            )
            .with_actor(&actor.id)
            .with_context(json!({
                "rollback_request_id": request.id,
                "snapshot_id": request.snapshot_id,
                "new_deployment_id": result.new_deployment_id,
                "error_category": result.error_analysis.as_ref().map(|a| a.category),
            })),
        )
        .await;
        self.broadcaster.publish(
            StatusUpdate::new(
                request.channel_id(),
                format!("rollback_{}", request.status),
                result.summary.clone(),
            )
            .with_metadata("rollback_request_id", &request.id),
        );

        Ok(result)
    }

    async fn finish(
        &self,
        request_id: &str,
        status: RollbackStatus,
        result: &RollbackResult,
        actor: &Actor,
    ) -> Result<RollbackRequest, RollbackError> {
        let _guard = self.locks.lock(request_id).await;
        let mut request = self.get(request_id).await?;
        request.transition(status, &actor.id)?;
        request.result = Some(result.clone());
        Ok(self.requests.update(request).await?)
    }

    /// Restore and verify; the error string feeds the categorizer
    async fn perform(
        &self,
        request: &RollbackRequest,
    ) -> (Result<Snapshot, String>, Option<IntegrityReport>, String) {
        let snapshot = match self.snapshots.get(&request.snapshot_id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                return (
                    Err(format!("Snapshot {} not found", request.snapshot_id)),
                    None,
                    String::new(),
                )
            }
            Err(e) => return (Err(e.to_string()), None, String::new()),
        };

        let output = match self.executor.restore(&snapshot, request.environment).await {
            Ok(output) => output,
            Err(message) => return (Err(message), None, String::new()),
        };

        let report = self.checker.check(request.environment, &snapshot).await;
        if report.passed {
            (Ok(snapshot), Some(report), output)
        } else {
            let message = report.failure_summary();
            (Err(message), Some(report), output)
        }
    }

    fn fail_result(result: &mut RollbackResult, message: String) {
        let analysis = analyze_error(&message);
        result.recovery_options = recovery_options(analysis.category);
        result.summary = format!(
            "Rollback failed. {} Next step: {}.",
            analysis.summary,
            result
                .recovery_options
                .first()
                .map(|a| a.title.as_str())
                .unwrap_or("inspect the rollback logs")
        );
        result.error = Some(message);
        result.error_analysis = Some(analysis);
    }

    /// Record the `rolled_back` deployment and retire the one it replaced
    async fn record_rollback_history(
        &self,
        request: &RollbackRequest,
        snapshot: &Snapshot,
    ) -> Result<Deployment, RollbackError> {
        let replaced = match request.deployment_id {
            Some(ref id) => self.runner.get_deployment(id).await?,
            None => self
                .runner
                .list_deployments(request.environment)
                .await?
                .into_iter()
                .next(),
        };

        let now = Utc::now();
        let pipeline_config = replaced
            .as_ref()
            .map(|d| d.pipeline_config.clone())
            .unwrap_or_else(|| PipelineConfig {
                id: new_id(),
                source_spec_id: request.id.clone(),
                branch_name: snapshot.source_revision.clone(),
                stages: Vec::new(),
                target_environment: request.environment,
                created_at: now,
            });

        let deployment = self
            .runner
            .record_deployment(Deployment {
                id: new_id(),
                environment: request.environment,
                version: snapshot.source_revision.clone(),
                status: DeploymentStatus::RolledBack,
                pipeline_config,
                snapshot_id: Some(snapshot.id.clone()),
                deployed_by: request.requested_by.clone(),
                deployed_at: now,
                finished_at: Some(now),
                rollback_available: false,
                logs: vec![format!(
                    "Rolled back to snapshot {} (revision {}): {}",
                    snapshot.id, snapshot.source_revision, request.reason
                )],
                stage_results: Vec::new(),
                failed_stage: None,
                error: None,
                rolled_back_from: replaced.as_ref().map(|d| d.id.clone()),
            })
            .await?;

        if let Some(replaced) = replaced {
            self.runner
                .update_deployment(&replaced.id, |d| {
                    d.rollback_available = false;
                    d.logs
                        .push(format!("Replaced by rollback deployment {}", deployment.id));
                })
                .await?;
        }
        Ok(deployment)
    }

    /// Turn a high or critical security alert into a pending rollback
    ///
    /// Targets the newest verified snapshot. The request still waits for a
    /// human approval. Lower severities and alerts that already have an open
    /// request return `None`.
    pub async fn handle_security_alert(
        &self,
        alert: &SecurityAlert,
    ) -> Result<Option<RollbackRequest>, RollbackError> {
        if alert.severity < Severity::High {
            debug!(
                "Security alert {} ({:?}) below rollback threshold",
                alert.id, alert.severity
            );
            return Ok(None);
        }

        let source = RollbackSource::SecurityAlert {
            alert_id: alert.id.clone(),
        };
        let open = self
            .list_requests(alert.environment)
            .await?
            .into_iter()
            .any(|r| r.source == source && !r.status.is_terminal());
        if open {
            debug!("Security alert {} already has an open rollback", alert.id);
            return Ok(None);
        }

        let target = self
            .snapshots
            .list_verified(alert.environment)
            .await?
            .into_iter()
            .next()
            .ok_or(RollbackError::NoRollbackTarget(alert.environment))?;

        warn!(
            "🚨 Security alert {} on {}: proposing rollback to {}",
            alert.id, alert.environment, target.id
        );
        let request = self
            .open_request(
                InitiateRollback {
                    environment: alert.environment,
                    snapshot_id: target.id,
                    reason: format!("Security alert: {}", alert.title),
                    deployment_id: None,
                },
                &Actor::system("security-monitor"),
                source,
            )
            .await?;
        Ok(Some(request))
    }

    /// Snapshot ids that open requests still point at
    pub async fn protected_snapshots(&self) -> Result<HashSet<String>, RollbackError> {
        Ok(self
            .requests
            .list(&RecordFilter::new())
            .await?
            .into_iter()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.snapshot_id)
            .collect())
    }

    /// Prune old snapshots of an environment, keeping rollback targets
    pub async fn prune_snapshots(
        &self,
        environment: Environment,
    ) -> Result<Vec<String>, RollbackError> {
        let _targets = self.targets.lock().await;
        let protected = self.protected_snapshots().await?;
        Ok(self
            .snapshots
            .prune(environment, self.settings.snapshots_per_environment, &protected)
            .await?)
    }

    /// Drop terminal requests older than the retention period
    pub async fn purge_terminal(&self) -> Result<usize, RollbackError> {
        let retention = chrono::Duration::seconds(self.settings.terminal_retention_secs as i64);
        self.purge_terminal_before(Utc::now() - retention).await
    }

    /// Periodically purge finished requests until the handle is aborted
    pub fn spawn_retention_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = controller.purge_terminal().await {
                    warn!("Rollback retention sweep failed: {}", e);
                }
            }
        })
    }

    pub async fn purge_terminal_before(&self, cutoff: UtcDateTime) -> Result<usize, RollbackError> {
        let mut purged = 0;
        for request in self.requests.list(&RecordFilter::new()).await? {
            let expired = request.status.is_terminal()
                && request.completed_at.map(|at| at < cutoff).unwrap_or(false);
            if expired && self.requests.delete(&request.id).await? {
                purged += 1;
            }
        }
        if purged > 0 {
            info!("🧹 Purged {} finished rollback requests", purged);
        }
        Ok(purged)
    }
}
