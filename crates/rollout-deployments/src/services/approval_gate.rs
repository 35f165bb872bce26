//! Approval Gate
//!
//! Static per-environment policy deciding who may deploy unattended and who
//! may sign off on a pending deployment.

use rollout_core::{
    new_id, record_audit, Actor, ApprovalSettings, AuditRecord, AuditSink, Environment,
    PipelineConfig, Record, RecordFilter, RecordLocks, RecordStore, Role, ServiceError,
    StoreError, UtcDateTime,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ApprovalError {
    #[error("Approval request {0} not found")]
    NotFound(String),

    #[error("Role {role} cannot {action} in {environment}")]
    PermissionDenied {
        role: Role,
        action: &'static str,
        environment: Environment,
    },

    #[error("{actor} cannot approve their own deployment request")]
    SelfApproval { actor: String },

    #[error("Approval request {id} is already {status}")]
    AlreadyResolved { id: String, status: ApprovalStatus },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ApprovalError> for ServiceError {
    fn from(err: ApprovalError) -> Self {
        match err {
            ApprovalError::NotFound(id) => ServiceError::NotFound {
                resource: format!("Approval request {}", id),
            },
            ApprovalError::PermissionDenied { .. } | ApprovalError::SelfApproval { .. } => {
                ServiceError::PermissionDenied {
                    action: err.to_string(),
                }
            }
            ApprovalError::AlreadyResolved { .. } => ServiceError::Conflict {
                message: err.to_string(),
            },
            ApprovalError::Store(e) => e.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApprovalStatus::Pending => write!(f, "pending"),
            ApprovalStatus::Approved => write!(f, "approved"),
            ApprovalStatus::Rejected => write!(f, "rejected"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentApprovalRequest {
    pub id: String,
    /// Id the deployment will get once approved
    pub deployment_id: String,
    pub project_id: String,
    pub environment: Environment,
    pub version: String,
    pub requested_by: String,
    pub requester_role: Role,
    pub requested_at: UtcDateTime,
    pub status: ApprovalStatus,
    pub approved_by: Option<String>,
    pub approval_notes: Option<String>,
    pub resolved_at: Option<UtcDateTime>,
    /// Pipeline generated at request time, run as-is on approval
    pub pipeline_config: PipelineConfig,
}

impl Record for DeploymentApprovalRequest {
    const KIND: &'static str = "ApprovalRequest";

    fn id(&self) -> &str {
        &self.id
    }
}

/// Roles for one environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentRule {
    /// Roles that deploy without waiting for approval
    pub exempt_roles: Vec<Role>,
    pub approver_roles: Vec<Role>,
}

/// Per-environment approval policy
#[derive(Debug, Clone)]
pub struct ApprovalPolicy {
    rules: HashMap<Environment, EnvironmentRule>,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        let mut rules = HashMap::new();
        rules.insert(
            Environment::Production,
            EnvironmentRule {
                exempt_roles: vec![Role::Admin],
                approver_roles: vec![Role::Admin, Role::Lead],
            },
        );
        rules.insert(
            Environment::Staging,
            EnvironmentRule {
                exempt_roles: vec![Role::Admin, Role::Lead],
                approver_roles: vec![Role::Admin, Role::Lead],
            },
        );
        rules.insert(
            Environment::Development,
            EnvironmentRule {
                exempt_roles: vec![Role::Admin, Role::Lead, Role::Developer],
                approver_roles: vec![Role::Admin, Role::Lead, Role::Developer],
            },
        );
        Self { rules }
    }
}

impl ApprovalPolicy {
    pub fn with_rule(mut self, environment: Environment, rule: EnvironmentRule) -> Self {
        self.rules.insert(environment, rule);
        self
    }

    /// Viewers never deploy
    pub fn can_deploy(&self, role: Role) -> bool {
        role != Role::Viewer
    }

    /// Environments without a rule always require approval
    pub fn requires_approval(&self, environment: Environment, role: Role) -> bool {
        self.rules
            .get(&environment)
            .map_or(true, |rule| !rule.exempt_roles.contains(&role))
    }

    pub fn can_approve(&self, role: Role, environment: Environment) -> bool {
        self.rules
            .get(&environment)
            .map_or(false, |rule| rule.approver_roles.contains(&role))
    }
}

/// Input for a new approval request
#[derive(Debug, Clone)]
pub struct NewApprovalRequest {
    pub deployment_id: String,
    pub project_id: String,
    pub version: String,
    pub pipeline_config: PipelineConfig,
}

/// Result of an approve/reject call
#[derive(Debug, Clone)]
pub struct ApprovalDecision {
    pub request: DeploymentApprovalRequest,
    /// False when the request was already in the requested state
    pub newly_resolved: bool,
}

pub struct ApprovalGate {
    policy: ApprovalPolicy,
    requests: Arc<dyn RecordStore<DeploymentApprovalRequest>>,
    locks: Arc<RecordLocks>,
    audit: Arc<dyn AuditSink>,
    settings: ApprovalSettings,
}

impl ApprovalGate {
    pub fn new(
        policy: ApprovalPolicy,
        requests: Arc<dyn RecordStore<DeploymentApprovalRequest>>,
        locks: Arc<RecordLocks>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            policy,
            requests,
            locks,
            audit,
            settings: ApprovalSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: ApprovalSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn policy(&self) -> &ApprovalPolicy {
        &self.policy
    }

    pub fn requires_approval(&self, environment: Environment, role: Role) -> bool {
        self.policy.requires_approval(environment, role)
    }

    pub fn can_approve(&self, role: Role, environment: Environment) -> bool {
        self.policy.can_approve(role, environment)
    }

    /// Record a pending request for `requester`
    pub async fn request_approval(
        &self,
        requester: &Actor,
        new_request: NewApprovalRequest,
    ) -> Result<DeploymentApprovalRequest, ApprovalError> {
        let environment = new_request.pipeline_config.target_environment;
        if !self.policy.can_deploy(requester.role) {
            return Err(ApprovalError::PermissionDenied {
                role: requester.role,
                action: "deploy",
                environment,
            });
        }

        let request = DeploymentApprovalRequest {
            id: new_id(),
            deployment_id: new_request.deployment_id,
            project_id: new_request.project_id,
            environment,
            version: new_request.version,
            requested_by: requester.id.clone(),
            requester_role: requester.role,
            requested_at: chrono::Utc::now(),
            status: ApprovalStatus::Pending,
            approved_by: None,
            approval_notes: None,
            resolved_at: None,
            pipeline_config: new_request.pipeline_config,
        };
        let request = self.requests.create(request).await?;

        info!(
            "⏸️ Deployment {} to {} awaiting approval (request {})",
            request.deployment_id, environment, request.id
        );
        record_audit(
            self.audit.as_ref(),
            AuditRecord::new(
                "DEPLOYMENT_APPROVAL_REQUESTED",
                format!(
                    "Deployment of {} to {} requires approval",
                    request.version, environment
                ),
            )
            .with_actor(&requester.id)
            .with_context(json!({
                "request_id": request.id,
                "deployment_id": request.deployment_id,
                "project_id": request.project_id,
                "environment": environment,
            })),
        )
        .await;
        Ok(request)
    }

    pub async fn get(&self, request_id: &str) -> Result<DeploymentApprovalRequest, ApprovalError> {
        self.requests
            .get(request_id)
            .await?
            .ok_or_else(|| ApprovalError::NotFound(request_id.to_string()))
    }

    /// Pending requests `actor` is allowed to resolve, oldest first
    pub async fn pending_for(
        &self,
        actor: &Actor,
    ) -> Result<Vec<DeploymentApprovalRequest>, ApprovalError> {
        let mut pending: Vec<DeploymentApprovalRequest> = self
            .requests
            .list(&RecordFilter::new().eq("status", ApprovalStatus::Pending))
            .await?
            .into_iter()
            .filter(|r| self.policy.can_approve(actor.role, r.environment))
            .collect();
        pending.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        Ok(pending)
    }

    pub async fn approve(
        &self,
        request_id: &str,
        approver: &Actor,
        notes: Option<String>,
    ) -> Result<ApprovalDecision, ApprovalError> {
        self.resolve(request_id, approver, ApprovalStatus::Approved, notes)
            .await
    }

    pub async fn reject(
        &self,
        request_id: &str,
        approver: &Actor,
        notes: Option<String>,
    ) -> Result<ApprovalDecision, ApprovalError> {
        self.resolve(request_id, approver, ApprovalStatus::Rejected, notes)
            .await
    }

    async fn resolve(
        &self,
        request_id: &str,
        approver: &Actor,
        target: ApprovalStatus,
        notes: Option<String>,
    ) -> Result<ApprovalDecision, ApprovalError> {
        let _guard = self.locks.lock(request_id).await;
        let mut request = self.get(request_id).await?;

        let action = match target {
            ApprovalStatus::Rejected => "reject deployments",
            _ => "approve deployments",
        };
        if !self.policy.can_approve(approver.role, request.environment) {
            return Err(ApprovalError::PermissionDenied {
                role: approver.role,
                action,
                environment: request.environment,
            });
        }
        if approver.id == request.requested_by {
            return Err(ApprovalError::SelfApproval {
                actor: approver.id.clone(),
            });
        }

        if request.status == target {
            debug!("Approval request {} already {}", request.id, target);
            return Ok(ApprovalDecision {
                request,
                newly_resolved: false,
            });
        }
        if request.status != ApprovalStatus::Pending {
            return Err(ApprovalError::AlreadyResolved {
                id: request.id,
                status: request.status,
            });
        }

        request.status = target;
        request.approved_by = Some(approver.id.clone());
        request.approval_notes = notes;
        request.resolved_at = Some(chrono::Utc::now());
        let request = self.requests.update(request).await?;

        let (action_type, verb) = match target {
            ApprovalStatus::Rejected => ("DEPLOYMENT_REJECTED", "rejected"),
            _ => ("DEPLOYMENT_APPROVED", "approved"),
        };
        info!(
            "🗳️ Approval request {} {} by {} ({})",
            request.id, verb, approver.id, approver.role
        );
        record_audit(
            self.audit.as_ref(),
            AuditRecord::new(
                action_type,
                format!(
                    "Deployment {} to {} {} by {}",
                    request.deployment_id, request.environment, verb, approver.id
                ),
            )
            .with_actor(&approver.id)
            .with_context(json!({
                "request_id": request.id,
                "deployment_id": request.deployment_id,
                "requested_by": request.requested_by,
                "environment": request.environment,
                "notes": request.approval_notes,
            })),
        )
        .await;

        Ok(ApprovalDecision {
            request,
            newly_resolved: true,
        })
    }

    /// Drop resolved requests older than `cutoff`; pending ones never expire
    pub async fn purge_resolved_before(
        &self,
        cutoff: UtcDateTime,
    ) -> Result<usize, ApprovalError> {
        let mut purged = 0;
        for status in [ApprovalStatus::Approved, ApprovalStatus::Rejected] {
            let resolved = self
                .requests
                .list(&RecordFilter::new().eq("status", status))
                .await?;
            for request in resolved {
                if request.resolved_at.map_or(false, |at| at <= cutoff)
                    && self.requests.delete(&request.id).await?
                {
                    purged += 1;
                }
            }
        }
        Ok(purged)
    }

    /// Drop resolved requests older than the retention period
    pub async fn purge_resolved(&self) -> Result<usize, ApprovalError> {
        let retention = chrono::Duration::seconds(self.settings.resolved_retention_secs as i64);
        let purged = self.purge_resolved_before(chrono::Utc::now() - retention).await?;
        if purged > 0 {
            info!("🧹 Purged {} resolved approval requests", purged);
        }
        Ok(purged)
    }

    /// Periodically purge resolved requests until the handle is aborted
    pub fn spawn_retention_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let gate = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = gate.purge_resolved().await {
                    warn!("Approval retention sweep failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingAuditSink;
    use rollout_core::{InMemoryRecordStore, PipelineStage};

    fn new_request(deployment_id: &str) -> NewApprovalRequest {
        NewApprovalRequest {
            deployment_id: deployment_id.to_string(),
            project_id: "web-app".to_string(),
            version: "1.4.0".to_string(),
            pipeline_config: PipelineConfig {
                id: format!("pipeline-{}", deployment_id),
                source_spec_id: "spec-1".to_string(),
                branch_name: "main".to_string(),
                stages: vec![PipelineStage::new("deploy", "deploy")],
                target_environment: Environment::Production,
                created_at: chrono::Utc::now(),
            },
        }
    }

    #[tokio::test]
    async fn test_retention_task_drops_resolved_and_keeps_pending() {
        let requests: Arc<dyn RecordStore<DeploymentApprovalRequest>> =
            InMemoryRecordStore::new_arc();
        let gate = Arc::new(
            ApprovalGate::new(
                ApprovalPolicy::default(),
                requests.clone(),
                Arc::new(RecordLocks::new()),
                Arc::new(RecordingAuditSink::new()),
            )
            .with_settings(ApprovalSettings {
                resolved_retention_secs: 0,
            }),
        );
        let requester = Actor::from_provider("dana", "developer");
        let lead = Actor::from_provider("lee", "lead");

        let pending = gate
            .request_approval(&requester, new_request("dep-1"))
            .await
            .unwrap();
        let rejected = gate
            .request_approval(&requester, new_request("dep-2"))
            .await
            .unwrap();
        gate.reject(&rejected.id, &lead, None).await.unwrap();

        let sweeper = gate.spawn_retention_task(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        sweeper.abort();

        let remaining = requests.list(&RecordFilter::new()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, pending.id);
    }

    #[test]
    fn test_policy_table() {
        let policy = ApprovalPolicy::default();

        assert!(policy.requires_approval(Environment::Production, Role::Developer));
        assert!(policy.requires_approval(Environment::Production, Role::Lead));
        assert!(!policy.requires_approval(Environment::Production, Role::Admin));
        assert!(policy.requires_approval(Environment::Staging, Role::Developer));
        assert!(!policy.requires_approval(Environment::Staging, Role::Lead));
        assert!(!policy.requires_approval(Environment::Development, Role::Developer));

        assert!(policy.can_approve(Role::Lead, Environment::Production));
        assert!(!policy.can_approve(Role::Developer, Environment::Production));
        assert!(policy.can_approve(Role::Developer, Environment::Development));
        assert!(!policy.can_approve(Role::Viewer, Environment::Development));
        assert!(!policy.can_deploy(Role::Viewer));
    }

    #[test]
    fn test_policy_answers_are_stable() {
        let policy = ApprovalPolicy::default();
        for environment in Environment::ALL {
            for role in [Role::Admin, Role::Lead, Role::Developer, Role::Viewer] {
                let first = (
                    policy.requires_approval(environment, role),
                    policy.can_approve(role, environment),
                );
                for _ in 0..10 {
                    assert_eq!(
                        first,
                        (
                            policy.requires_approval(environment, role),
                            policy.can_approve(role, environment),
                        )
                    );
                }
            }
        }
    }
}
