use rollout_core::{Actor, Environment, RecordFilter, RecordStore, Role};
use rollout_deployments::test_utils::{DeploymentHarness, ScriptedStageExecutor};
use rollout_deployments::{
    ApprovalError, ApprovalStatus, ChangeSpecification, DeploymentStatus,
    DeploymentTriggerRequest, TriggerError, TriggerOutcome,
};

fn request(environment: Environment) -> DeploymentTriggerRequest {
    DeploymentTriggerRequest {
        project_id: "web-app".to_string(),
        change: ChangeSpecification::new("Add CSV export to reports", "feature/csv-export"),
        environment: Some(environment),
        version: "3.1.0".to_string(),
    }
}

fn developer() -> Actor {
    Actor::from_provider("dana", "developer-tier")
}

fn lead() -> Actor {
    Actor::from_provider("lee", "lead-tier")
}

#[tokio::test]
async fn test_developer_production_deploy_waits_for_approval() {
    let harness = DeploymentHarness::new(ScriptedStageExecutor::new());
    let actor = developer();
    assert!(harness.gate.requires_approval(Environment::Production, actor.role));

    let mut updates = harness.monitor.subscribe();
    let outcome = harness
        .trigger
        .trigger(request(Environment::Production), &actor)
        .await
        .unwrap();

    assert_eq!(outcome.status(), "pending_approval");
    let approval = match outcome {
        TriggerOutcome::PendingApproval(approval) => approval,
        other => panic!("expected pending approval, got {:?}", other),
    };
    assert_eq!(approval.status, ApprovalStatus::Pending);
    assert_eq!(approval.requested_by, "dana");

    let stored = harness.approvals.list(&RecordFilter::new()).await.unwrap();
    assert_eq!(stored.len(), 1);
    // Nothing ran and no deployment record exists yet
    assert!(harness.executor.executed().await.is_empty());
    assert!(harness
        .deployments
        .get(&approval.deployment_id)
        .await
        .unwrap()
        .is_none());

    let update = updates.recv().await.unwrap();
    assert_eq!(update.status, "pending_approval");
    assert_eq!(update.deployment_id, approval.deployment_id);
}

#[tokio::test]
async fn test_approval_runs_the_deployment_immediately() {
    let harness = DeploymentHarness::new(ScriptedStageExecutor::new());
    let outcome = harness
        .trigger
        .trigger(request(Environment::Production), &developer())
        .await
        .unwrap();
    let TriggerOutcome::PendingApproval(approval) = outcome else {
        panic!("expected pending approval");
    };

    let outcome = harness
        .trigger
        .approve(&approval.id, &lead(), Some("ship it".to_string()))
        .await
        .unwrap();
    let TriggerOutcome::Executed(result) = outcome else {
        panic!("expected execution");
    };
    assert!(result.success);
    assert_eq!(result.deployment_id, approval.deployment_id);

    let deployment = harness
        .deployments
        .get(&approval.deployment_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Success);
    assert_eq!(deployment.deployed_by, "dana");
    assert_eq!(deployment.environment, Environment::Production);

    // Approving twice is a no-op
    let again = harness
        .trigger
        .approve(&approval.id, &lead(), None)
        .await
        .unwrap();
    assert!(matches!(again, TriggerOutcome::AlreadyApproved(_)));
    assert_eq!(
        harness.executor.executed().await,
        vec!["build", "test", "package", "deploy"]
    );
}

#[tokio::test]
async fn test_reject_leaves_only_audit_trail() {
    let harness = DeploymentHarness::new(ScriptedStageExecutor::new());
    let TriggerOutcome::PendingApproval(approval) = harness
        .trigger
        .trigger(request(Environment::Production), &developer())
        .await
        .unwrap()
    else {
        panic!("expected pending approval");
    };

    let rejected = harness
        .trigger
        .reject(&approval.id, &lead(), Some("freeze window".to_string()))
        .await
        .unwrap();
    assert_eq!(rejected.status, ApprovalStatus::Rejected);
    assert_eq!(rejected.approval_notes.as_deref(), Some("freeze window"));

    // Idempotent on the same request id
    let again = harness.trigger.reject(&approval.id, &lead(), None).await.unwrap();
    assert_eq!(again.status, ApprovalStatus::Rejected);

    // Approving after rejection is a conflict
    let err = harness
        .trigger
        .approve(&approval.id, &lead(), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TriggerError::Approval(ApprovalError::AlreadyResolved { .. })
    ));

    assert!(harness.executor.executed().await.is_empty());
    assert!(harness
        .deployments
        .get(&approval.deployment_id)
        .await
        .unwrap()
        .is_none());
    let actions = harness.audit.actions().await;
    assert!(actions.contains(&"DEPLOYMENT_REJECTED".to_string()));
}

#[tokio::test]
async fn test_authorization_is_checked_before_side_effects() {
    let harness = DeploymentHarness::new(ScriptedStageExecutor::new());

    let viewer = Actor::from_provider("vic", "viewer-tier");
    let err = harness
        .trigger
        .trigger(request(Environment::Development), &viewer)
        .await
        .unwrap_err();
    assert!(matches!(err, TriggerError::PermissionDenied { .. }));
    assert!(harness.audit.records().await.is_empty());

    let TriggerOutcome::PendingApproval(approval) = harness
        .trigger
        .trigger(request(Environment::Production), &developer())
        .await
        .unwrap()
    else {
        panic!("expected pending approval");
    };

    // Developers cannot approve production
    let other_dev = Actor::new("devon", Role::Developer);
    let err = harness
        .trigger
        .approve(&approval.id, &other_dev, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TriggerError::Approval(ApprovalError::PermissionDenied { .. })
    ));

    // A lead cannot approve a request they made
    let lead = lead();
    let own_outcome = harness
        .trigger
        .trigger(request(Environment::Production), &lead)
        .await
        .unwrap();
    let TriggerOutcome::PendingApproval(own) = own_outcome else {
        panic!("leads need approval for production");
    };
    let err = harness.trigger.approve(&own.id, &lead, None).await.unwrap_err();
    assert!(matches!(
        err,
        TriggerError::Approval(ApprovalError::SelfApproval { .. })
    ));

    let still_pending = harness.gate.get(&approval.id).await.unwrap();
    assert_eq!(still_pending.status, ApprovalStatus::Pending);
    assert!(harness.executor.executed().await.is_empty());
}

#[tokio::test]
async fn test_pending_list_is_role_scoped() {
    let harness = DeploymentHarness::new(ScriptedStageExecutor::new());
    let dev = developer();
    harness
        .trigger
        .trigger(request(Environment::Production), &dev)
        .await
        .unwrap();
    harness
        .trigger
        .trigger(request(Environment::Staging), &dev)
        .await
        .unwrap();

    let admin = Actor::new("ada", Role::Admin);
    assert_eq!(harness.gate.pending_for(&admin).await.unwrap().len(), 2);

    let another_dev = Actor::new("devon", Role::Developer);
    assert!(harness.gate.pending_for(&another_dev).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_exempt_role_deploys_without_approval() {
    let harness = DeploymentHarness::new(ScriptedStageExecutor::new());
    let outcome = harness
        .trigger
        .trigger(request(Environment::Staging), &lead())
        .await
        .unwrap();

    assert_eq!(outcome.status(), "succeeded");
    assert!(harness
        .approvals
        .list(&RecordFilter::new())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_invalid_specification_is_surfaced() {
    let harness = DeploymentHarness::new(ScriptedStageExecutor::new());
    let mut bad = request(Environment::Development);
    bad.change.description = String::new();

    let err = harness.trigger.trigger(bad, &developer()).await.unwrap_err();
    assert!(err.to_string().contains("Invalid specification"));
}
