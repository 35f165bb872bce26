//! Rollback lifecycle over the in-memory deployment stack

use async_trait::async_trait;
use chrono::{Duration, Utc};
use mockall::mock;
use rollout_core::{
    Actor, Environment, PipelineConfig, PipelineStage, RecordFilter, RecordStore, Role,
    RollbackSettings, StatusBroadcaster,
};
use rollout_deployments::{DeploymentStatus, ExecutionRequest};
use rollout_rollback::test_utils::{
    InterceptingRequestStore, RollbackHarness, ScriptedRollbackExecutor, StaticIntegrityChecker,
};
use rollout_rollback::{
    ErrorCategory, InitiateRollback, IntegrityCheckItem, Narrator, RollbackError, RollbackSource,
    RollbackStatus, SecurityAlert, Severity,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

mock! {
    Narrator {}

    #[async_trait]
    impl Narrator for Narrator {
        async fn narrate(&self, prompt: &str) -> anyhow::Result<String>;
    }
}

fn developer() -> Actor {
    Actor::from_provider("dana", "developer")
}

fn lead() -> Actor {
    Actor::from_provider("lee", "lead")
}

fn rollback_to(snapshot_id: &str) -> InitiateRollback {
    InitiateRollback {
        environment: Environment::Production,
        snapshot_id: snapshot_id.to_string(),
        reason: "checkout errors after release".to_string(),
        deployment_id: None,
    }
}

fn pipeline() -> PipelineConfig {
    PipelineConfig {
        id: "pipeline-prod".to_string(),
        source_spec_id: "spec-1".to_string(),
        branch_name: "main".to_string(),
        stages: vec![PipelineStage::new("deploy", "deploy")],
        target_environment: Environment::Production,
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_unverified_snapshot_is_rejected_without_a_request() {
    let harness = RollbackHarness::new(
        ScriptedRollbackExecutor::succeeding(),
        StaticIntegrityChecker::passing(),
    );
    let snapshot = harness
        .deployments
        .snapshots
        .capture(Environment::Production)
        .await
        .unwrap();
    assert!(!snapshot.verified);

    let err = harness
        .controller
        .initiate(rollback_to(&snapshot.id), &developer())
        .await
        .unwrap_err();

    assert!(matches!(err, RollbackError::UnverifiedSnapshot(ref id) if *id == snapshot.id));
    assert!(harness.requests.list(&RecordFilter::new()).await.unwrap().is_empty());
    assert_eq!(harness.executor.calls(), 0);
}

#[tokio::test]
async fn test_initiate_validates_target() {
    let harness = RollbackHarness::new(
        ScriptedRollbackExecutor::succeeding(),
        StaticIntegrityChecker::passing(),
    );
    let staging = harness.verified_snapshot(Environment::Staging).await;

    let err = harness
        .controller
        .initiate(rollback_to("missing"), &developer())
        .await
        .unwrap_err();
    assert!(matches!(err, RollbackError::SnapshotNotFound(_)));

    let err = harness
        .controller
        .initiate(rollback_to(&staging.id), &developer())
        .await
        .unwrap_err();
    assert!(matches!(err, RollbackError::EnvironmentMismatch { .. }));

    let err = harness
        .controller
        .initiate(rollback_to(&staging.id), &Actor::new("vic", Role::Viewer))
        .await
        .unwrap_err();
    assert!(matches!(err, RollbackError::PermissionDenied { .. }));

    assert!(harness.requests.list(&RecordFilter::new()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_request_waits_for_approval_before_execution() {
    let harness = RollbackHarness::new(
        ScriptedRollbackExecutor::succeeding(),
        StaticIntegrityChecker::passing(),
    );
    let snapshot = harness.verified_snapshot(Environment::Production).await;

    let request = harness
        .controller
        .initiate(rollback_to(&snapshot.id), &developer())
        .await
        .unwrap();
    assert_eq!(request.status, RollbackStatus::PendingApproval);
    assert_eq!(request.source, RollbackSource::Manual);

    let err = harness
        .controller
        .execute(&request.id, &lead())
        .await
        .unwrap_err();
    assert!(matches!(err, RollbackError::InvalidTransition { .. }));
    assert_eq!(harness.executor.calls(), 0);

    // Developers can ask but not approve
    let err = harness
        .controller
        .approve(&request.id, &developer(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RollbackError::PermissionDenied { .. }));

    let pending = harness.controller.pending_for(&lead()).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert!(harness.controller.pending_for(&developer()).await.unwrap().is_empty());

    let decision = harness
        .controller
        .approve(&request.id, &lead(), Some("confirmed with on-call".to_string()))
        .await
        .unwrap();
    assert!(decision.newly_resolved);
    assert_eq!(decision.request.status, RollbackStatus::Approved);
    assert_eq!(decision.request.approved_by.as_deref(), Some("lee"));

    let again = harness
        .controller
        .approve(&request.id, &lead(), None)
        .await
        .unwrap();
    assert!(!again.newly_resolved);

    let err = harness
        .controller
        .reject(&request.id, &lead(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RollbackError::AlreadyResolved { .. }));
}

#[tokio::test]
async fn test_initiator_can_approve_own_request() {
    let harness = RollbackHarness::new(
        ScriptedRollbackExecutor::succeeding(),
        StaticIntegrityChecker::passing(),
    );
    let snapshot = harness.verified_snapshot(Environment::Production).await;
    let request = harness
        .controller
        .initiate(rollback_to(&snapshot.id), &lead())
        .await
        .unwrap();

    let decision = harness
        .controller
        .approve(&request.id, &lead(), None)
        .await
        .unwrap();
    assert_eq!(decision.request.status, RollbackStatus::Approved);
}

#[tokio::test]
async fn test_successful_rollback_records_history() {
    let harness = RollbackHarness::new(
        ScriptedRollbackExecutor::succeeding(),
        StaticIntegrityChecker::passing(),
    );
    let deployed = harness
        .deployments
        .runner
        .execute(ExecutionRequest::new(pipeline(), "2.0.0", "dana"))
        .await
        .unwrap();
    assert!(deployed.success);
    assert!(deployed.rollback_available);
    let snapshot_id = deployed.snapshot_id.clone().unwrap();

    let mut updates = harness.channel.subscribe();
    let request = harness
        .controller
        .initiate(rollback_to(&snapshot_id), &developer())
        .await
        .unwrap();
    harness
        .controller
        .approve(&request.id, &lead(), None)
        .await
        .unwrap();

    let result = harness.controller.execute(&request.id, &lead()).await.unwrap();

    assert!(result.success);
    assert!(!result.summary.is_empty());
    assert!(result.integrity.as_ref().unwrap().passed);
    assert!(result.recovery_options.is_empty());
    assert_eq!(harness.executor.calls(), 1);

    let stored = harness.controller.get(&request.id).await.unwrap();
    assert_eq!(stored.status, RollbackStatus::Completed);
    assert!(stored.completed_at.is_some());
    let statuses: Vec<RollbackStatus> = stored.transitions.iter().map(|t| t.status).collect();
    assert_eq!(
        statuses,
        vec![
            RollbackStatus::Requested,
            RollbackStatus::PendingApproval,
            RollbackStatus::Approved,
            RollbackStatus::Executing,
            RollbackStatus::Completed,
        ]
    );

    // The history gains a rolled_back entry; the replaced deployment is kept
    let new_id = result.new_deployment_id.unwrap();
    let rolled_back = harness
        .deployments
        .runner
        .get_deployment(&new_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rolled_back.status, DeploymentStatus::RolledBack);
    assert_eq!(rolled_back.rolled_back_from.as_deref(), Some(deployed.deployment_id.as_str()));

    let original = harness
        .deployments
        .runner
        .get_deployment(&deployed.deployment_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(original.status, DeploymentStatus::Success);
    assert!(!original.rollback_available);

    let actions = harness.deployments.audit.actions().await;
    for action in ["ROLLBACK_REQUESTED", "ROLLBACK_APPROVED", "ROLLBACK_COMPLETED"] {
        assert!(actions.contains(&action.to_string()), "missing {}", action);
    }

    let mut seen = Vec::new();
    while let Ok(update) = updates.try_recv() {
        seen.push(update.status);
    }
    assert_eq!(seen.last().map(String::as_str), Some("rollback_completed"));
}

#[tokio::test]
async fn test_failed_rollback_is_analyzed() {
    let harness = RollbackHarness::new(
        ScriptedRollbackExecutor::failing("Connection to db timed out"),
        StaticIntegrityChecker::passing(),
    );
    let snapshot = harness.verified_snapshot(Environment::Production).await;
    let request = harness
        .controller
        .initiate(rollback_to(&snapshot.id), &developer())
        .await
        .unwrap();
    harness
        .controller
        .approve(&request.id, &lead(), None)
        .await
        .unwrap();

    let result = harness.controller.execute(&request.id, &lead()).await.unwrap();

    assert!(!result.success);
    let analysis = result.error_analysis.as_ref().unwrap();
    assert_eq!(analysis.category, ErrorCategory::Database);
    assert_eq!(analysis.severity, Severity::High);
    assert_eq!(
        result.recovery_options[0].title,
        "Manual database restoration from verified backup"
    );
    assert!(result.summary.contains("Manual database restoration"));
    assert!(result.new_deployment_id.is_none());

    let stored = harness.controller.get(&request.id).await.unwrap();
    assert_eq!(stored.status, RollbackStatus::Failed);
    assert!(stored.result.is_some());
    assert!(harness
        .deployments
        .audit
        .actions()
        .await
        .contains(&"ROLLBACK_FAILED".to_string()));

    // Failed requests are terminal; nothing is retried
    let err = harness
        .controller
        .execute(&request.id, &lead())
        .await
        .unwrap_err();
    assert!(matches!(err, RollbackError::InvalidTransition { .. }));
    assert_eq!(harness.executor.calls(), 1);
}

#[tokio::test]
async fn test_integrity_failure_fails_rollback() {
    let harness = RollbackHarness::new(
        ScriptedRollbackExecutor::succeeding(),
        StaticIntegrityChecker::failing(
            IntegrityCheckItem::ApiEndpoints,
            "connection refused on /health",
        ),
    );
    let snapshot = harness.verified_snapshot(Environment::Production).await;
    let request = harness
        .controller
        .initiate(rollback_to(&snapshot.id), &developer())
        .await
        .unwrap();
    harness
        .controller
        .approve(&request.id, &lead(), None)
        .await
        .unwrap();

    let result = harness.controller.execute(&request.id, &lead()).await.unwrap();

    assert!(!result.success);
    let integrity = result.integrity.unwrap();
    assert!(!integrity.passed);
    assert_eq!(integrity.failures()[0].item, IntegrityCheckItem::ApiEndpoints);
    assert_eq!(result.error_analysis.unwrap().category, ErrorCategory::Network);
}

#[tokio::test]
async fn test_candidates_are_verified_and_newest_first() {
    let harness = RollbackHarness::new(
        ScriptedRollbackExecutor::succeeding(),
        StaticIntegrityChecker::passing(),
    );
    let older = harness.verified_snapshot(Environment::Production).await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let newer = harness.verified_snapshot(Environment::Production).await;
    harness
        .deployments
        .snapshots
        .capture(Environment::Production)
        .await
        .unwrap();

    let candidates = harness
        .controller
        .list_candidates(Environment::Production)
        .await
        .unwrap();

    let ids: Vec<&str> = candidates.iter().map(|c| c.snapshot.id.as_str()).collect();
    assert_eq!(ids, vec![newer.id.as_str(), older.id.as_str()]);
    assert_eq!(candidates[0].age_description, "just now");
    assert!(candidates[0].reasoning.contains("4f2a9c1"));

    // A listed candidate is always accepted as a target
    let request = harness
        .controller
        .initiate(rollback_to(&candidates[1].snapshot.id), &developer())
        .await
        .unwrap();
    assert_eq!(request.snapshot_id, older.id);
}

#[tokio::test]
async fn test_candidate_reasoning_uses_narrator_with_fallback() {
    let calls = AtomicUsize::new(0);
    let mut narrator = MockNarrator::new();
    narrator.expect_narrate().returning(move |_| {
        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok("Last known good release before the checkout change.".to_string())
        } else {
            Err(anyhow::anyhow!("model unavailable"))
        }
    });

    let harness = RollbackHarness::new(
        ScriptedRollbackExecutor::succeeding(),
        StaticIntegrityChecker::passing(),
    );
    harness.verified_snapshot(Environment::Production).await;
    let controller = harness.controller.with_narrator(Arc::new(narrator));

    let first = controller.list_candidates(Environment::Production).await.unwrap();
    assert_eq!(
        first[0].reasoning,
        "Last known good release before the checkout change."
    );

    let second = controller.list_candidates(Environment::Production).await.unwrap();
    assert!(second[0].reasoning.starts_with("Verified snapshot of production"));
}

#[tokio::test]
async fn test_security_alert_opens_pending_request_once() {
    let harness = RollbackHarness::new(
        ScriptedRollbackExecutor::succeeding(),
        StaticIntegrityChecker::passing(),
    );
    let snapshot = harness.verified_snapshot(Environment::Production).await;
    let alert = SecurityAlert {
        id: "alert-7".to_string(),
        environment: Environment::Production,
        severity: Severity::Critical,
        title: "Suspicious outbound traffic".to_string(),
        description: "Unexpected connections to an unknown host".to_string(),
        detected_at: Utc::now(),
    };

    let request = harness
        .controller
        .handle_security_alert(&alert)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.status, RollbackStatus::PendingApproval);
    assert_eq!(request.snapshot_id, snapshot.id);
    assert_eq!(
        request.source,
        RollbackSource::SecurityAlert {
            alert_id: "alert-7".to_string()
        }
    );
    // Never executed without a human
    assert_eq!(harness.executor.calls(), 0);

    let duplicate = harness.controller.handle_security_alert(&alert).await.unwrap();
    assert!(duplicate.is_none());

    let low = SecurityAlert {
        id: "alert-8".to_string(),
        severity: Severity::Low,
        ..alert.clone()
    };
    assert!(harness.controller.handle_security_alert(&low).await.unwrap().is_none());
}

#[tokio::test]
async fn test_security_alert_without_target() {
    let harness = RollbackHarness::new(
        ScriptedRollbackExecutor::succeeding(),
        StaticIntegrityChecker::passing(),
    );
    let alert = SecurityAlert {
        id: "alert-9".to_string(),
        environment: Environment::Staging,
        severity: Severity::High,
        title: "Leaked credential".to_string(),
        description: String::new(),
        detected_at: Utc::now(),
    };

    let err = harness
        .controller
        .handle_security_alert(&alert)
        .await
        .unwrap_err();
    assert!(matches!(err, RollbackError::NoRollbackTarget(Environment::Staging)));
}

#[tokio::test]
async fn test_prune_keeps_open_targets_and_purge_drops_finished() {
    let settings = RollbackSettings {
        snapshots_per_environment: 1,
        ..RollbackSettings::default()
    };
    let harness = RollbackHarness::with_settings(
        ScriptedRollbackExecutor::succeeding(),
        StaticIntegrityChecker::passing(),
        settings,
    );
    let target = harness.verified_snapshot(Environment::Production).await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let unused = harness.verified_snapshot(Environment::Production).await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    harness.verified_snapshot(Environment::Production).await;

    let request = harness
        .controller
        .initiate(rollback_to(&target.id), &developer())
        .await
        .unwrap();

    let removed = harness
        .controller
        .prune_snapshots(Environment::Production)
        .await
        .unwrap();
    assert_eq!(removed, vec![unused.id.clone()]);
    assert!(harness.deployments.snapshots.get(&target.id).await.unwrap().is_some());

    harness
        .controller
        .reject(&request.id, &lead(), Some("not needed".to_string()))
        .await
        .unwrap();
    // Retention has not passed yet
    assert_eq!(harness.controller.purge_terminal().await.unwrap(), 0);
    let purged = harness
        .controller
        .purge_terminal_before(Utc::now() + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(purged, 1);
    assert!(matches!(
        harness.controller.get(&request.id).await.unwrap_err(),
        RollbackError::RequestNotFound(_)
    ));
}

#[tokio::test]
async fn test_prune_waits_for_request_being_opened() {
    let settings = RollbackSettings {
        snapshots_per_environment: 1,
        ..RollbackSettings::default()
    };
    let store = Arc::new(InterceptingRequestStore::new());
    let harness = RollbackHarness::with_request_store(
        ScriptedRollbackExecutor::succeeding(),
        StaticIntegrityChecker::passing(),
        settings,
        store.clone(),
    );
    let older = harness.verified_snapshot(Environment::Production).await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let newer = harness.verified_snapshot(Environment::Production).await;

    // Pruning reads the open requests (none yet) and stalls before deleting
    store.hold_next_list();
    let (pruned, initiated) = tokio::join!(
        harness.controller.prune_snapshots(Environment::Production),
        async {
            store.list_entered().await;
            let release = async {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                store.release_list();
            };
            let actor = developer();
            let (initiated, _) = tokio::join!(
                harness
                    .controller
                    .initiate(rollback_to(&older.id), &actor),
                release
            );
            initiated
        }
    );

    assert_eq!(pruned.unwrap(), vec![older.id.clone()]);
    assert!(matches!(initiated, Err(RollbackError::SnapshotNotFound(ref id)) if *id == older.id));
    assert!(harness.requests.list(&RecordFilter::new()).await.unwrap().is_empty());
    assert!(harness.deployments.snapshots.get(&newer.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_unrecorded_outcome_marks_request_failed() {
    let store = Arc::new(InterceptingRequestStore::new());
    let harness = RollbackHarness::with_request_store(
        ScriptedRollbackExecutor::succeeding(),
        StaticIntegrityChecker::passing(),
        RollbackSettings::default(),
        store.clone(),
    );
    let snapshot = harness.verified_snapshot(Environment::Production).await;
    let request = harness
        .controller
        .initiate(rollback_to(&snapshot.id), &developer())
        .await
        .unwrap();
    harness
        .controller
        .approve(&request.id, &lead(), None)
        .await
        .unwrap();

    // First update claims the request, second records the outcome
    store.fail_update_in(2);
    let err = harness
        .controller
        .execute(&request.id, &lead())
        .await
        .unwrap_err();
    assert!(matches!(err, RollbackError::Store(_)));

    let stored = harness.controller.get(&request.id).await.unwrap();
    assert_eq!(stored.status, RollbackStatus::Failed);
    assert!(stored.completed_at.is_some());
    assert!(stored.result.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stage_updates_and_rollback_history_do_not_overwrite_each_other() {
    let harness = RollbackHarness::new(
        ScriptedRollbackExecutor::succeeding(),
        StaticIntegrityChecker::passing(),
    );
    let deployed = harness
        .deployments
        .runner
        .execute(ExecutionRequest::new(pipeline(), "2.1.0", "dana"))
        .await
        .unwrap();
    let snapshot_id = deployed.snapshot_id.clone().unwrap();
    let request = harness
        .controller
        .initiate(
            InitiateRollback {
                deployment_id: Some(deployed.deployment_id.clone()),
                ..rollback_to(&snapshot_id)
            },
            &developer(),
        )
        .await
        .unwrap();
    harness
        .controller
        .approve(&request.id, &lead(), None)
        .await
        .unwrap();

    let writers: Vec<_> = (0..25)
        .map(|i| {
            let runner = harness.deployments.runner.clone();
            let id = deployed.deployment_id.clone();
            tokio::spawn(async move {
                runner
                    .update_deployment(&id, |d| d.logs.push(format!("stage note {}", i)))
                    .await
            })
        })
        .collect();
    let result = harness.controller.execute(&request.id, &lead()).await.unwrap();
    for writer in writers {
        writer.await.unwrap().unwrap();
    }
    assert!(result.success);

    let stored = harness
        .deployments
        .runner
        .get_deployment(&deployed.deployment_id)
        .await
        .unwrap()
        .unwrap();
    assert!(!stored.rollback_available);
    for i in 0..25 {
        let note = format!("stage note {}", i);
        assert!(stored.logs.contains(&note), "lost {}", note);
    }
    assert!(stored
        .logs
        .iter()
        .any(|line| line.starts_with("Replaced by rollback deployment")));
}

#[tokio::test]
async fn test_retention_task_purges_finished_requests() {
    let settings = RollbackSettings {
        terminal_retention_secs: 0,
        ..RollbackSettings::default()
    };
    let harness = RollbackHarness::with_settings(
        ScriptedRollbackExecutor::succeeding(),
        StaticIntegrityChecker::passing(),
        settings,
    );
    let snapshot = harness.verified_snapshot(Environment::Production).await;
    let open = harness
        .controller
        .initiate(rollback_to(&snapshot.id), &developer())
        .await
        .unwrap();
    let rejected = harness
        .controller
        .initiate(rollback_to(&snapshot.id), &developer())
        .await
        .unwrap();
    harness
        .controller
        .reject(&rejected.id, &lead(), None)
        .await
        .unwrap();

    let requests = harness.requests.clone();
    let controller = Arc::new(harness.controller);
    let sweeper = controller.spawn_retention_task(std::time::Duration::from_millis(10));
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    sweeper.abort();

    let remaining = requests.list(&RecordFilter::new()).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, open.id);
}
