//! Test utilities: deterministic executors, capturers and probes plus a
//! fully wired in-memory deployment stack

use async_trait::async_trait;
use rollout_core::{
    AuditRecord, AuditSink, BroadcastStatusChannel, Environment, HealthProbe, InMemoryRecordStore,
    MonitorSettings, PipelineSettings, PipelineStage, ProbeError, ProbeResult, RecordLocks,
    RecordStore, StageContext, StageError, StageExecutor, StageOutput,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::services::{
    ApprovalGate, ApprovalPolicy, CapturedState, Deployment, DeploymentApprovalRequest,
    DeploymentMonitor, DeploymentTrigger, PipelineConfigGenerator, PipelineRunner, Snapshot,
    SnapshotCapturer, SnapshotError, SnapshotService,
};

/// What a scripted stage does when executed
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Succeed(String),
    Fail(String),
    /// Never finishes; only the stage timeout ends it
    Hang,
}

/// Stage executor with a fixed outcome per stage name
///
/// Stages without a script succeed with empty output.
#[derive(Default)]
pub struct ScriptedStageExecutor {
    outcomes: HashMap<String, ScriptedOutcome>,
    executed: Mutex<Vec<String>>,
}

impl ScriptedStageExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outcome(mut self, stage: &str, outcome: ScriptedOutcome) -> Self {
        self.outcomes.insert(stage.to_string(), outcome);
        self
    }

    pub fn failing(self, stage: &str, error: &str) -> Self {
        self.with_outcome(stage, ScriptedOutcome::Fail(error.to_string()))
    }

    /// Stage names in execution order
    pub async fn executed(&self) -> Vec<String> {
        self.executed.lock().await.clone()
    }
}

#[async_trait]
impl StageExecutor for ScriptedStageExecutor {
    async fn execute(
        &self,
        stage: &PipelineStage,
        context: &StageContext,
    ) -> Result<StageOutput, StageError> {
        self.executed.lock().await.push(stage.name.clone());
        context.progress.tick(format!("Running {}", stage.name)).await;

        match self.outcomes.get(&stage.name) {
            None => Ok(StageOutput::default()),
            Some(ScriptedOutcome::Succeed(output)) => Ok(StageOutput::new(output.clone())),
            Some(ScriptedOutcome::Fail(error)) => Err(StageError::ExecutionFailed(error.clone())),
            Some(ScriptedOutcome::Hang) => {
                std::future::pending::<()>().await;
                Ok(StageOutput::default())
            }
        }
    }
}

/// Capturer returning a fixed revision; verification and capture can be made to fail
#[derive(Debug, Clone)]
pub struct StaticSnapshotCapturer {
    revision: String,
    fail_capture: bool,
    fail_verification: bool,
}

impl StaticSnapshotCapturer {
    pub fn new(revision: &str) -> Self {
        Self {
            revision: revision.to_string(),
            fail_capture: false,
            fail_verification: false,
        }
    }

    pub fn failing_capture(mut self) -> Self {
        self.fail_capture = true;
        self
    }

    pub fn failing_verification(mut self) -> Self {
        self.fail_verification = true;
        self
    }
}

#[async_trait]
impl SnapshotCapturer for StaticSnapshotCapturer {
    async fn capture(&self, _environment: Environment) -> Result<CapturedState, SnapshotError> {
        if self.fail_capture {
            return Err(SnapshotError::CaptureFailed(
                "repository not reachable".to_string(),
            ));
        }
        Ok(CapturedState {
            source_revision: self.revision.clone(),
            database_backup_handle: Some(format!("backup-{}", self.revision)),
            config_files: vec!["package.json".to_string(), ".env.production".to_string()],
        })
    }

    async fn verify(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        if self.fail_verification {
            return Err(SnapshotError::VerificationFailed {
                id: snapshot.id.clone(),
                reason: "config files changed".to_string(),
            });
        }
        Ok(())
    }
}

/// Probe with a fixed answer
#[derive(Debug, Clone)]
pub struct StaticHealthProbe {
    healthy: bool,
    status_code: u16,
}

impl StaticHealthProbe {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            status_code: 200,
        }
    }

    pub fn unhealthy(status_code: u16) -> Self {
        Self {
            healthy: false,
            status_code,
        }
    }
}

#[async_trait]
impl HealthProbe for StaticHealthProbe {
    async fn probe(&self, target: &str) -> Result<ProbeResult, ProbeError> {
        Ok(ProbeResult {
            target: target.to_string(),
            healthy: self.healthy,
            latency_ms: 12,
            status_code: Some(self.status_code),
            message: format!("HTTP {}", self.status_code),
        })
    }
}

/// Audit sink that keeps everything for assertions
#[derive(Default)]
pub struct RecordingAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().await.clone()
    }

    pub async fn actions(&self) -> Vec<String> {
        self.records
            .lock()
            .await
            .iter()
            .map(|r| r.action_type.clone())
            .collect()
    }
}

#[async_trait]
impl AuditSink for RecordingAuditSink {
    async fn record(&self, record: AuditRecord) -> anyhow::Result<()> {
        self.records.lock().await.push(record);
        Ok(())
    }
}

/// The deployment services wired together over in-memory stores
pub struct DeploymentHarness {
    pub deployments: Arc<dyn RecordStore<Deployment>>,
    pub approvals: Arc<dyn RecordStore<DeploymentApprovalRequest>>,
    pub snapshots: Arc<SnapshotService>,
    pub locks: Arc<RecordLocks>,
    pub audit: Arc<RecordingAuditSink>,
    pub executor: Arc<ScriptedStageExecutor>,
    pub monitor: Arc<DeploymentMonitor>,
    pub runner: Arc<PipelineRunner>,
    pub gate: Arc<ApprovalGate>,
    pub trigger: Arc<DeploymentTrigger>,
}

impl DeploymentHarness {
    pub fn new(executor: ScriptedStageExecutor) -> Self {
        Self::with_capturer(executor, StaticSnapshotCapturer::new("4f2a9c1"))
    }

    pub fn with_capturer(executor: ScriptedStageExecutor, capturer: StaticSnapshotCapturer) -> Self {
        let deployments: Arc<dyn RecordStore<Deployment>> = InMemoryRecordStore::new_arc();
        let approvals: Arc<dyn RecordStore<DeploymentApprovalRequest>> =
            InMemoryRecordStore::new_arc();
        let locks = Arc::new(RecordLocks::new());
        let audit = Arc::new(RecordingAuditSink::new());
        let executor = Arc::new(executor);

        let snapshots = Arc::new(SnapshotService::new(
            InMemoryRecordStore::new_arc(),
            Arc::new(capturer),
            locks.clone(),
        ));
        let monitor = Arc::new(DeploymentMonitor::new(
            Arc::new(BroadcastStatusChannel::new(256)),
            MonitorSettings::default(),
        ));
        let runner = Arc::new(
            PipelineRunner::new(
                deployments.clone(),
                snapshots.clone(),
                executor.clone(),
                audit.clone(),
                locks.clone(),
            )
            .with_observer(monitor.clone()),
        );
        let gate = Arc::new(ApprovalGate::new(
            ApprovalPolicy::default(),
            approvals.clone(),
            locks.clone(),
            audit.clone(),
        ));
        let generator = Arc::new(
            PipelineConfigGenerator::new(PipelineSettings::default())
                .unwrap_or_else(|e| panic!("default pipeline settings are valid: {}", e)),
        );
        let trigger = Arc::new(DeploymentTrigger::new(
            gate.clone(),
            generator,
            runner.clone(),
            monitor.clone(),
            audit.clone(),
        ));

        Self {
            deployments,
            approvals,
            snapshots,
            locks,
            audit,
            executor,
            monitor,
            runner,
            gate,
            trigger,
        }
    }
}

/// Stage with a short timeout, for tests that hang a stage on purpose
pub fn quick_stage(name: &str, timeout: Duration) -> PipelineStage {
    PipelineStage::new(name, name).with_timeout(timeout)
}
