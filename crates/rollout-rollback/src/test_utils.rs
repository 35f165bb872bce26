//! Test utilities for the rollback controller

use async_trait::async_trait;
use rollout_core::{
    BroadcastStatusChannel, Environment, InMemoryRecordStore, RecordFilter, RecordStore,
    RollbackSettings, StoreError,
};
use rollout_deployments::test_utils::{DeploymentHarness, ScriptedStageExecutor};
use rollout_deployments::Snapshot;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::services::{
    IntegrityCheckItem, IntegrityChecker, IntegrityItemResult, RollbackController,
    RollbackExecutor, RollbackRequest,
};

/// Integrity checker that fails a fixed set of items
#[derive(Default)]
pub struct StaticIntegrityChecker {
    failing: Vec<(IntegrityCheckItem, String)>,
}

impl StaticIntegrityChecker {
    pub fn passing() -> Self {
        Self::default()
    }

    pub fn failing(item: IntegrityCheckItem, message: &str) -> Self {
        Self {
            failing: vec![(item, message.to_string())],
        }
    }
}

#[async_trait]
impl IntegrityChecker for StaticIntegrityChecker {
    async fn check_item(
        &self,
        item: IntegrityCheckItem,
        _environment: Environment,
        _snapshot: &Snapshot,
    ) -> IntegrityItemResult {
        match self.failing.iter().find(|(failing, _)| *failing == item) {
            Some((_, message)) => IntegrityItemResult::fail(item, message.clone()),
            None => IntegrityItemResult::pass(item, "ok"),
        }
    }
}

/// Executor that succeeds or fails with a fixed message and counts calls
#[derive(Default)]
pub struct ScriptedRollbackExecutor {
    error: Option<String>,
    calls: AtomicUsize,
}

impl ScriptedRollbackExecutor {
    pub fn succeeding() -> Self {
        Self::default()
    }

    pub fn failing(error: &str) -> Self {
        Self {
            error: Some(error.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RollbackExecutor for ScriptedRollbackExecutor {
    async fn restore(&self, snapshot: &Snapshot, environment: Environment) -> Result<String, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.error {
            Some(ref error) => Err(error.clone()),
            None => Ok(format!(
                "restored {} to revision {}",
                environment, snapshot.source_revision
            )),
        }
    }
}

/// In-memory request store that can hold a listing or fail an update
///
/// A held `list` reads the records first and then waits for
/// [`release_list`](Self::release_list), so the caller acts on a stale view.
#[derive(Default)]
pub struct InterceptingRequestStore {
    inner: InMemoryRecordStore<RollbackRequest>,
    hold_list: AtomicBool,
    list_entered: Notify,
    list_released: Notify,
    updates: AtomicUsize,
    fail_update: AtomicUsize,
}

impl InterceptingRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold the next `list` call after it has read the records
    pub fn hold_next_list(&self) {
        self.hold_list.store(true, Ordering::SeqCst);
    }

    /// Wait until a held `list` call has read the records
    pub async fn list_entered(&self) {
        self.list_entered.notified().await;
    }

    pub fn release_list(&self) {
        self.list_released.notify_one();
    }

    /// Fail the `n`th `update` call from now on, counting from 1
    pub fn fail_update_in(&self, n: usize) {
        let done = self.updates.load(Ordering::SeqCst);
        self.fail_update.store(done + n, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecordStore<RollbackRequest> for InterceptingRequestStore {
    async fn create(&self, record: RollbackRequest) -> Result<RollbackRequest, StoreError> {
        self.inner.create(record).await
    }

    async fn get(&self, id: &str) -> Result<Option<RollbackRequest>, StoreError> {
        self.inner.get(id).await
    }

    async fn update(&self, record: RollbackRequest) -> Result<RollbackRequest, StoreError> {
        let call = self.updates.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_update.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("write rejected".to_string()));
        }
        self.inner.update(record).await
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        self.inner.delete(id).await
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<RollbackRequest>, StoreError> {
        let records = self.inner.list(filter).await?;
        if self.hold_list.swap(false, Ordering::SeqCst) {
            self.list_entered.notify_one();
            self.list_released.notified().await;
        }
        Ok(records)
    }
}

/// Deployment stack plus a rollback controller over the same stores
pub struct RollbackHarness {
    pub deployments: DeploymentHarness,
    pub requests: Arc<dyn RecordStore<RollbackRequest>>,
    pub executor: Arc<ScriptedRollbackExecutor>,
    pub channel: Arc<BroadcastStatusChannel>,
    pub controller: RollbackController,
}

impl RollbackHarness {
    pub fn new(executor: ScriptedRollbackExecutor, checker: StaticIntegrityChecker) -> Self {
        Self::with_settings(executor, checker, RollbackSettings::default())
    }

    pub fn with_settings(
        executor: ScriptedRollbackExecutor,
        checker: StaticIntegrityChecker,
        settings: RollbackSettings,
    ) -> Self {
        Self::with_request_store(executor, checker, settings, InMemoryRecordStore::new_arc())
    }

    pub fn with_request_store(
        executor: ScriptedRollbackExecutor,
        checker: StaticIntegrityChecker,
        settings: RollbackSettings,
        requests: Arc<dyn RecordStore<RollbackRequest>>,
    ) -> Self {
        let deployments = DeploymentHarness::new(ScriptedStageExecutor::new());
        let executor = Arc::new(executor);
        let channel = Arc::new(BroadcastStatusChannel::new(64));

        let controller = RollbackController::new(
            requests.clone(),
            deployments.snapshots.clone(),
            deployments.runner.clone(),
            executor.clone(),
            Arc::new(checker),
            deployments.audit.clone(),
            deployments.locks.clone(),
        )
        .with_broadcaster(channel.clone())
        .with_settings(settings);

        Self {
            deployments,
            requests,
            executor,
            channel,
            controller,
        }
    }

    /// Capture and verify a snapshot of `environment`
    pub async fn verified_snapshot(&self, environment: Environment) -> Snapshot {
        let snapshot = self
            .deployments
            .snapshots
            .capture(environment)
            .await
            .unwrap_or_else(|e| panic!("capture failed: {}", e));
        self.deployments
            .snapshots
            .verify(&snapshot.id)
            .await
            .unwrap_or_else(|e| panic!("verify failed: {}", e))
    }
}
