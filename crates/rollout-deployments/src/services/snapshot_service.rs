//! Snapshot service
//!
//! Snapshots are captured before every deployment attempt and only become
//! rollback targets after an explicit integrity pass sets `verified`.

use async_trait::async_trait;
use rollout_core::{
    new_id, Environment, RecordFilter, RecordLocks, RecordStore, ServiceError, ShellCommandRunner,
    StoreError,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::services::types::Snapshot;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Snapshot {0} not found")]
    NotFound(String),

    #[error("Snapshot capture failed: {0}")]
    CaptureFailed(String),

    #[error("Snapshot {id} failed verification: {reason}")]
    VerificationFailed { id: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<SnapshotError> for ServiceError {
    fn from(err: SnapshotError) -> Self {
        match err {
            SnapshotError::NotFound(id) => ServiceError::NotFound {
                resource: format!("Snapshot {}", id),
            },
            SnapshotError::Store(e) => e.into(),
            other => ServiceError::ExternalService {
                service: "snapshot".to_string(),
                message: other.to_string(),
            },
        }
    }
}

/// State gathered by a capturer; the service turns it into a [`Snapshot`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapturedState {
    pub source_revision: String,
    pub database_backup_handle: Option<String>,
    pub config_files: Vec<String>,
}

/// Physically captures and re-checks system state
#[async_trait]
pub trait SnapshotCapturer: Send + Sync {
    async fn capture(&self, environment: Environment) -> Result<CapturedState, SnapshotError>;

    /// Integrity pass over a previously captured snapshot
    async fn verify(&self, snapshot: &Snapshot) -> Result<(), SnapshotError>;
}

/// Captures a source checkout: revision from git, config files from glob patterns
pub struct WorkspaceSnapshotCapturer {
    root: PathBuf,
    config_patterns: Vec<String>,
    revision_command: String,
    backup_command: Option<String>,
    runner: ShellCommandRunner,
    timeout: Duration,
}

impl WorkspaceSnapshotCapturer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            runner: ShellCommandRunner::new().with_working_dir(root.clone()),
            root,
            config_patterns: vec![
                "*.json".to_string(),
                "*.yaml".to_string(),
                "*.yml".to_string(),
                "*.toml".to_string(),
                ".env*".to_string(),
                "config/**/*".to_string(),
            ],
            revision_command: "git rev-parse HEAD".to_string(),
            backup_command: None,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_config_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Command whose trimmed stdout is the source revision
    pub fn with_revision_command(mut self, command: impl Into<String>) -> Self {
        self.revision_command = command.into();
        self
    }

    /// Command whose trimmed stdout is a database backup handle
    pub fn with_backup_command(mut self, command: impl Into<String>) -> Self {
        self.backup_command = Some(command.into());
        self
    }

    async fn run_capture_command(&self, command: &str) -> Result<String, SnapshotError> {
        let output = self
            .runner
            .run(command, self.timeout)
            .await
            .map_err(|e| SnapshotError::CaptureFailed(e.to_string()))?;
        if !output.success() {
            return Err(SnapshotError::CaptureFailed(format!(
                "'{}' failed: {}",
                command,
                output.combined()
            )));
        }
        let value = output.stdout.trim().to_string();
        if value.is_empty() {
            return Err(SnapshotError::CaptureFailed(format!(
                "'{}' produced no output",
                command
            )));
        }
        Ok(value)
    }

    fn enumerate_config_files(&self) -> Result<Vec<String>, SnapshotError> {
        let mut files = std::collections::BTreeSet::new();
        for pattern in &self.config_patterns {
            let full = self.root.join(pattern);
            let entries = glob::glob(&full.to_string_lossy()).map_err(|e| {
                SnapshotError::CaptureFailed(format!("invalid pattern '{}': {}", pattern, e))
            })?;
            for path in entries.flatten() {
                if !path.is_file() {
                    continue;
                }
                if let Ok(relative) = path.strip_prefix(&self.root) {
                    files.insert(relative.to_string_lossy().to_string());
                }
            }
        }
        Ok(files.into_iter().collect())
    }
}

#[async_trait]
impl SnapshotCapturer for WorkspaceSnapshotCapturer {
    async fn capture(&self, environment: Environment) -> Result<CapturedState, SnapshotError> {
        let source_revision = self.run_capture_command(&self.revision_command).await?;
        let database_backup_handle = match self.backup_command {
            Some(ref command) => Some(self.run_capture_command(command).await?),
            None => None,
        };
        let config_files = self.enumerate_config_files()?;

        debug!(
            "📸 Captured {} at {} with {} config files",
            environment,
            source_revision,
            config_files.len()
        );
        Ok(CapturedState {
            source_revision,
            database_backup_handle,
            config_files,
        })
    }

    async fn verify(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        let failed = |reason: String| SnapshotError::VerificationFailed {
            id: snapshot.id.clone(),
            reason,
        };

        if snapshot.source_revision.trim().is_empty() {
            return Err(failed("missing source revision".to_string()));
        }
        let missing: Vec<&str> = snapshot
            .config_files
            .iter()
            .filter(|file| !self.root.join(file).is_file())
            .map(|file| file.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(failed(format!("missing config files: {}", missing.join(", "))));
        }
        Ok(())
    }
}

/// Snapshot lifecycle: capture, verify, query and prune
pub struct SnapshotService {
    store: Arc<dyn RecordStore<Snapshot>>,
    capturer: Arc<dyn SnapshotCapturer>,
    locks: Arc<RecordLocks>,
}

impl SnapshotService {
    pub fn new(
        store: Arc<dyn RecordStore<Snapshot>>,
        capturer: Arc<dyn SnapshotCapturer>,
        locks: Arc<RecordLocks>,
    ) -> Self {
        Self {
            store,
            capturer,
            locks,
        }
    }

    /// Capture a new, unverified snapshot of `environment`
    pub async fn capture(&self, environment: Environment) -> Result<Snapshot, SnapshotError> {
        let state = self.capturer.capture(environment).await?;
        let snapshot = Snapshot {
            id: new_id(),
            environment,
            source_revision: state.source_revision,
            database_backup_handle: state.database_backup_handle,
            config_files: state.config_files,
            created_at: chrono::Utc::now(),
            verified: false,
            verified_at: None,
        };
        let snapshot = self.store.create(snapshot).await?;
        info!(
            "📸 Snapshot {} captured for {} at revision {}",
            snapshot.id, environment, snapshot.source_revision
        );
        Ok(snapshot)
    }

    /// Run the integrity pass and mark the snapshot verified
    ///
    /// Verifying an already verified snapshot is a no-op.
    pub async fn verify(&self, snapshot_id: &str) -> Result<Snapshot, SnapshotError> {
        let _guard = self.locks.lock(snapshot_id).await;
        let mut snapshot = self.require(snapshot_id).await?;
        if snapshot.verified {
            return Ok(snapshot);
        }

        self.capturer.verify(&snapshot).await?;

        snapshot.verified = true;
        snapshot.verified_at = Some(chrono::Utc::now());
        let snapshot = self.store.update(snapshot).await?;
        info!("🔐 Snapshot {} verified", snapshot.id);
        Ok(snapshot)
    }

    pub async fn get(&self, snapshot_id: &str) -> Result<Option<Snapshot>, SnapshotError> {
        Ok(self.store.get(snapshot_id).await?)
    }

    pub async fn require(&self, snapshot_id: &str) -> Result<Snapshot, SnapshotError> {
        self.store
            .get(snapshot_id)
            .await?
            .ok_or_else(|| SnapshotError::NotFound(snapshot_id.to_string()))
    }

    /// All snapshots of an environment, newest first
    pub async fn list(&self, environment: Environment) -> Result<Vec<Snapshot>, SnapshotError> {
        let mut snapshots = self
            .store
            .list(&RecordFilter::new().eq("environment", environment))
            .await?;
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(snapshots)
    }

    /// Verified snapshots of an environment, newest first
    pub async fn list_verified(
        &self,
        environment: Environment,
    ) -> Result<Vec<Snapshot>, SnapshotError> {
        Ok(self
            .list(environment)
            .await?
            .into_iter()
            .filter(|s| s.verified)
            .collect())
    }

    /// Delete all but the newest `keep` snapshots of an environment
    ///
    /// Snapshots in `protected` (targets of active rollback requests) are never
    /// deleted. Returns the ids that were removed.
    pub async fn prune(
        &self,
        environment: Environment,
        keep: usize,
        protected: &HashSet<String>,
    ) -> Result<Vec<String>, SnapshotError> {
        let mut removed = Vec::new();
        for snapshot in self.list(environment).await?.into_iter().skip(keep) {
            if protected.contains(&snapshot.id) {
                debug!("Keeping snapshot {} referenced by a rollback request", snapshot.id);
                continue;
            }
            let _guard = self.locks.lock(&snapshot.id).await;
            if self.store.delete(&snapshot.id).await? {
                removed.push(snapshot.id);
            }
        }
        if !removed.is_empty() {
            info!("🧹 Pruned {} snapshots for {}", removed.len(), environment);
        }
        Ok(removed)
    }
}

/// Capture and, when asked, immediately verify
///
/// A verification failure leaves the snapshot unverified instead of failing
/// the capture.
pub async fn capture_for_deployment(
    service: &SnapshotService,
    environment: Environment,
    verify: bool,
) -> Result<Snapshot, SnapshotError> {
    let snapshot = service.capture(environment).await?;
    if !verify {
        return Ok(snapshot);
    }
    match service.verify(&snapshot.id).await {
        Ok(verified) => Ok(verified),
        Err(SnapshotError::VerificationFailed { id, reason }) => {
            warn!("⚠️ Snapshot {} left unverified: {}", id, reason);
            Ok(snapshot)
        }
        Err(e) => Err(e),
    }
}
