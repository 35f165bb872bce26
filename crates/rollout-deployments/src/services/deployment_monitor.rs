//! Deployment Monitor
//!
//! Follows pipeline runs through [`PipelineObserver`] events. Each monitored
//! deployment gets a session with its own lock, so concurrent deployments
//! never contend on shared state beyond the session map itself.
//!
//! Session lifecycle: `starting → running → {success | failed} → completed`.
//! Completed sessions stay queryable for a grace period and are then purged.

use async_trait::async_trait;
use rollout_core::{
    new_id, HealthProbe, MonitorSettings, ObserverVerdict, PipelineConfig, PipelineObserver,
    PipelineStage, ServiceError, StageResult, StageStatus, StatusBroadcaster, StatusUpdate,
    UtcDateTime,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::services::pipeline_generator::STAGE_DEPLOY;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("No monitor session for deployment {0}")]
    SessionNotFound(String),

    #[error("Monitor session for {deployment_id} cannot move from {from} to {to}")]
    InvalidTransition {
        deployment_id: String,
        from: MonitorStatus,
        to: MonitorStatus,
    },
}

impl From<MonitorError> for ServiceError {
    fn from(err: MonitorError) -> Self {
        match err {
            MonitorError::SessionNotFound(id) => ServiceError::NotFound {
                resource: format!("Monitor session {}", id),
            },
            other => ServiceError::Conflict {
                message: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStatus {
    Starting,
    Running,
    Success,
    Failed,
    Completed,
}

impl MonitorStatus {
    pub fn can_transition_to(&self, next: MonitorStatus) -> bool {
        matches!(
            (self, next),
            (MonitorStatus::Starting, MonitorStatus::Running)
                | (MonitorStatus::Starting, MonitorStatus::Failed)
                | (MonitorStatus::Running, MonitorStatus::Success)
                | (MonitorStatus::Running, MonitorStatus::Failed)
                | (MonitorStatus::Success, MonitorStatus::Completed)
                | (MonitorStatus::Failed, MonitorStatus::Completed)
        )
    }
}

impl fmt::Display for MonitorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MonitorStatus::Starting => "starting",
            MonitorStatus::Running => "running",
            MonitorStatus::Success => "success",
            MonitorStatus::Failed => "failed",
            MonitorStatus::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// Build log level, ordered by severity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildLogEntry {
    pub id: String,
    pub deployment_id: String,
    pub stage: String,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: UtcDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub id: String,
    pub deployment_id: String,
    pub target: String,
    pub healthy: bool,
    pub latency_ms: u64,
    pub status_code: Option<u16>,
    pub message: String,
    pub checked_at: UtcDateTime,
}

/// Stage timing for one deployment
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StageMetrics {
    pub total_stages: usize,
    /// Stages that finished, successfully or not
    pub completed_stages: usize,
    pub failed_stages: usize,
    /// Incremental mean over finished stages
    pub average_stage_duration_ms: f64,
    pub current_stage: Option<String>,
}

impl StageMetrics {
    fn record(&mut self, duration_ms: u64, success: bool) {
        self.completed_stages += 1;
        if !success {
            self.failed_stages += 1;
        }
        let n = self.completed_stages as f64;
        self.average_stage_duration_ms +=
            (duration_ms as f64 - self.average_stage_duration_ms) / n;
        self.current_stage = None;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSession {
    pub id: String,
    pub deployment_id: String,
    pub status: MonitorStatus,
    /// Success or failed once the pipeline finished; kept after completion
    pub outcome: Option<MonitorStatus>,
    pub started_at: UtcDateTime,
    pub completed_at: Option<UtcDateTime>,
    pub health_checks: Vec<HealthCheck>,
    pub build_logs: VecDeque<BuildLogEntry>,
    /// Entries dropped from the front of the capped log buffer
    pub evicted_log_entries: u64,
    pub metrics: StageMetrics,
}

impl MonitorSession {
    fn new(deployment_id: &str, total_stages: usize) -> Self {
        Self {
            id: new_id(),
            deployment_id: deployment_id.to_string(),
            status: MonitorStatus::Starting,
            outcome: None,
            started_at: chrono::Utc::now(),
            completed_at: None,
            health_checks: Vec::new(),
            build_logs: VecDeque::new(),
            evicted_log_entries: 0,
            metrics: StageMetrics {
                total_stages,
                ..StageMetrics::default()
            },
        }
    }

    fn push_log(
        &mut self,
        capacity: usize,
        stage: &str,
        level: LogLevel,
        message: String,
    ) -> BuildLogEntry {
        let entry = BuildLogEntry {
            id: new_id(),
            deployment_id: self.deployment_id.clone(),
            stage: stage.to_string(),
            level,
            message,
            timestamp: chrono::Utc::now(),
        };
        while self.build_logs.len() >= capacity.max(1) {
            self.build_logs.pop_front();
            self.evicted_log_entries += 1;
        }
        self.build_logs.push_back(entry.clone());
        entry
    }

    fn transition(&mut self, next: MonitorStatus) -> Result<(), MonitorError> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(MonitorError::InvalidTransition {
                deployment_id: self.deployment_id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if matches!(next, MonitorStatus::Success | MonitorStatus::Failed) {
            self.outcome = Some(next);
        }
        if next == MonitorStatus::Completed {
            self.completed_at = Some(chrono::Utc::now());
        }
        Ok(())
    }
}

type SessionHandle = Arc<Mutex<MonitorSession>>;

pub struct DeploymentMonitor {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    broadcaster: Arc<dyn StatusBroadcaster>,
    probe: Option<Arc<dyn HealthProbe>>,
    settings: MonitorSettings,
}

impl DeploymentMonitor {
    pub fn new(broadcaster: Arc<dyn StatusBroadcaster>, settings: MonitorSettings) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            broadcaster,
            probe: None,
            settings,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Open (or return the existing) session for a deployment
    pub async fn start_session(&self, deployment_id: &str, total_stages: usize) -> MonitorSession {
        let handle = {
            let mut sessions = self.sessions.write().await;
            sessions
                .entry(deployment_id.to_string())
                .or_insert_with(|| {
                    debug!("📡 Monitor session opened for deployment {}", deployment_id);
                    Arc::new(Mutex::new(MonitorSession::new(deployment_id, total_stages)))
                })
                .clone()
        };
        let mut session = handle.lock().await;
        if session.metrics.total_stages == 0 {
            session.metrics.total_stages = total_stages;
        }
        session.clone()
    }

    pub async fn get_session(&self, deployment_id: &str) -> Option<MonitorSession> {
        let handle = self.handle(deployment_id).await.ok()?;
        let session = handle.lock().await;
        Some(session.clone())
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Build log in append order, optionally only entries at or above `min_level`
    pub async fn logs(
        &self,
        deployment_id: &str,
        min_level: Option<LogLevel>,
    ) -> Result<Vec<BuildLogEntry>, MonitorError> {
        let handle = self.handle(deployment_id).await?;
        let session = handle.lock().await;
        Ok(session
            .build_logs
            .iter()
            .filter(|entry| min_level.map_or(true, |min| entry.level >= min))
            .cloned()
            .collect())
    }

    pub async fn metrics(&self, deployment_id: &str) -> Result<StageMetrics, MonitorError> {
        let handle = self.handle(deployment_id).await?;
        let session = handle.lock().await;
        Ok(session.metrics.clone())
    }

    pub async fn health_checks(
        &self,
        deployment_id: &str,
    ) -> Result<Vec<HealthCheck>, MonitorError> {
        let handle = self.handle(deployment_id).await?;
        let session = handle.lock().await;
        Ok(session.health_checks.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.broadcaster.subscribe()
    }

    /// Publish an update that did not come from a pipeline event
    pub fn publish(&self, update: StatusUpdate) {
        self.broadcaster.publish(update);
    }

    pub async fn append_log(
        &self,
        deployment_id: &str,
        stage: &str,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Result<BuildLogEntry, MonitorError> {
        let handle = self.handle(deployment_id).await?;
        let mut session = handle.lock().await;
        Ok(session.push_log(self.settings.log_buffer_capacity, stage, level, message.into()))
    }

    /// Probe the configured target and record the result on the session
    ///
    /// Returns `None` when no probe or target is configured.
    pub async fn run_health_check(
        &self,
        deployment_id: &str,
    ) -> Result<Option<HealthCheck>, MonitorError> {
        let (probe, target) = match (&self.probe, &self.settings.health_check_target) {
            (Some(probe), Some(target)) => (probe.clone(), target.clone()),
            _ => return Ok(None),
        };
        let handle = self.handle(deployment_id).await?;

        let result = probe.probe(&target).await;
        let check = match result {
            Ok(result) => HealthCheck {
                id: new_id(),
                deployment_id: deployment_id.to_string(),
                target: result.target,
                healthy: result.healthy,
                latency_ms: result.latency_ms,
                status_code: result.status_code,
                message: result.message,
                checked_at: chrono::Utc::now(),
            },
            Err(e) => HealthCheck {
                id: new_id(),
                deployment_id: deployment_id.to_string(),
                target: target.clone(),
                healthy: false,
                latency_ms: 0,
                status_code: None,
                message: e.to_string(),
                checked_at: chrono::Utc::now(),
            },
        };

        {
            let mut session = handle.lock().await;
            let capacity = self.settings.log_buffer_capacity;
            if check.healthy {
                session.push_log(
                    capacity,
                    STAGE_DEPLOY,
                    LogLevel::Info,
                    format!("Health check passed for {} in {}ms", check.target, check.latency_ms),
                );
            } else {
                session.push_log(
                    capacity,
                    STAGE_DEPLOY,
                    LogLevel::Error,
                    format!("Health check failed for {}: {}", check.target, check.message),
                );
            }
            session.health_checks.push(check.clone());
        }

        if check.healthy {
            info!("💚 Health check passed for deployment {}", deployment_id);
        } else {
            warn!(
                "💔 Health check failed for deployment {}: {}",
                deployment_id, check.message
            );
        }
        self.broadcaster.publish(
            StatusUpdate::new(
                deployment_id,
                if check.healthy { "healthy" } else { "unhealthy" },
                check.message.clone(),
            )
            .with_metadata("target", &check.target)
            .with_metadata("latency_ms", check.latency_ms)
            .with_metadata("status_code", check.status_code),
        );
        Ok(Some(check))
    }

    /// Drop completed sessions older than the retention window
    pub async fn purge_expired(&self) -> usize {
        let retention = chrono::Duration::seconds(self.settings.session_retention_secs as i64);
        self.purge_completed_before(chrono::Utc::now() - retention).await
    }

    pub async fn purge_completed_before(&self, cutoff: UtcDateTime) -> usize {
        let handles: Vec<(String, SessionHandle)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect();

        let mut expired = Vec::new();
        for (id, handle) in handles {
            let session = handle.lock().await;
            if session.completed_at.map_or(false, |at| at <= cutoff) {
                expired.push(id);
            }
        }

        if expired.is_empty() {
            return 0;
        }
        let mut sessions = self.sessions.write().await;
        for id in &expired {
            sessions.remove(id);
        }
        debug!("🧹 Purged {} completed monitor sessions", expired.len());
        expired.len()
    }

    /// Periodically purge expired sessions until the handle is aborted
    pub fn spawn_retention_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                monitor.purge_expired().await;
            }
        })
    }

    async fn handle(&self, deployment_id: &str) -> Result<SessionHandle, MonitorError> {
        self.sessions
            .read()
            .await
            .get(deployment_id)
            .cloned()
            .ok_or_else(|| MonitorError::SessionNotFound(deployment_id.to_string()))
    }

    async fn handle_or_start(&self, deployment_id: &str) -> SessionHandle {
        if let Ok(handle) = self.handle(deployment_id).await {
            return handle;
        }
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(deployment_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(MonitorSession::new(deployment_id, 0))))
            .clone()
    }

    fn publish_status(
        &self,
        deployment_id: &str,
        status: impl ToString,
        message: String,
        stage: Option<&str>,
    ) {
        let mut update = StatusUpdate::new(deployment_id, status, message);
        if let Some(stage) = stage {
            update = update.with_metadata("stage", stage);
        }
        self.broadcaster.publish(update);
    }
}

#[async_trait]
impl PipelineObserver for DeploymentMonitor {
    async fn on_pipeline_started(&self, deployment_id: &str, config: &PipelineConfig) {
        self.start_session(deployment_id, config.stages.len()).await;
        let handle = self.handle_or_start(deployment_id).await;
        {
            let mut session = handle.lock().await;
            session.push_log(
                self.settings.log_buffer_capacity,
                "pipeline",
                LogLevel::Info,
                format!(
                    "Pipeline started with {} stages targeting {}",
                    config.stages.len(),
                    config.target_environment
                ),
            );
        }
        self.publish_status(
            deployment_id,
            MonitorStatus::Starting,
            format!("Deployment to {} starting", config.target_environment),
            None,
        );
    }

    async fn on_stage_started(
        &self,
        deployment_id: &str,
        stage: &PipelineStage,
        index: usize,
        total: usize,
    ) {
        let handle = self.handle_or_start(deployment_id).await;
        let message = format!("Stage {} started ({}/{})", stage.name, index + 1, total);
        {
            let mut session = handle.lock().await;
            if let Err(e) = session.transition(MonitorStatus::Running) {
                warn!("{}", e);
            }
            session.metrics.current_stage = Some(stage.name.clone());
            session.push_log(
                self.settings.log_buffer_capacity,
                &stage.name,
                LogLevel::Info,
                message.clone(),
            );
        }
        self.publish_status(deployment_id, MonitorStatus::Running, message, Some(&stage.name));
    }

    async fn on_stage_progress(&self, deployment_id: &str, stage_name: &str, message: &str) {
        let handle = self.handle_or_start(deployment_id).await;
        let mut session = handle.lock().await;
        session.push_log(
            self.settings.log_buffer_capacity,
            stage_name,
            LogLevel::Debug,
            message.to_string(),
        );
    }

    async fn on_stage_finished(
        &self,
        deployment_id: &str,
        result: &StageResult,
    ) -> ObserverVerdict {
        let handle = self.handle_or_start(deployment_id).await;

        // The post-deploy health check decides whether the deploy stage counts
        let verdict = if result.success && result.stage_name == STAGE_DEPLOY {
            match self.run_health_check(deployment_id).await {
                Ok(Some(check)) if !check.healthy && self.settings.fail_on_unhealthy => {
                    ObserverVerdict::Fail(format!(
                        "Post-deploy health check failed: {}",
                        check.message
                    ))
                }
                Ok(_) => ObserverVerdict::Continue,
                Err(e) => {
                    error!("Health check could not run for {}: {}", deployment_id, e);
                    ObserverVerdict::Continue
                }
            }
        } else {
            ObserverVerdict::Continue
        };

        let (success, message) = match (&verdict, &result.error) {
            (ObserverVerdict::Fail(reason), _) => {
                (false, format!("Stage {} failed: {}", result.stage_name, reason))
            }
            (_, Some(e)) => (false, format!("Stage {} failed: {}", result.stage_name, e)),
            (_, None) => (
                result.success,
                format!("Stage {} completed in {}ms", result.stage_name, result.duration_ms),
            ),
        };
        {
            let mut session = handle.lock().await;
            session.metrics.record(result.duration_ms, success);
            let level = if success {
                LogLevel::Info
            } else {
                LogLevel::Error
            };
            session.push_log(
                self.settings.log_buffer_capacity,
                &result.stage_name,
                level,
                message.clone(),
            );
        }
        let status = if success {
            StageStatus::Success
        } else {
            StageStatus::Failed
        };
        self.publish_status(deployment_id, status, message, Some(&result.stage_name));

        verdict
    }

    async fn on_pipeline_finished(&self, deployment_id: &str, success: bool, error: Option<&str>) {
        let handle = self.handle_or_start(deployment_id).await;
        let outcome = if success {
            MonitorStatus::Success
        } else {
            MonitorStatus::Failed
        };
        let message = match error {
            Some(e) => format!("Deployment failed: {}", e),
            None => "Deployment succeeded".to_string(),
        };
        {
            let mut session = handle.lock().await;
            if let Err(e) = session.transition(outcome) {
                warn!("{}", e);
            }
            let level = if success { LogLevel::Info } else { LogLevel::Error };
            session.push_log(
                self.settings.log_buffer_capacity,
                "pipeline",
                level,
                message.clone(),
            );
            if let Err(e) = session.transition(MonitorStatus::Completed) {
                warn!("{}", e);
            }
        }
        self.publish_status(deployment_id, outcome, message, None);
        self.publish_status(
            deployment_id,
            MonitorStatus::Completed,
            "Monitoring complete".to_string(),
            None,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::StaticHealthProbe;
    use rollout_core::{BroadcastStatusChannel, Environment};

    fn monitor(settings: MonitorSettings) -> DeploymentMonitor {
        DeploymentMonitor::new(Arc::new(BroadcastStatusChannel::new(64)), settings)
    }

    fn config(stages: &[&str]) -> PipelineConfig {
        PipelineConfig {
            id: "p-1".to_string(),
            source_spec_id: "spec-1".to_string(),
            branch_name: "main".to_string(),
            stages: stages.iter().map(|s| PipelineStage::new(*s, *s)).collect(),
            target_environment: Environment::Staging,
            created_at: chrono::Utc::now(),
        }
    }

    fn result(stage: &str, success: bool, duration_ms: u64) -> StageResult {
        StageResult {
            stage_name: stage.to_string(),
            success,
            duration_ms,
            output: String::new(),
            error: if success { None } else { Some("boom".to_string()) },
            started_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_session_lifecycle_and_log_levels() {
        let monitor = monitor(MonitorSettings::default());
        let config = config(&["build", "test"]);

        monitor.on_pipeline_started("dep-1", &config).await;
        assert_eq!(
            monitor.get_session("dep-1").await.unwrap().status,
            MonitorStatus::Starting
        );

        monitor.on_stage_started("dep-1", &config.stages[0], 0, 2).await;
        monitor.on_stage_progress("dep-1", "build", "npm ci").await;
        monitor.on_stage_finished("dep-1", &result("build", true, 100)).await;
        monitor.on_stage_started("dep-1", &config.stages[1], 1, 2).await;
        monitor.on_stage_finished("dep-1", &result("test", false, 300)).await;
        monitor.on_pipeline_finished("dep-1", false, Some("Stage 'test' failed")).await;

        let session = monitor.get_session("dep-1").await.unwrap();
        assert_eq!(session.status, MonitorStatus::Completed);
        assert_eq!(session.outcome, Some(MonitorStatus::Failed));
        assert!(session.completed_at.is_some());

        let all = monitor.logs("dep-1", None).await.unwrap();
        assert_eq!(all[2].level, LogLevel::Debug);
        assert_eq!(all[2].message, "npm ci");

        let errors = monitor.logs("dep-1", Some(LogLevel::Error)).await.unwrap();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].message.contains("test"));

        let metrics = monitor.metrics("dep-1").await.unwrap();
        assert_eq!(metrics.total_stages, 2);
        assert_eq!(metrics.completed_stages, 2);
        assert_eq!(metrics.failed_stages, 1);
        assert!((metrics.average_stage_duration_ms - 200.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_log_buffer_evicts_oldest() {
        let monitor = monitor(MonitorSettings {
            log_buffer_capacity: 3,
            ..MonitorSettings::default()
        });
        monitor.start_session("dep-1", 1).await;
        for i in 0..5 {
            monitor
                .append_log("dep-1", "build", LogLevel::Info, format!("line {}", i))
                .await
                .unwrap();
        }

        let logs = monitor.logs("dep-1", None).await.unwrap();
        let messages: Vec<&str> = logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["line 2", "line 3", "line 4"]);
        assert_eq!(monitor.get_session("dep-1").await.unwrap().evicted_log_entries, 2);
    }

    #[tokio::test]
    async fn test_unhealthy_probe_is_informational_by_default() {
        let settings = MonitorSettings {
            health_check_target: Some("http://app.internal/health".to_string()),
            ..MonitorSettings::default()
        };
        let monitor = monitor(settings).with_probe(Arc::new(StaticHealthProbe::unhealthy(503)));
        let config = config(&["deploy"]);
        monitor.on_pipeline_started("dep-1", &config).await;
        monitor.on_stage_started("dep-1", &config.stages[0], 0, 1).await;

        let verdict = monitor.on_stage_finished("dep-1", &result("deploy", true, 10)).await;
        assert_eq!(verdict, ObserverVerdict::Continue);

        let checks = monitor.health_checks("dep-1").await.unwrap();
        assert_eq!(checks.len(), 1);
        assert!(!checks[0].healthy);
        let errors = monitor.logs("dep-1", Some(LogLevel::Error)).await.unwrap();
        assert!(errors[0].message.contains("Health check failed"));
    }

    #[tokio::test]
    async fn test_unhealthy_probe_fails_deploy_when_configured() {
        let settings = MonitorSettings {
            health_check_target: Some("http://app.internal/health".to_string()),
            fail_on_unhealthy: true,
            ..MonitorSettings::default()
        };
        let monitor = monitor(settings).with_probe(Arc::new(StaticHealthProbe::unhealthy(500)));
        monitor.start_session("dep-1", 1).await;

        let mut updates = monitor.subscribe();
        let verdict = monitor.on_stage_finished("dep-1", &result("deploy", true, 10)).await;
        assert!(matches!(verdict, ObserverVerdict::Fail(_)));

        // The deploy stage is recorded as failed, never as completed
        let metrics = monitor.metrics("dep-1").await.unwrap();
        assert_eq!(metrics.completed_stages, 1);
        assert_eq!(metrics.failed_stages, 1);
        let logs = monitor.logs("dep-1", None).await.unwrap();
        assert!(logs.iter().all(|l| !l.message.contains("completed")));
        let last = logs.last().unwrap();
        assert_eq!(last.level, LogLevel::Error);
        assert!(last.message.starts_with("Stage deploy failed: Post-deploy health check failed"));

        let mut statuses = Vec::new();
        while let Ok(update) = updates.try_recv() {
            statuses.push(update.status);
        }
        assert_eq!(statuses.last().map(String::as_str), Some("failed"));
    }

    #[tokio::test]
    async fn test_status_changes_fan_out_to_subscribers() {
        let monitor = monitor(MonitorSettings::default());
        let mut first = monitor.subscribe();
        let mut second = monitor.subscribe();

        monitor.on_pipeline_started("dep-1", &config(&["build"])).await;

        assert_eq!(first.recv().await.unwrap().status, "starting");
        assert_eq!(second.recv().await.unwrap().deployment_id, "dep-1");
    }

    #[tokio::test]
    async fn test_sessions_are_isolated_and_purged_after_retention() {
        let monitor = monitor(MonitorSettings::default());
        monitor.on_pipeline_started("dep-a", &config(&["build"])).await;
        monitor.on_pipeline_started("dep-b", &config(&["build"])).await;
        monitor
            .append_log("dep-a", "build", LogLevel::Info, "only a")
            .await
            .unwrap();
        assert_eq!(monitor.logs("dep-b", None).await.unwrap().len(), 1);

        monitor.on_stage_started("dep-a", &config(&["build"]).stages[0], 0, 1).await;
        monitor.on_pipeline_finished("dep-a", true, None).await;

        assert_eq!(monitor.purge_expired().await, 0);
        let purged = monitor
            .purge_completed_before(chrono::Utc::now() + chrono::Duration::seconds(1))
            .await;
        assert_eq!(purged, 1);
        assert!(monitor.get_session("dep-a").await.is_none());
        assert!(monitor.get_session("dep-b").await.is_some());
    }
}
