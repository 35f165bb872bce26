//! Post-rollback integrity checklist

use async_trait::async_trait;
use rollout_core::{Environment, HealthProbe, UtcDateTime};
use rollout_deployments::Snapshot;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Fixed checklist run after every rollback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityCheckItem {
    DatabaseConnectivity,
    ConfigurationFiles,
    ApplicationStartup,
    ApiEndpoints,
    SecurityMonitoring,
}

impl IntegrityCheckItem {
    pub const ALL: [IntegrityCheckItem; 5] = [
        IntegrityCheckItem::DatabaseConnectivity,
        IntegrityCheckItem::ConfigurationFiles,
        IntegrityCheckItem::ApplicationStartup,
        IntegrityCheckItem::ApiEndpoints,
        IntegrityCheckItem::SecurityMonitoring,
    ];

    /// Key used for probe targets in settings
    pub fn key(&self) -> &'static str {
        match self {
            IntegrityCheckItem::DatabaseConnectivity => "database_connectivity",
            IntegrityCheckItem::ConfigurationFiles => "configuration_files",
            IntegrityCheckItem::ApplicationStartup => "application_startup",
            IntegrityCheckItem::ApiEndpoints => "api_endpoints",
            IntegrityCheckItem::SecurityMonitoring => "security_monitoring",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            IntegrityCheckItem::DatabaseConnectivity => "database connectivity",
            IntegrityCheckItem::ConfigurationFiles => "configuration files",
            IntegrityCheckItem::ApplicationStartup => "application startup",
            IntegrityCheckItem::ApiEndpoints => "API endpoints",
            IntegrityCheckItem::SecurityMonitoring => "security monitoring",
        }
    }
}

impl fmt::Display for IntegrityCheckItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityItemResult {
    pub item: IntegrityCheckItem,
    pub passed: bool,
    /// Passed without being checked because nothing was configured to probe
    #[serde(default)]
    pub skipped: bool,
    pub message: String,
    pub latency_ms: Option<u64>,
}

impl IntegrityItemResult {
    pub fn pass(item: IntegrityCheckItem, message: impl Into<String>) -> Self {
        Self {
            item,
            passed: true,
            skipped: false,
            message: message.into(),
            latency_ms: None,
        }
    }

    pub fn skip(item: IntegrityCheckItem, message: impl Into<String>) -> Self {
        Self {
            item,
            passed: true,
            skipped: true,
            message: message.into(),
            latency_ms: None,
        }
    }

    pub fn fail(item: IntegrityCheckItem, message: impl Into<String>) -> Self {
        Self {
            item,
            passed: false,
            skipped: false,
            message: message.into(),
            latency_ms: None,
        }
    }
}

/// Pass/fail per checklist item; passes only when every item passed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub environment: Environment,
    pub snapshot_id: String,
    pub items: Vec<IntegrityItemResult>,
    pub passed: bool,
    pub checked_at: UtcDateTime,
}

impl IntegrityReport {
    pub fn new(environment: Environment, snapshot_id: &str, items: Vec<IntegrityItemResult>) -> Self {
        let passed = items.len() == IntegrityCheckItem::ALL.len() && items.iter().all(|i| i.passed);
        Self {
            environment,
            snapshot_id: snapshot_id.to_string(),
            items,
            passed,
            checked_at: chrono::Utc::now(),
        }
    }

    pub fn failures(&self) -> Vec<&IntegrityItemResult> {
        self.items.iter().filter(|i| !i.passed).collect()
    }

    pub fn skipped(&self) -> Vec<&IntegrityItemResult> {
        self.items.iter().filter(|i| i.skipped).collect()
    }

    /// One line naming every failed item
    pub fn failure_summary(&self) -> String {
        let failures: Vec<String> = self
            .failures()
            .iter()
            .map(|f| format!("{}: {}", f.item, f.message))
            .collect();
        if failures.is_empty() {
            self.pass_summary()
        } else {
            format!("Integrity check failed: {}", failures.join("; "))
        }
    }

    /// Says which items were actually verified and which were skipped
    pub fn pass_summary(&self) -> String {
        let skipped: Vec<&str> = self.skipped().iter().map(|i| i.item.label()).collect();
        if skipped.is_empty() {
            return "all integrity checks passed".to_string();
        }
        format!(
            "{} of {} integrity checks passed, skipped without a probe target: {}",
            self.items.len() - skipped.len(),
            self.items.len(),
            skipped.join(", ")
        )
    }
}

#[async_trait]
pub trait IntegrityChecker: Send + Sync {
    async fn check_item(
        &self,
        item: IntegrityCheckItem,
        environment: Environment,
        snapshot: &Snapshot,
    ) -> IntegrityItemResult;

    /// Run the whole checklist in order
    async fn check(&self, environment: Environment, snapshot: &Snapshot) -> IntegrityReport {
        let mut items = Vec::with_capacity(IntegrityCheckItem::ALL.len());
        for item in IntegrityCheckItem::ALL {
            let result = self.check_item(item, environment, snapshot).await;
            if !result.passed {
                warn!("❌ Integrity check '{}' failed: {}", item, result.message);
            }
            items.push(result);
        }
        IntegrityReport::new(environment, &snapshot.id, items)
    }
}

/// Checks each item by probing its configured target
///
/// Targets may contain an `{environment}` placeholder. An item without a
/// target is reported as skipped, except configuration files, which fall
/// back to checking that the snapshot recorded some.
pub struct ProbeIntegrityChecker {
    probe: Arc<dyn HealthProbe>,
    targets: HashMap<String, String>,
}

impl ProbeIntegrityChecker {
    pub fn new(probe: Arc<dyn HealthProbe>, targets: HashMap<String, String>) -> Self {
        Self { probe, targets }
    }
}

#[async_trait]
impl IntegrityChecker for ProbeIntegrityChecker {
    async fn check_item(
        &self,
        item: IntegrityCheckItem,
        environment: Environment,
        snapshot: &Snapshot,
    ) -> IntegrityItemResult {
        let Some(target) = self.targets.get(item.key()) else {
            if item == IntegrityCheckItem::ConfigurationFiles {
                return if snapshot.config_files.is_empty() {
                    IntegrityItemResult::fail(item, "snapshot recorded no configuration files")
                } else {
                    IntegrityItemResult::pass(
                        item,
                        format!("{} configuration file(s) restored", snapshot.config_files.len()),
                    )
                };
            }
            debug!("No integrity target for {}, skipping", item.key());
            return IntegrityItemResult::skip(item, "no probe target configured");
        };

        let target = target.replace("{environment}", environment.as_str());
        match self.probe.probe(&target).await {
            Ok(result) => IntegrityItemResult {
                item,
                passed: result.healthy,
                skipped: false,
                message: result.message,
                latency_ms: Some(result.latency_ms),
            },
            Err(e) => IntegrityItemResult::fail(item, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollout_deployments::test_utils::StaticHealthProbe;

    fn snapshot(config_files: Vec<String>) -> Snapshot {
        Snapshot {
            id: "snap-1".to_string(),
            environment: Environment::Production,
            source_revision: "abc".to_string(),
            database_backup_handle: None,
            config_files,
            created_at: chrono::Utc::now(),
            verified: true,
            verified_at: Some(chrono::Utc::now()),
        }
    }

    #[tokio::test]
    async fn test_unconfigured_checklist_passes_with_config_files() {
        let checker = ProbeIntegrityChecker::new(Arc::new(StaticHealthProbe::healthy()), HashMap::new());
        let report = checker
            .check(Environment::Production, &snapshot(vec!["app.toml".to_string()]))
            .await;
        assert!(report.passed);
        assert_eq!(report.items.len(), 5);

        // Only the configuration files were actually checked
        assert_eq!(report.skipped().len(), 4);
        assert!(!report.items[1].skipped);
        assert_eq!(
            report.pass_summary(),
            "1 of 5 integrity checks passed, skipped without a probe target: \
             database connectivity, application startup, API endpoints, security monitoring"
        );
    }

    #[tokio::test]
    async fn test_missing_config_files_fail() {
        let checker = ProbeIntegrityChecker::new(Arc::new(StaticHealthProbe::healthy()), HashMap::new());
        let report = checker.check(Environment::Production, &snapshot(vec![])).await;
        assert!(!report.passed);
        assert_eq!(report.failures()[0].item, IntegrityCheckItem::ConfigurationFiles);
    }

    #[tokio::test]
    async fn test_unhealthy_probe_fails_item() {
        let targets = HashMap::from([(
            "api_endpoints".to_string(),
            "https://{environment}.example.com/health".to_string(),
        )]);
        let checker = ProbeIntegrityChecker::new(Arc::new(StaticHealthProbe::unhealthy(503)), targets);
        let report = checker
            .check(Environment::Staging, &snapshot(vec!["app.toml".to_string()]))
            .await;

        assert!(!report.passed);
        let failures = report.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].item, IntegrityCheckItem::ApiEndpoints);
        assert!(report.failure_summary().contains("API endpoints: HTTP 503"));
    }
}
