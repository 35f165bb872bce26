//! Recovery option tables per error category

use serde::{Deserialize, Serialize};

use crate::services::error_analysis::ErrorCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// One suggested next step after a failed rollback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAction {
    pub title: String,
    pub description: String,
    pub risk: RiskLevel,
    pub estimated_minutes: u32,
    /// Whether the action itself needs a second-party sign-off
    pub requires_approval: bool,
}

struct ActionTemplate {
    title: &'static str,
    description: &'static str,
    risk: RiskLevel,
    estimated_minutes: u32,
    requires_approval: bool,
}

impl ActionTemplate {
    const fn new(
        title: &'static str,
        description: &'static str,
        risk: RiskLevel,
        estimated_minutes: u32,
        requires_approval: bool,
    ) -> Self {
        Self {
            title,
            description,
            risk,
            estimated_minutes,
            requires_approval,
        }
    }

    fn to_action(&self) -> RecoveryAction {
        RecoveryAction {
            title: self.title.to_string(),
            description: self.description.to_string(),
            risk: self.risk,
            estimated_minutes: self.estimated_minutes,
            requires_approval: self.requires_approval,
        }
    }
}

const DATABASE_ACTIONS: &[ActionTemplate] = &[
    ActionTemplate::new(
        "Manual database restoration from verified backup",
        "Restore the database from the backup handle recorded on the target snapshot, then re-run the rollback.",
        RiskLevel::High,
        60,
        true,
    ),
    ActionTemplate::new(
        "Run database integrity check and repair",
        "Check tables, indexes and constraints for corruption and repair what the engine can fix in place.",
        RiskLevel::Medium,
        30,
        false,
    ),
    ActionTemplate::new(
        "Schema-only rollback",
        "Revert pending migrations to the snapshot's schema version while leaving current data in place.",
        RiskLevel::High,
        45,
        true,
    ),
    ActionTemplate::new(
        "Switch application to read-only mode",
        "Stop writes so no further data diverges while the database is repaired.",
        RiskLevel::Low,
        10,
        false,
    ),
    ActionTemplate::new(
        "Escalate to database administrator",
        "Page the DBA on call with the error analysis and snapshot details.",
        RiskLevel::Low,
        5,
        false,
    ),
];

const FILESYSTEM_ACTIONS: &[ActionTemplate] = &[
    ActionTemplate::new(
        "Restore configuration files from snapshot",
        "Copy the configuration files listed on the snapshot back into place and re-run the rollback.",
        RiskLevel::Medium,
        20,
        false,
    ),
    ActionTemplate::new(
        "Fix file permissions and ownership",
        "Reset ownership and modes on the release directory for the service account.",
        RiskLevel::Low,
        15,
        false,
    ),
    ActionTemplate::new(
        "Remount volume read-write",
        "Check why the volume is read-only, remount it and verify free inodes.",
        RiskLevel::Medium,
        20,
        true,
    ),
];

const NETWORK_ACTIONS: &[ActionTemplate] = &[
    ActionTemplate::new(
        "Verify service dependencies are reachable",
        "Check DNS, firewall rules and health endpoints of every upstream the release needs.",
        RiskLevel::Low,
        15,
        false,
    ),
    ActionTemplate::new(
        "Retry rollback once connectivity is restored",
        "Re-initiate the rollback against the same verified snapshot.",
        RiskLevel::Medium,
        20,
        true,
    ),
    ActionTemplate::new(
        "Fail over to standby region",
        "Route traffic to the standby environment until the primary network recovers.",
        RiskLevel::High,
        30,
        true,
    ),
];

const TIMEOUT_ACTIONS: &[ActionTemplate] = &[
    ActionTemplate::new(
        "Check for partially restored components",
        "Compare running versions against the snapshot revision to find steps that did not finish.",
        RiskLevel::Low,
        15,
        false,
    ),
    ActionTemplate::new(
        "Retry rollback with extended timeouts",
        "Re-initiate the rollback after raising the executor timeout.",
        RiskLevel::Medium,
        30,
        true,
    ),
    ActionTemplate::new(
        "Restart stalled services",
        "Restart services that are stuck starting and watch their health checks.",
        RiskLevel::Medium,
        15,
        false,
    ),
];

const RESOURCES_ACTIONS: &[ActionTemplate] = &[
    ActionTemplate::new(
        "Free disk space and memory",
        "Clear caches, old releases and logs, and stop non-essential workloads on the host.",
        RiskLevel::Low,
        20,
        false,
    ),
    ActionTemplate::new(
        "Scale up host resources",
        "Move the environment to a larger instance or raise its resource quota.",
        RiskLevel::Medium,
        30,
        true,
    ),
    ActionTemplate::new(
        "Retry rollback during low traffic",
        "Re-initiate the rollback when load is lowest.",
        RiskLevel::Medium,
        30,
        true,
    ),
];

const UNKNOWN_ACTIONS: &[ActionTemplate] = &[
    ActionTemplate::new(
        "Inspect rollback logs manually",
        "Read the executor output and integrity report for the first failing step.",
        RiskLevel::Low,
        20,
        false,
    ),
    ActionTemplate::new(
        "Roll back to an older verified snapshot",
        "Pick the next older verified snapshot from the candidate list and initiate a new rollback.",
        RiskLevel::High,
        45,
        true,
    ),
    ActionTemplate::new(
        "Escalate to on-call engineer",
        "Page the on-call engineer with the error analysis.",
        RiskLevel::Low,
        5,
        false,
    ),
];

const COMMON_ACTIONS: &[ActionTemplate] = &[
    ActionTemplate::new(
        "Create incident report",
        "Record the failure, its impact and the actions taken so far.",
        RiskLevel::Low,
        15,
        false,
    ),
    ActionTemplate::new(
        "Capture system state snapshot for post-mortem",
        "Preserve logs, metrics and the current environment state before anything else changes.",
        RiskLevel::Low,
        10,
        false,
    ),
    ActionTemplate::new(
        "Notify stakeholders",
        "Tell affected teams and users that the rollback failed and what happens next.",
        RiskLevel::Low,
        5,
        false,
    ),
];

/// Ordered recovery actions for a category
///
/// Category-specific actions come first; the three common actions are
/// always appended.
pub fn recovery_options(category: ErrorCategory) -> Vec<RecoveryAction> {
    let specific = match category {
        ErrorCategory::Database => DATABASE_ACTIONS,
        ErrorCategory::Filesystem => FILESYSTEM_ACTIONS,
        ErrorCategory::Network => NETWORK_ACTIONS,
        ErrorCategory::Timeout => TIMEOUT_ACTIONS,
        ErrorCategory::Resources => RESOURCES_ACTIONS,
        ErrorCategory::Unknown => UNKNOWN_ACTIONS,
    };
    specific
        .iter()
        .chain(COMMON_ACTIONS)
        .map(ActionTemplate::to_action)
        .collect()
}
