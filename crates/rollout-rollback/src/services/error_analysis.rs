//! Deterministic error categorization
//!
//! Error text is lowercased and split into words; each category owns a set
//! of keywords and phrases. Categories are checked in a fixed order, so text
//! that mentions both a database and a timeout is a database error.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Database,
    Filesystem,
    Network,
    Timeout,
    Resources,
    Unknown,
}

impl ErrorCategory {
    /// Order in which categories are tried
    pub const PRECEDENCE: [ErrorCategory; 5] = [
        ErrorCategory::Database,
        ErrorCategory::Filesystem,
        ErrorCategory::Network,
        ErrorCategory::Timeout,
        ErrorCategory::Resources,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Database => "database",
            ErrorCategory::Filesystem => "filesystem",
            ErrorCategory::Network => "network",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Resources => "resources",
            ErrorCategory::Unknown => "unknown",
        }
    }

    fn keywords(&self) -> &'static [&'static str] {
        match self {
            ErrorCategory::Database => &[
                "database",
                "db",
                "sql",
                "postgres",
                "postgresql",
                "mysql",
                "sqlite",
                "mongodb",
                "query",
                "deadlock",
                "migration",
                "schema",
                "transaction",
                "constraint",
            ],
            ErrorCategory::Filesystem => &[
                "file",
                "files",
                "filesystem",
                "directory",
                "disk",
                "path",
                "enoent",
                "eacces",
                "erofs",
                "mount",
                "symlink",
            ],
            ErrorCategory::Network => &[
                "network",
                "connection",
                "connect",
                "socket",
                "dns",
                "econnrefused",
                "econnreset",
                "unreachable",
                "host",
                "tls",
                "ssl",
                "http",
                "proxy",
                "refused",
            ],
            ErrorCategory::Timeout => &["timeout", "timeouts", "deadline", "etimedout", "timedout"],
            ErrorCategory::Resources => &[
                "memory",
                "oom",
                "cpu",
                "quota",
                "exhausted",
                "capacity",
                "throttled",
                "enomem",
            ],
            ErrorCategory::Unknown => &[],
        }
    }

    fn phrases(&self) -> &'static [&'static str] {
        match self {
            ErrorCategory::Filesystem => &["no such file", "permission denied", "read-only"],
            ErrorCategory::Network => &["connection reset", "name resolution"],
            ErrorCategory::Timeout => &["timed out", "took too long"],
            ErrorCategory::Resources => &["no space left", "out of memory", "too many open", "resource limit"],
            _ => &[],
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            ErrorCategory::Database => Severity::High,
            ErrorCategory::Filesystem => Severity::Medium,
            ErrorCategory::Network => Severity::Medium,
            ErrorCategory::Timeout => Severity::Medium,
            ErrorCategory::Resources => Severity::Critical,
            ErrorCategory::Unknown => Severity::Medium,
        }
    }

    fn root_cause(&self) -> &'static str {
        match self {
            ErrorCategory::Database => {
                "The database could not be reached or rejected the restore; data written since the snapshot may conflict with the restored schema."
            }
            ErrorCategory::Filesystem => {
                "Files required by the restored release are missing, unreadable or on a read-only volume."
            }
            ErrorCategory::Network => {
                "A service the rollback depends on was unreachable or dropped the connection."
            }
            ErrorCategory::Timeout => {
                "A rollback step exceeded its time limit, so the environment may be partially restored."
            }
            ErrorCategory::Resources => {
                "The host ran out of memory, disk space or another quota while restoring."
            }
            ErrorCategory::Unknown => {
                "The failure did not match a known pattern and needs manual inspection."
            }
        }
    }

    fn affected_components(&self) -> &'static [&'static str] {
        match self {
            ErrorCategory::Database => &["database", "data layer", "application backend"],
            ErrorCategory::Filesystem => &["file storage", "configuration files", "application bundle"],
            ErrorCategory::Network => &["network", "service dependencies", "load balancer"],
            ErrorCategory::Timeout => &["rollback executor", "application startup"],
            ErrorCategory::Resources => &["host resources", "application runtime"],
            ErrorCategory::Unknown => &["environment"],
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorAnalysis {
    pub category: ErrorCategory,
    pub severity: Severity,
    pub root_cause: String,
    pub affected_components: Vec<String>,
    pub summary: String,
}

const SUMMARY_DETAIL_LIMIT: usize = 200;

/// Categorize raw error text
pub fn categorize_error(error_text: &str) -> ErrorCategory {
    let lowered = error_text.to_lowercase();
    let words: HashSet<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    ErrorCategory::PRECEDENCE
        .into_iter()
        .find(|category| {
            category.keywords().iter().any(|k| words.contains(k))
                || category.phrases().iter().any(|p| lowered.contains(p))
        })
        .unwrap_or(ErrorCategory::Unknown)
}

/// Build the full analysis for a failed rollback
pub fn analyze_error(error_text: &str) -> ErrorAnalysis {
    let category = categorize_error(error_text);
    let detail = error_text.lines().next().unwrap_or_default().trim();
    let detail = if detail.is_empty() {
        "no error message was reported".to_string()
    } else if detail.chars().count() > SUMMARY_DETAIL_LIMIT {
        let truncated: String = detail.chars().take(SUMMARY_DETAIL_LIMIT).collect();
        format!("{}...", truncated)
    } else {
        detail.to_string()
    };

    ErrorAnalysis {
        category,
        severity: category.severity(),
        root_cause: category.root_cause().to_string(),
        affected_components: category
            .affected_components()
            .iter()
            .map(|c| c.to_string())
            .collect(),
        summary: format!(
            "{} failure ({} severity): {}",
            category, category.severity(), detail
        ),
    }
}
