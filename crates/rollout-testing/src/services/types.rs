use rollout_core::{Record, UtcDateTime};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// What started a test execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Commit,
    PullRequest,
    Manual,
    Scheduled,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Commit => "commit",
            TriggerType::PullRequest => "pull_request",
            TriggerType::Manual => "manual",
            TriggerType::Scheduled => "scheduled",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a trigger came from and what it changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestTriggerContext {
    pub trigger_type: TriggerType,
    pub branch: Option<String>,
    pub commit_sha: Option<String>,
    pub pull_request: Option<u64>,
    /// `None` means the change set is unknown and every suite runs
    pub changed_files: Option<Vec<String>>,
    pub triggered_by: Option<String>,
    /// Opaque values passed through to suite runners
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl TestTriggerContext {
    fn new(trigger_type: TriggerType) -> Self {
        Self {
            trigger_type,
            branch: None,
            commit_sha: None,
            pull_request: None,
            changed_files: None,
            triggered_by: None,
            metadata: HashMap::new(),
        }
    }

    pub fn commit(branch: impl Into<String>, sha: impl Into<String>) -> Self {
        let mut context = Self::new(TriggerType::Commit);
        context.branch = Some(branch.into());
        context.commit_sha = Some(sha.into());
        context
    }

    pub fn pull_request(number: u64, branch: impl Into<String>) -> Self {
        let mut context = Self::new(TriggerType::PullRequest);
        context.pull_request = Some(number);
        context.branch = Some(branch.into());
        context
    }

    pub fn manual(actor_id: impl Into<String>) -> Self {
        let mut context = Self::new(TriggerType::Manual);
        context.triggered_by = Some(actor_id.into());
        context
    }

    pub fn scheduled() -> Self {
        Self::new(TriggerType::Scheduled)
    }

    pub fn with_changed_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.changed_files = Some(files.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

fn default_suite_timeout_secs() -> u64 {
    600
}

/// One runnable test suite of a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSuiteConfig {
    pub name: String,
    /// Empty in a config file means the suite name is shown
    #[serde(default)]
    pub display_name: String,
    pub command: String,
    #[serde(default = "default_suite_timeout_secs")]
    pub timeout_secs: u64,
    /// Extra attempts after a failed run
    #[serde(default)]
    pub retry_count: u32,
    /// In sequential mode a failure stops the remaining queue
    #[serde(default)]
    pub fail_fast: bool,
    /// Glob patterns over changed paths; empty means always run
    #[serde(default)]
    pub path_patterns: Vec<String>,
}

impl TestSuiteConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            command: command.into(),
            timeout_secs: default_suite_timeout_secs(),
            retry_count: 0,
            fail_fast: false,
            path_patterns: Vec::new(),
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn with_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.path_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn fail_fast(mut self) -> Self {
        self.fail_fast = true;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// Per-project trigger configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestTriggerConfig {
    pub project_id: String,
    pub suites: Vec<TestSuiteConfig>,
    #[serde(default)]
    pub parallel_execution: bool,
    /// Zero falls back to the configured default
    #[serde(default)]
    pub max_concurrent_suites: usize,
    #[serde(default)]
    pub pre_merge_required: bool,
    /// Cron expression (with seconds) for scheduled runs
    #[serde(default)]
    pub schedule: Option<String>,
}

impl TestTriggerConfig {
    pub fn new(project_id: impl Into<String>, suites: Vec<TestSuiteConfig>) -> Self {
        Self {
            project_id: project_id.into(),
            suites,
            parallel_execution: false,
            max_concurrent_suites: 0,
            pre_merge_required: false,
            schedule: None,
        }
    }

    pub fn parallel(mut self, max_concurrent_suites: usize) -> Self {
        self.parallel_execution = true;
        self.max_concurrent_suites = max_concurrent_suites;
        self
    }

    pub fn requiring_pre_merge(mut self) -> Self {
        self.pre_merge_required = true;
        self
    }

    pub fn with_schedule(mut self, expression: impl Into<String>) -> Self {
        self.schedule = Some(expression.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestExecutionStatus {
    Queued,
    Running,
    Passed,
    Failed,
    Cancelled,
}

impl TestExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestExecutionStatus::Queued => "queued",
            TestExecutionStatus::Running => "running",
            TestExecutionStatus::Passed => "passed",
            TestExecutionStatus::Failed => "failed",
            TestExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TestExecutionStatus::Passed
                | TestExecutionStatus::Failed
                | TestExecutionStatus::Cancelled
        )
    }
}

impl fmt::Display for TestExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one suite
///
/// `Error` covers runs that never produced a verdict: timeouts, spawn
/// failures, a crashed runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestSuiteStatus {
    Passed,
    Failed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSuiteResult {
    pub suite_name: String,
    pub status: TestSuiteStatus,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    /// Attempts made, including retries
    pub attempts: u32,
    pub duration_ms: u64,
    pub output: String,
    pub error: Option<String>,
    pub started_at: UtcDateTime,
}

impl TestSuiteResult {
    pub fn passed(&self) -> bool {
        self.status == TestSuiteStatus::Passed
    }
}

/// Totals across all suite results of an execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCounts {
    pub total_suites: u32,
    pub passed_suites: u32,
    pub failed_suites: u32,
    pub tests_passed: u32,
    pub tests_failed: u32,
    pub tests_skipped: u32,
}

impl TestCounts {
    pub fn from_results(results: &[TestSuiteResult]) -> Self {
        results.iter().fold(Self::default(), |mut counts, result| {
            counts.total_suites += 1;
            if result.passed() {
                counts.passed_suites += 1;
            } else {
                counts.failed_suites += 1;
            }
            counts.tests_passed += result.passed;
            counts.tests_failed += result.failed;
            counts.tests_skipped += result.skipped;
            counts
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestExecution {
    pub id: String,
    pub project_id: String,
    pub trigger_type: TriggerType,
    pub trigger_context: TestTriggerContext,
    /// Copied from the context so history can be filtered by PR
    pub pull_request: Option<u64>,
    pub test_suites: Vec<TestSuiteConfig>,
    pub parallel_execution: bool,
    /// Zero falls back to the configured default
    #[serde(default)]
    pub max_concurrent_suites: usize,
    pub status: TestExecutionStatus,
    pub suite_results: Vec<TestSuiteResult>,
    pub counts: TestCounts,
    pub created_at: UtcDateTime,
    pub started_at: Option<UtcDateTime>,
    pub completed_at: Option<UtcDateTime>,
}

impl Record for TestExecution {
    const KIND: &'static str = "TestExecution";

    fn id(&self) -> &str {
        &self.id
    }
}

impl TestExecution {
    /// Suites that were selected but have no result
    pub fn skipped_suites(&self) -> Vec<&str> {
        self.test_suites
            .iter()
            .filter(|suite| !self.suite_results.iter().any(|r| r.suite_name == suite.name))
            .map(|suite| suite.name.as_str())
            .collect()
    }
}
