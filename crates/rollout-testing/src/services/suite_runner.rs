//! Suite runner port and the shell implementation

use async_trait::async_trait;
use regex::Regex;
use rollout_core::{CommandError, ShellCommandRunner};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::debug;

use crate::services::types::{TestSuiteConfig, TestTriggerContext};

#[derive(Error, Debug, Clone)]
pub enum SuiteRunError {
    #[error("Suite '{suite}' timed out after {timeout_secs}s")]
    Timeout { suite: String, timeout_secs: u64 },

    #[error("Suite '{suite}' could not run: {message}")]
    Execution { suite: String, message: String },
}

/// What a finished suite run reported
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuiteRunOutput {
    pub success: bool,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub output: String,
}

impl SuiteRunOutput {
    pub fn passed(passed: u32) -> Self {
        Self {
            success: true,
            passed,
            ..Default::default()
        }
    }

    pub fn failed(passed: u32, failed: u32) -> Self {
        Self {
            success: false,
            passed,
            failed,
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait SuiteRunner: Send + Sync {
    /// Run one attempt of a suite
    ///
    /// A suite that ran and had failing tests is `Ok` with `success == false`;
    /// `Err` is reserved for runs that produced no verdict.
    async fn run_suite(
        &self,
        suite: &TestSuiteConfig,
        context: &TestTriggerContext,
    ) -> Result<SuiteRunOutput, SuiteRunError>;
}

/// Pass/fail/skip totals found in runner output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParsedCounts {
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
}

fn count_regex() -> &'static Regex {
    static COUNT_RE: OnceLock<Regex> = OnceLock::new();
    COUNT_RE.get_or_init(|| {
        Regex::new(r"(?i)\b(\d+)\s+(passed|passing|failed|failing|skipped|ignored|pending)\b")
            .unwrap_or_else(|e| panic!("count pattern is valid: {}", e))
    })
}

/// Jest also totals suites and snapshots; only its `Tests:` line counts tests
const NON_TEST_SUMMARIES: [&str; 2] = ["Test Suites:", "Snapshots:"];

/// Sum the counts of every runner summary line in `output`
///
/// Understands the common shapes: `5 passed; 1 failed; 2 ignored` (cargo),
/// `Tests: 1 failed, 5 passed` (jest), `5 passed, 1 skipped in 0.3s` (pytest)
/// and `5 passing` / `1 failing` (mocha). Totals saturate at `u32::MAX`.
pub fn parse_test_counts(output: &str) -> ParsedCounts {
    let mut counts = ParsedCounts::default();
    let lines = output.lines().filter(|line| {
        let line = line.trim_start();
        !NON_TEST_SUMMARIES.iter().any(|prefix| line.starts_with(prefix))
    });
    for line in lines {
        for captures in count_regex().captures_iter(line) {
            // Only digits reach here, so a parse failure means overflow
            let value: u32 = captures[1].parse().unwrap_or(u32::MAX);
            let total = match captures[2].to_lowercase().as_str() {
                "passed" | "passing" => &mut counts.passed,
                "failed" | "failing" => &mut counts.failed,
                _ => &mut counts.skipped,
            };
            *total = total.saturating_add(value);
        }
    }
    counts
}

/// Runs a suite's command through the shell
///
/// Trigger details reach the command as `ROLLOUT_*` environment variables.
#[derive(Debug, Clone, Default)]
pub struct ShellSuiteRunner {
    runner: ShellCommandRunner,
}

impl ShellSuiteRunner {
    pub fn new(runner: ShellCommandRunner) -> Self {
        Self { runner }
    }

    fn runner_for(&self, context: &TestTriggerContext) -> ShellCommandRunner {
        let mut runner = self
            .runner
            .clone()
            .with_env("ROLLOUT_TRIGGER", context.trigger_type.as_str());
        if let Some(ref branch) = context.branch {
            runner = runner.with_env("ROLLOUT_BRANCH", branch);
        }
        if let Some(ref sha) = context.commit_sha {
            runner = runner.with_env("ROLLOUT_COMMIT", sha);
        }
        if let Some(number) = context.pull_request {
            runner = runner.with_env("ROLLOUT_PULL_REQUEST", number.to_string());
        }
        runner
    }
}

#[async_trait]
impl SuiteRunner for ShellSuiteRunner {
    async fn run_suite(
        &self,
        suite: &TestSuiteConfig,
        context: &TestTriggerContext,
    ) -> Result<SuiteRunOutput, SuiteRunError> {
        let output = self
            .runner_for(context)
            .run(&suite.command, suite.timeout())
            .await
            .map_err(|e| match e {
                CommandError::Timeout { timeout_secs, .. } => SuiteRunError::Timeout {
                    suite: suite.name.clone(),
                    timeout_secs,
                },
                other => SuiteRunError::Execution {
                    suite: suite.name.clone(),
                    message: other.to_string(),
                },
            })?;

        let combined = output.combined();
        let counts = parse_test_counts(&combined);
        debug!(
            "Suite '{}' exited with {:?} ({} passed, {} failed)",
            suite.name, output.exit_code, counts.passed, counts.failed
        );
        Ok(SuiteRunOutput {
            success: output.success(),
            passed: counts.passed,
            failed: counts.failed,
            skipped: counts.skipped,
            output: combined,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_cargo_summary() {
        let output = "test result: ok. 12 passed; 0 failed; 2 ignored; 0 measured\n\
                      test result: FAILED. 3 passed; 1 failed; 0 ignored";
        assert_eq!(
            parse_test_counts(output),
            ParsedCounts {
                passed: 15,
                failed: 1,
                skipped: 2
            }
        );
    }

    #[test]
    fn test_parse_jest_and_pytest_summaries() {
        let jest = "Tests:       1 failed, 5 passed, 6 total";
        assert_eq!(
            parse_test_counts(jest),
            ParsedCounts {
                passed: 5,
                failed: 1,
                skipped: 0
            }
        );

        let full_jest = "PASS src/cart.test.js\n\
                         FAIL src/checkout.test.js\n\
                         Test Suites: 1 failed, 2 passed, 3 total\n\
                         Tests:       1 failed, 5 passed, 6 total\n\
                         Snapshots:   0 failed, 4 passed, 4 total\n\
                         Time:        2.31 s";
        assert_eq!(
            parse_test_counts(full_jest),
            ParsedCounts {
                passed: 5,
                failed: 1,
                skipped: 0
            }
        );

        let pytest = "==== 8 passed, 3 skipped in 0.42s ====";
        assert_eq!(parse_test_counts(pytest).skipped, 3);
        assert_eq!(parse_test_counts("no summary here"), ParsedCounts::default());
    }

    #[test]
    fn test_parse_counts_saturate() {
        let counts = parse_test_counts("4294967295 passed\n1 passed\n99999999999 failed");
        assert_eq!(counts.passed, u32::MAX);
        assert_eq!(counts.failed, u32::MAX);
    }

    #[tokio::test]
    async fn test_shell_runner_reports_counts_and_exit() {
        let runner = ShellSuiteRunner::default();
        let suite = TestSuiteConfig::new("unit", "echo '4 passed, 1 failed' && exit 1");
        let output = runner
            .run_suite(&suite, &TestTriggerContext::manual("ci"))
            .await
            .unwrap();
        assert!(!output.success);
        assert_eq!(output.passed, 4);
        assert_eq!(output.failed, 1);
    }

    #[tokio::test]
    async fn test_shell_runner_exposes_trigger_env() {
        let runner = ShellSuiteRunner::default();
        let suite = TestSuiteConfig::new("env", "echo $ROLLOUT_TRIGGER-$ROLLOUT_PULL_REQUEST");
        let output = runner
            .run_suite(&suite, &TestTriggerContext::pull_request(42, "feature/x"))
            .await
            .unwrap();
        assert!(output.success);
        assert_eq!(output.output, "pull_request-42");
    }

    #[tokio::test]
    async fn test_shell_runner_timeout() {
        let runner = ShellSuiteRunner::default();
        let suite =
            TestSuiteConfig::new("slow", "sleep 5").with_timeout(Duration::from_secs(1));
        let err = runner
            .run_suite(&suite, &TestTriggerContext::scheduled())
            .await
            .unwrap_err();
        assert!(matches!(err, SuiteRunError::Timeout { .. }));
    }
}
