//! Test Trigger & Scheduler
//!
//! Executions are persisted through the record store so the pre-merge check
//! can read history back. Parallel executions cap concurrently running
//! suites with a semaphore; sequential executions honour `fail_fast`.

use chrono::Utc;
use cron::Schedule;
use futures::future::join_all;
use rollout_core::{
    new_id, RecordFilter, RecordLocks, RecordStore, ServiceError, StoreError, TestingSettings,
    UtcDateTime,
};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::services::suite_runner::{SuiteRunError, SuiteRunner};
use crate::services::suite_selector::{compile_patterns, select_suites};
use crate::services::types::{
    TestCounts, TestExecution, TestExecutionStatus, TestSuiteConfig, TestSuiteResult,
    TestSuiteStatus, TestTriggerConfig, TestTriggerContext, TriggerType,
};

#[derive(Error, Debug)]
pub enum TestSchedulerError {
    #[error("No test configuration registered for project '{0}'")]
    ConfigNotFound(String),

    #[error("Invalid test configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid path pattern '{pattern}' in suite '{suite}': {message}")]
    InvalidPattern {
        suite: String,
        pattern: String,
        message: String,
    },

    #[error("Invalid schedule '{expression}': {message}")]
    InvalidSchedule { expression: String, message: String },

    #[error("Project '{0}' has no schedule")]
    NoSchedule(String),

    #[error("Test execution '{0}' not found")]
    ExecutionNotFound(String),

    #[error("Test execution '{id}' is already {status}")]
    NotCancellable {
        id: String,
        status: TestExecutionStatus,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<TestSchedulerError> for ServiceError {
    fn from(err: TestSchedulerError) -> Self {
        match err {
            TestSchedulerError::ConfigNotFound(_) | TestSchedulerError::ExecutionNotFound(_) => {
                ServiceError::NotFound {
                    resource: err.to_string(),
                }
            }
            TestSchedulerError::NotCancellable { .. } => ServiceError::Conflict {
                message: err.to_string(),
            },
            TestSchedulerError::Store(e) => e.into(),
            other => ServiceError::Validation {
                message: other.to_string(),
            },
        }
    }
}

/// Parse a cron expression the way schedules are stored
pub fn parse_schedule(expression: &str) -> Result<Schedule, TestSchedulerError> {
    Schedule::from_str(expression).map_err(|e| TestSchedulerError::InvalidSchedule {
        expression: expression.to_string(),
        message: e.to_string(),
    })
}

/// Reject configurations the scheduler could not run
pub fn validate_config(config: &TestTriggerConfig) -> Result<(), TestSchedulerError> {
    if config.project_id.trim().is_empty() {
        return Err(TestSchedulerError::InvalidConfig(
            "project id is empty".to_string(),
        ));
    }
    if config.suites.is_empty() {
        return Err(TestSchedulerError::InvalidConfig(format!(
            "project '{}' has no test suites",
            config.project_id
        )));
    }
    let mut names = HashSet::new();
    for suite in &config.suites {
        if suite.name.trim().is_empty() || suite.command.trim().is_empty() {
            return Err(TestSchedulerError::InvalidConfig(format!(
                "suite '{}' needs a name and a command",
                suite.name
            )));
        }
        if !names.insert(suite.name.as_str()) {
            return Err(TestSchedulerError::InvalidConfig(format!(
                "duplicate suite name '{}'",
                suite.name
            )));
        }
        compile_patterns(suite)?;
    }

    if let Some(ref expression) = config.schedule {
        parse_schedule(expression)?;
    }
    Ok(())
}

/// Run one suite, retrying failed attempts up to its `retry_count`
///
/// Every attempt is bounded by the suite timeout, so a runner that never
/// returns still yields an `Error` result.
pub async fn run_suite_with_retries(
    runner: &dyn SuiteRunner,
    suite: &TestSuiteConfig,
    context: &TestTriggerContext,
) -> TestSuiteResult {
    let started_at = Utc::now();
    let timer = Instant::now();
    let max_attempts = suite.retry_count.saturating_add(1);
    let mut attempts = 0;

    loop {
        attempts += 1;
        debug!(
            "Running suite '{}' (attempt {}/{})",
            suite.name, attempts, max_attempts
        );

        let outcome = match tokio::time::timeout(suite.timeout(), runner.run_suite(suite, context))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(SuiteRunError::Timeout {
                suite: suite.name.clone(),
                timeout_secs: suite.timeout().as_secs(),
            }),
        };

        let mut result = TestSuiteResult {
            suite_name: suite.name.clone(),
            status: TestSuiteStatus::Error,
            passed: 0,
            failed: 0,
            skipped: 0,
            attempts,
            duration_ms: 0,
            output: String::new(),
            error: None,
            started_at,
        };
        match outcome {
            Ok(output) => {
                result.status = if output.success {
                    TestSuiteStatus::Passed
                } else {
                    TestSuiteStatus::Failed
                };
                result.passed = output.passed;
                result.failed = output.failed;
                result.skipped = output.skipped;
                result.output = output.output;
                if !output.success {
                    result.error = Some(format!(
                        "Suite '{}' failed with {} failing test(s)",
                        suite.name, output.failed
                    ));
                }
            }
            Err(e) => result.error = Some(e.to_string()),
        }

        if result.passed() || attempts >= max_attempts {
            result.duration_ms = timer.elapsed().as_millis() as u64;
            return result;
        }
        warn!(
            "🔁 Suite '{}' attempt {}/{} failed, retrying",
            suite.name, attempts, max_attempts
        );
    }
}

/// Selects, runs and records test executions
pub struct TestScheduler {
    configs: RwLock<HashMap<String, TestTriggerConfig>>,
    executions: Arc<dyn RecordStore<TestExecution>>,
    runner: Arc<dyn SuiteRunner>,
    settings: TestingSettings,
    cancellations: RwLock<HashMap<String, CancellationToken>>,
    /// Status transitions of one execution never interleave
    locks: RecordLocks,
}

impl TestScheduler {
    pub fn new(
        executions: Arc<dyn RecordStore<TestExecution>>,
        runner: Arc<dyn SuiteRunner>,
        settings: TestingSettings,
    ) -> Self {
        Self {
            configs: RwLock::new(HashMap::new()),
            executions,
            runner,
            settings,
            cancellations: RwLock::new(HashMap::new()),
            locks: RecordLocks::new(),
        }
    }

    /// Register or replace a project's trigger configuration
    pub async fn register_config(
        &self,
        config: TestTriggerConfig,
    ) -> Result<(), TestSchedulerError> {
        validate_config(&config)?;
        info!(
            "🧪 Registered {} suite(s) for project {}",
            config.suites.len(),
            config.project_id
        );
        self.configs
            .write()
            .await
            .insert(config.project_id.clone(), config);
        Ok(())
    }

    pub async fn get_config(&self, project_id: &str) -> Result<TestTriggerConfig, TestSchedulerError> {
        self.configs
            .read()
            .await
            .get(project_id)
            .cloned()
            .ok_or_else(|| TestSchedulerError::ConfigNotFound(project_id.to_string()))
    }

    /// Suites a trigger would run for a project
    pub async fn select_suites(
        &self,
        project_id: &str,
        context: &TestTriggerContext,
    ) -> Result<Vec<TestSuiteConfig>, TestSchedulerError> {
        let config = self.get_config(project_id).await?;
        select_suites(&config.suites, context.changed_files.as_deref())
    }

    /// Select suites and record a queued execution without running it
    pub async fn enqueue(
        &self,
        project_id: &str,
        context: TestTriggerContext,
    ) -> Result<TestExecution, TestSchedulerError> {
        let config = self.get_config(project_id).await?;
        let suites = select_suites(&config.suites, context.changed_files.as_deref())?;
        let max_concurrent_suites = if config.max_concurrent_suites == 0 {
            self.settings.default_max_concurrent_suites.max(1)
        } else {
            config.max_concurrent_suites
        };

        let execution = TestExecution {
            id: new_id(),
            project_id: project_id.to_string(),
            trigger_type: context.trigger_type,
            pull_request: context.pull_request,
            trigger_context: context,
            test_suites: suites,
            parallel_execution: config.parallel_execution,
            max_concurrent_suites,
            status: TestExecutionStatus::Queued,
            suite_results: Vec::new(),
            counts: TestCounts::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        let execution = self.executions.create(execution).await?;
        self.cancellations
            .write()
            .await
            .insert(execution.id.clone(), CancellationToken::new());

        info!(
            "📋 Queued test execution {} for {} ({} trigger, {} suite(s))",
            execution.id,
            project_id,
            execution.trigger_type,
            execution.test_suites.len()
        );
        Ok(execution)
    }

    /// Enqueue and run to completion
    pub async fn trigger(
        &self,
        project_id: &str,
        context: TestTriggerContext,
    ) -> Result<TestExecution, TestSchedulerError> {
        let execution = self.enqueue(project_id, context).await?;
        self.run_execution(&execution.id).await
    }

    /// Run a queued execution; anything not queued is returned unchanged
    pub async fn run_execution(&self, execution_id: &str) -> Result<TestExecution, TestSchedulerError> {
        let (mut execution, token) = {
            let _guard = self.locks.lock(execution_id).await;
            let mut execution = self.require(execution_id).await?;
            if execution.status != TestExecutionStatus::Queued {
                return Ok(execution);
            }
            execution.status = TestExecutionStatus::Running;
            execution.started_at = Some(Utc::now());
            let execution = self.executions.update(execution).await?;
            (execution, self.token_for(execution_id).await)
        };
        info!(
            "▶️ Running test execution {} ({} mode)",
            execution.id,
            if execution.parallel_execution {
                "parallel"
            } else {
                "sequential"
            }
        );

        let results = if execution.parallel_execution {
            self.run_parallel(&execution, &token).await
        } else {
            self.run_sequential(&execution, &token).await
        };

        execution.counts = TestCounts::from_results(&results);
        let execution = {
            // A cancel that lands before this lock is reflected in the status
            let _guard = self.locks.lock(execution_id).await;
            execution.status = if token.is_cancelled() {
                TestExecutionStatus::Cancelled
            } else if !results.is_empty() && results.iter().all(|r| r.passed()) {
                TestExecutionStatus::Passed
            } else {
                TestExecutionStatus::Failed
            };
            execution.suite_results = results;
            execution.completed_at = Some(Utc::now());
            self.executions.update(execution).await?
        };
        self.cancellations.write().await.remove(execution_id);

        match execution.status {
            TestExecutionStatus::Passed => info!(
                "✅ Test execution {} passed ({} suite(s))",
                execution.id, execution.counts.total_suites
            ),
            TestExecutionStatus::Cancelled => warn!(
                "🛑 Test execution {} cancelled after {} suite(s)",
                execution.id, execution.counts.total_suites
            ),
            _ => warn!(
                "❌ Test execution {} failed: {} of {} suite(s) did not pass",
                execution.id, execution.counts.failed_suites, execution.counts.total_suites
            ),
        }

        self.prune_history(&execution.project_id).await;
        Ok(execution)
    }

    async fn run_sequential(
        &self,
        execution: &TestExecution,
        token: &CancellationToken,
    ) -> Vec<TestSuiteResult> {
        let mut results = Vec::with_capacity(execution.test_suites.len());
        for suite in &execution.test_suites {
            if token.is_cancelled() {
                info!("🛑 Execution {} cancelled before suite '{}'", execution.id, suite.name);
                break;
            }

            let result =
                run_suite_with_retries(self.runner.as_ref(), suite, &execution.trigger_context)
                    .await;
            let halt = !result.passed() && suite.fail_fast;
            results.push(result);

            if halt {
                warn!(
                    "⏹️ Suite '{}' failed with fail_fast set, skipping remaining suites",
                    suite.name
                );
                break;
            }
        }
        results
    }

    async fn run_parallel(
        &self,
        execution: &TestExecution,
        token: &CancellationToken,
    ) -> Vec<TestSuiteResult> {
        let semaphore = Arc::new(Semaphore::new(execution.max_concurrent_suites.max(1)));
        let mut tasks = Vec::with_capacity(execution.test_suites.len());

        for suite in execution.test_suites.clone() {
            let semaphore = semaphore.clone();
            let runner = self.runner.clone();
            let context = execution.trigger_context.clone();
            let token = token.clone();

            tasks.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return None,
                };
                if token.is_cancelled() {
                    return None;
                }
                Some(run_suite_with_retries(runner.as_ref(), &suite, &context).await)
            }));
        }

        let mut results = Vec::new();
        for (suite, joined) in execution.test_suites.iter().zip(join_all(tasks).await) {
            match joined {
                Ok(Some(result)) => results.push(result),
                Ok(None) => debug!("Suite '{}' not started", suite.name),
                Err(e) => {
                    error!("Suite '{}' task failed: {}", suite.name, e);
                    results.push(TestSuiteResult {
                        suite_name: suite.name.clone(),
                        status: TestSuiteStatus::Error,
                        passed: 0,
                        failed: 0,
                        skipped: 0,
                        attempts: 1,
                        duration_ms: 0,
                        output: String::new(),
                        error: Some(format!("Suite task failed: {}", e)),
                        started_at: Utc::now(),
                    });
                }
            }
        }
        results
    }

    async fn token_for(&self, execution_id: &str) -> CancellationToken {
        self.cancellations
            .write()
            .await
            .entry(execution_id.to_string())
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Cancel a queued or running execution
    ///
    /// Queued executions are cancelled at once. Running ones stop before the
    /// next suite starts; suites already running finish.
    pub async fn cancel(&self, execution_id: &str) -> Result<TestExecution, TestSchedulerError> {
        let _guard = self.locks.lock(execution_id).await;
        let mut execution = self.require(execution_id).await?;
        if execution.status.is_terminal() {
            return Err(TestSchedulerError::NotCancellable {
                id: execution.id,
                status: execution.status,
            });
        }

        self.token_for(execution_id).await.cancel();
        if execution.status == TestExecutionStatus::Queued {
            execution.status = TestExecutionStatus::Cancelled;
            execution.completed_at = Some(Utc::now());
            execution = self.executions.update(execution).await?;
            self.cancellations.write().await.remove(execution_id);
        }
        info!("🛑 Cancellation requested for test execution {}", execution_id);
        Ok(execution)
    }

    pub async fn get_execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<TestExecution>, TestSchedulerError> {
        Ok(self.executions.get(execution_id).await?)
    }

    async fn require(&self, execution_id: &str) -> Result<TestExecution, TestSchedulerError> {
        self.executions
            .get(execution_id)
            .await?
            .ok_or_else(|| TestSchedulerError::ExecutionNotFound(execution_id.to_string()))
    }

    /// Executions for a project, newest first
    pub async fn history(&self, project_id: &str) -> Result<Vec<TestExecution>, TestSchedulerError> {
        let mut executions = self
            .executions
            .list(&RecordFilter::new().eq("project_id", project_id))
            .await?;
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(executions)
    }

    /// Drop the oldest finished executions beyond the history limit
    async fn prune_history(&self, project_id: &str) {
        let history = match self.history(project_id).await {
            Ok(history) => history,
            Err(e) => {
                warn!("Failed to load test history for {}: {}", project_id, e);
                return;
            }
        };
        for stale in history
            .iter()
            .skip(self.settings.history_limit)
            .filter(|execution| execution.status.is_terminal())
        {
            if let Err(e) = self.executions.delete(&stale.id).await {
                warn!("Failed to prune test execution {}: {}", stale.id, e);
            }
        }
    }

    /// Whether a pull request may merge
    ///
    /// True when the project does not require pre-merge testing; otherwise
    /// only when the most recent PR-triggered execution for that PR passed.
    pub async fn is_pre_merge_passed(
        &self,
        project_id: &str,
        pull_request: u64,
    ) -> Result<bool, TestSchedulerError> {
        let required = self
            .configs
            .read()
            .await
            .get(project_id)
            .map(|config| config.pre_merge_required)
            .unwrap_or(false);
        if !required {
            return Ok(true);
        }

        let latest = self
            .executions
            .list(
                &RecordFilter::new()
                    .eq("project_id", project_id)
                    .eq("trigger_type", TriggerType::PullRequest)
                    .eq("pull_request", pull_request),
            )
            .await?
            .into_iter()
            .max_by_key(|execution| execution.created_at);

        Ok(matches!(
            latest,
            Some(TestExecution {
                status: TestExecutionStatus::Passed,
                ..
            })
        ))
    }

    /// Next time a project's schedule fires
    pub async fn next_scheduled_run(
        &self,
        project_id: &str,
    ) -> Result<Option<UtcDateTime>, TestSchedulerError> {
        let config = self.get_config(project_id).await?;
        let expression = config
            .schedule
            .ok_or_else(|| TestSchedulerError::NoSchedule(project_id.to_string()))?;
        Ok(parse_schedule(&expression)?.upcoming(Utc).next())
    }

    /// Start a background loop triggering `scheduled` executions on the
    /// project's cron schedule until `cancellation_token` fires
    pub async fn spawn_scheduled(
        self: &Arc<Self>,
        project_id: &str,
        cancellation_token: CancellationToken,
    ) -> Result<JoinHandle<()>, TestSchedulerError> {
        let config = self.get_config(project_id).await?;
        let expression = config
            .schedule
            .ok_or_else(|| TestSchedulerError::NoSchedule(project_id.to_string()))?;
        let schedule = parse_schedule(&expression)?;

        let scheduler = Arc::clone(self);
        let project_id = project_id.to_string();
        info!("⏰ Scheduling tests for {} on '{}'", project_id, expression);

        Ok(tokio::spawn(async move {
            loop {
                let Some(next_run) = schedule.upcoming(Utc).next() else {
                    info!("Schedule for {} has no further runs", project_id);
                    return;
                };
                let wait = (next_run - Utc::now()).to_std().unwrap_or_default();

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = cancellation_token.cancelled() => {
                        info!("Test schedule for {} received cancellation signal", project_id);
                        return;
                    }
                }

                match scheduler
                    .trigger(&project_id, TestTriggerContext::scheduled())
                    .await
                {
                    Ok(execution) => debug!(
                        "Scheduled execution {} for {} finished as {}",
                        execution.id, project_id, execution.status
                    ),
                    Err(e) => error!("Scheduled test run for {} failed: {}", project_id, e),
                }
            }
        }))
    }
}
