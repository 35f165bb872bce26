//! Test utilities: a scripted suite runner that tracks concurrency

use async_trait::async_trait;
use rollout_core::{InMemoryRecordStore, TestingSettings};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::services::{
    SuiteRunError, SuiteRunOutput, SuiteRunner, TestScheduler, TestSuiteConfig,
    TestTriggerContext,
};

/// Scripted behaviour of one suite
#[derive(Debug, Clone)]
pub enum SuiteScript {
    Pass,
    Fail,
    Error(String),
    /// Fail this many attempts, then pass
    Flaky(u32),
    /// Block until [`ScriptedSuiteRunner::release`] is called
    WaitForRelease,
    Hang,
}

/// Suite runner with scripted outcomes
///
/// Every run sleeps for the configured delay while counted as running, so
/// tests can observe the peak number of suites running at once.
pub struct ScriptedSuiteRunner {
    scripts: HashMap<String, SuiteScript>,
    delay: Duration,
    running: AtomicUsize,
    peak: AtomicUsize,
    attempts: Mutex<Vec<String>>,
    released: AtomicBool,
}

impl Default for ScriptedSuiteRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedSuiteRunner {
    pub fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            delay: Duration::from_millis(5),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            attempts: Mutex::new(Vec::new()),
            released: AtomicBool::new(false),
        }
    }

    pub fn with_script(mut self, suite: &str, script: SuiteScript) -> Self {
        self.scripts.insert(suite.to_string(), script);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Highest number of suites seen running at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Suite names in the order attempts started
    pub async fn attempts(&self) -> Vec<String> {
        self.attempts.lock().await.clone()
    }

    /// Let every suite waiting on release finish
    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    async fn outcome(
        &self,
        suite: &TestSuiteConfig,
        attempt: u32,
    ) -> Result<SuiteRunOutput, SuiteRunError> {
        match self.scripts.get(&suite.name) {
            None | Some(SuiteScript::Pass) => Ok(SuiteRunOutput::passed(3)),
            Some(SuiteScript::Fail) => Ok(SuiteRunOutput::failed(2, 1)),
            Some(SuiteScript::Error(message)) => Err(SuiteRunError::Execution {
                suite: suite.name.clone(),
                message: message.clone(),
            }),
            Some(SuiteScript::Flaky(failures)) if attempt <= *failures => {
                Ok(SuiteRunOutput::failed(2, 1))
            }
            Some(SuiteScript::Flaky(_)) => Ok(SuiteRunOutput::passed(3)),
            Some(SuiteScript::WaitForRelease) => {
                while !self.released.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                Ok(SuiteRunOutput::passed(3))
            }
            Some(SuiteScript::Hang) => {
                std::future::pending::<()>().await;
                Ok(SuiteRunOutput::default())
            }
        }
    }
}

#[async_trait]
impl SuiteRunner for ScriptedSuiteRunner {
    async fn run_suite(
        &self,
        suite: &TestSuiteConfig,
        _context: &TestTriggerContext,
    ) -> Result<SuiteRunOutput, SuiteRunError> {
        let attempt = {
            let mut attempts = self.attempts.lock().await;
            attempts.push(suite.name.clone());
            attempts.iter().filter(|name| **name == suite.name).count() as u32
        };

        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_running, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let outcome = self.outcome(suite, attempt).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

/// Scheduler over an in-memory history store
pub fn scheduler_with(runner: Arc<ScriptedSuiteRunner>) -> TestScheduler {
    TestScheduler::new(
        InMemoryRecordStore::new_arc(),
        runner,
        TestingSettings::default(),
    )
}
