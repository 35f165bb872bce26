//! Select Tests Command
//!
//! Show which suites of a trigger configuration a change set selects, and
//! optionally run them through the scheduler.

use anyhow::Context;
use clap::Args;
use colored::Colorize;
use rollout_core::{InMemoryRecordStore, OrchestratorSettings};
use rollout_testing::{
    select_suites, ShellSuiteRunner, TestExecutionStatus, TestScheduler, TestTriggerConfig,
    TestTriggerContext,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Args)]
pub struct SelectTestsCommand {
    /// Trigger configuration file (YAML or JSON)
    #[arg(short, long)]
    file: PathBuf,

    /// Changed file path; repeat for each file. All suites run when omitted.
    #[arg(short, long = "changed")]
    changed: Vec<String>,

    /// Run the selected suites instead of only listing them
    #[arg(long)]
    run: bool,
}

impl SelectTestsCommand {
    pub fn execute(self, settings: &OrchestratorSettings) -> anyhow::Result<()> {
        let config = load_trigger_config(&self.file)?;
        let changed = (!self.changed.is_empty()).then_some(self.changed.as_slice());
        let selected = select_suites(&config.suites, changed)?;

        println!();
        println!(
            "{} {} of {} suite(s) selected for {}",
            "🧪".bright_white(),
            selected.len().to_string().bright_white().bold(),
            config.suites.len(),
            config.project_id.bright_white()
        );
        for suite in &config.suites {
            let marker = if selected.iter().any(|s| s.name == suite.name) {
                "●".bright_green()
            } else {
                "○".dimmed()
            };
            println!("  {} {:<24} {}", marker, suite.name, suite.command.dimmed());
        }
        println!();

        if !self.run {
            return Ok(());
        }

        let project_id = config.project_id.clone();
        let context = TestTriggerContext::manual("cli").with_changed_files(self.changed);
        let rt = tokio::runtime::Runtime::new()?;
        let execution = rt.block_on(async {
            let scheduler = TestScheduler::new(
                InMemoryRecordStore::new_arc(),
                Arc::new(ShellSuiteRunner::default()),
                settings.testing.clone(),
            );
            scheduler.register_config(config).await?;
            scheduler.trigger(&project_id, context).await
        })?;

        for result in &execution.suite_results {
            let status = if result.passed() {
                "passed".bright_green()
            } else {
                "failed".bright_red()
            };
            println!(
                "  {:<24} {} ({} passed, {} failed, {} skipped, {} attempt(s), {} ms)",
                result.suite_name,
                status,
                result.passed,
                result.failed,
                result.skipped,
                result.attempts,
                result.duration_ms
            );
        }
        println!();

        if execution.status != TestExecutionStatus::Passed {
            anyhow::bail!("test execution {} {}", execution.id, execution.status);
        }
        Ok(())
    }
}

fn load_trigger_config(path: &Path) -> anyhow::Result<TestTriggerConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let config = if is_json {
        serde_json::from_str(&content)?
    } else {
        serde_yaml::from_str(&content)?
    };
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_yaml_trigger_config() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "project_id: web-app\n\
             parallel_execution: true\n\
             pre_merge_required: true\n\
             suites:\n\
             \x20 - name: unit\n\
             \x20   command: cargo test\n\
             \x20   path_patterns: [\"src/**\"]\n"
        )
        .unwrap();

        let config = load_trigger_config(file.path()).unwrap();
        assert_eq!(config.project_id, "web-app");
        assert_eq!(config.suites.len(), 1);
        assert_eq!(config.suites[0].path_patterns, vec!["src/**"]);
        assert_eq!(config.suites[0].timeout_secs, 600);
    }
}
