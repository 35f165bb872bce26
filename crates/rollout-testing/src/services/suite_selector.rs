//! Changed-file based suite selection

use glob::{MatchOptions, Pattern};
use tracing::{debug, info};

use crate::services::test_scheduler::TestSchedulerError;
use crate::services::types::TestSuiteConfig;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Compile a suite's path patterns
pub fn compile_patterns(suite: &TestSuiteConfig) -> Result<Vec<Pattern>, TestSchedulerError> {
    suite
        .path_patterns
        .iter()
        .map(|pattern| {
            Pattern::new(pattern).map_err(|e| TestSchedulerError::InvalidPattern {
                suite: suite.name.clone(),
                pattern: pattern.clone(),
                message: e.msg.to_string(),
            })
        })
        .collect()
}

/// Whether any changed path matches one of the patterns
fn matches_any(patterns: &[Pattern], changed_files: &[String]) -> bool {
    changed_files.iter().any(|file| {
        let path = file.trim_start_matches("./");
        patterns
            .iter()
            .any(|pattern| pattern.matches_with(path, MATCH_OPTIONS))
    })
}

/// Pick the suites a change set needs
///
/// Suites without patterns always run. A scoped suite runs when a changed
/// path matches one of its patterns. When the change set is unknown, or no
/// scoped suite matched, every suite runs: testing is never skipped because
/// the patterns missed a file.
pub fn select_suites(
    suites: &[TestSuiteConfig],
    changed_files: Option<&[String]>,
) -> Result<Vec<TestSuiteConfig>, TestSchedulerError> {
    let changed_files = match changed_files {
        Some(files) if !files.is_empty() => files,
        _ => {
            debug!("No change set supplied, selecting all {} suites", suites.len());
            return Ok(suites.to_vec());
        }
    };

    let mut selected = Vec::new();
    let mut scoped_match = false;
    for suite in suites {
        let patterns = compile_patterns(suite)?;
        if patterns.is_empty() {
            selected.push(suite.clone());
        } else if matches_any(&patterns, changed_files) {
            scoped_match = true;
            selected.push(suite.clone());
        }
    }

    if !scoped_match {
        info!(
            "🧪 No suite pattern matched {} changed file(s), running all {} suites",
            changed_files.len(),
            suites.len()
        );
        return Ok(suites.to_vec());
    }

    debug!(
        "Selected {} of {} suites for {} changed file(s)",
        selected.len(),
        suites.len(),
        changed_files.len()
    );
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suites() -> Vec<TestSuiteConfig> {
        vec![
            TestSuiteConfig::new("lib", "cargo test --lib").with_patterns(["lib/**"]),
            TestSuiteConfig::new("api", "cargo test -p api").with_patterns(["api/**/*.rs"]),
            TestSuiteConfig::new("web", "npm test").with_patterns(["web/**", "package.json"]),
        ]
    }

    fn names(selected: &[TestSuiteConfig]) -> Vec<&str> {
        selected.iter().map(|s| s.name.as_str()).collect()
    }

    fn files(paths: &[&str]) -> Vec<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_matching_suites_only() {
        let changed = files(&["lib/parser/mod.rs", "api/src/routes.rs"]);
        let selected = select_suites(&suites(), Some(&changed)).unwrap();
        assert_eq!(names(&selected), vec!["lib", "api"]);
    }

    #[test]
    fn test_unmatched_change_runs_everything() {
        let changed = files(&["docs/readme.md"]);
        let selected = select_suites(&suites(), Some(&changed)).unwrap();
        assert_eq!(names(&selected), vec!["lib", "api", "web"]);
    }

    #[test]
    fn test_missing_change_set_runs_everything() {
        assert_eq!(select_suites(&suites(), None).unwrap().len(), 3);
        assert_eq!(select_suites(&suites(), Some(&[])).unwrap().len(), 3);
    }

    #[test]
    fn test_unscoped_suite_always_runs() {
        let mut all = suites();
        all.push(TestSuiteConfig::new("smoke", "./smoke.sh"));
        let changed = files(&["./package.json"]);
        let selected = select_suites(&all, Some(&changed)).unwrap();
        assert_eq!(names(&selected), vec!["web", "smoke"]);
    }

    #[test]
    fn test_single_star_does_not_cross_directories() {
        let all = vec![TestSuiteConfig::new("top", "true").with_patterns(["src/*.rs"])];
        let nested = files(&["src/deep/mod.rs"]);
        let other = vec![TestSuiteConfig::new("deep", "true").with_patterns(["src/deep/**"])];
        let mut both = all.clone();
        both.extend(other);

        let selected = select_suites(&both, Some(&nested)).unwrap();
        assert_eq!(names(&selected), vec!["deep"]);
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let bad = vec![TestSuiteConfig::new("bad", "true").with_patterns(["src/[.rs"])];
        let err = select_suites(&bad, Some(&files(&["src/a.rs"]))).unwrap_err();
        assert!(matches!(err, TestSchedulerError::InvalidPattern { .. }));
    }
}
