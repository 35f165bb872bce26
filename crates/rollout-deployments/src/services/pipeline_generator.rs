//! Pipeline Config Generator
//!
//! Turns a change specification into the fixed stage sequence
//! build → test → (security-scan) → package → deploy.

use regex::{Regex, RegexBuilder};
use rollout_core::{
    new_id, Environment, PipelineConfig, PipelineSettings, PipelineStage, ServiceError,
    StageTemplate,
};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::services::types::ChangeSpecification;

#[derive(Error, Debug)]
pub enum PipelineConfigError {
    #[error("Invalid specification: {0}")]
    InvalidSpecification(String),

    #[error("Invalid security keyword list: {0}")]
    InvalidKeywords(String),
}

impl From<PipelineConfigError> for ServiceError {
    fn from(err: PipelineConfigError) -> Self {
        match err {
            PipelineConfigError::InvalidSpecification(message) => {
                ServiceError::Validation { message }
            }
            PipelineConfigError::InvalidKeywords(message) => ServiceError::Configuration { message },
        }
    }
}

pub const STAGE_BUILD: &str = "build";
pub const STAGE_TEST: &str = "test";
pub const STAGE_SECURITY_SCAN: &str = "security-scan";
pub const STAGE_PACKAGE: &str = "package";
pub const STAGE_DEPLOY: &str = "deploy";

pub struct PipelineConfigGenerator {
    settings: PipelineSettings,
    security_pattern: Option<Regex>,
}

impl PipelineConfigGenerator {
    pub fn new(settings: PipelineSettings) -> Result<Self, PipelineConfigError> {
        let keywords: Vec<String> = settings
            .security_keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(regex::escape)
            .collect();

        // Whole words only, with an optional plural: "tokens" matches, "tokenizer" does not
        let security_pattern = if keywords.is_empty() {
            None
        } else {
            let pattern = format!(r"\b(?:{})s?\b", keywords.join("|"));
            Some(
                RegexBuilder::new(&pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| PipelineConfigError::InvalidKeywords(e.to_string()))?,
            )
        };

        Ok(Self {
            settings,
            security_pattern,
        })
    }

    /// Whether the text mentions anything security relevant
    pub fn requires_security_scan(&self, text: &str) -> bool {
        self.security_pattern
            .as_ref()
            .map(|p| p.is_match(text))
            .unwrap_or(false)
    }

    pub fn generate(
        &self,
        spec: &ChangeSpecification,
    ) -> Result<PipelineConfig, PipelineConfigError> {
        let description = spec.description.trim();
        if description.is_empty() {
            return Err(PipelineConfigError::InvalidSpecification(
                "change description is empty".to_string(),
            ));
        }
        let branch = spec.branch_name.trim();
        validate_branch_name(branch)?;

        let environment = spec
            .environment_hint
            .unwrap_or(self.settings.default_environment);

        let settings = &self.settings;
        let mut stages = vec![
            self.stage(
                STAGE_BUILD,
                "Install dependencies and build",
                &settings.build,
                branch,
                environment,
            ),
            self.stage(STAGE_TEST, "Run the test suite", &settings.test, branch, environment),
        ];
        if self.requires_security_scan(description) {
            debug!("🔒 Security-relevant change detected in spec {}", spec.id);
            stages.push(self.stage(
                STAGE_SECURITY_SCAN,
                "Scan dependencies for known vulnerabilities",
                &settings.security_scan,
                branch,
                environment,
            ));
        }
        stages.push(self.stage(
            STAGE_PACKAGE,
            "Package build artifacts",
            &settings.package,
            branch,
            environment,
        ));
        stages.push(self.stage(
            STAGE_DEPLOY,
            &format!("Deploy to {}", environment),
            &settings.deploy,
            branch,
            environment,
        ));

        let config = PipelineConfig {
            id: new_id(),
            source_spec_id: spec.id.clone(),
            branch_name: branch.to_string(),
            stages,
            target_environment: environment,
            created_at: chrono::Utc::now(),
        };

        info!(
            "📋 Generated pipeline {} for branch {} → {} ({} stages)",
            config.id,
            config.branch_name,
            environment,
            config.stages.len()
        );
        Ok(config)
    }

    fn stage(
        &self,
        name: &str,
        description: &str,
        template: &StageTemplate,
        branch: &str,
        environment: Environment,
    ) -> PipelineStage {
        let slug = branch_slug(branch);
        let commands = template.commands.iter().map(|command| {
            command
                .replace("{branch_slug}", &slug)
                .replace("{branch}", branch)
                .replace("{environment}", environment.as_str())
        });
        PipelineStage::new(name, description)
            .with_commands(commands)
            .with_timeout(Duration::from_secs(template.timeout_secs))
    }
}

/// Branch name reduced to characters safe in a file name
pub fn branch_slug(branch: &str) -> String {
    branch
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '-',
        })
        .collect()
}

/// Reject names git would refuse as a ref
fn validate_branch_name(branch: &str) -> Result<(), PipelineConfigError> {
    let invalid = |reason: &str| {
        Err(PipelineConfigError::InvalidSpecification(format!(
            "branch '{}' cannot be resolved: {}",
            branch, reason
        )))
    };

    if branch.is_empty() {
        return Err(PipelineConfigError::InvalidSpecification(
            "branch name is empty".to_string(),
        ));
    }
    if branch.starts_with('-') || branch.starts_with('/') || branch.ends_with('/') {
        return invalid("leading dash or leading/trailing slash");
    }
    if branch.ends_with(".lock") || branch.ends_with('.') {
        return invalid("invalid suffix");
    }
    if branch.contains("..") || branch.contains("//") || branch.contains("@{") {
        return invalid("invalid sequence");
    }
    if branch
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || "~^:?*[\\".contains(c))
    {
        return invalid("forbidden character");
    }
    Ok(())
}
