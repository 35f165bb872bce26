//! Plan Command
//!
//! Print the pipeline configuration generated for a change as JSON.

use anyhow::Context;
use clap::Args;
use rollout_core::{Environment, OrchestratorSettings, PipelineConfig};
use rollout_deployments::{ChangeSpecification, PipelineConfigGenerator};

#[derive(Args)]
pub struct PlanCommand {
    #[command(flatten)]
    change: ChangeArgs,
}

/// Change description shared by `plan` and `deploy`
#[derive(Args)]
pub struct ChangeArgs {
    /// Free-text description of the change
    #[arg(short, long)]
    pub description: String,

    /// Source branch to build
    #[arg(short, long)]
    pub branch: String,

    /// Target environment (development, staging, production)
    #[arg(short, long)]
    pub environment: Option<String>,
}

impl ChangeArgs {
    pub fn generate(&self, settings: &OrchestratorSettings) -> anyhow::Result<PipelineConfig> {
        let mut spec = ChangeSpecification::new(&self.description, &self.branch);
        if let Some(ref environment) = self.environment {
            let environment: Environment = environment
                .parse()
                .with_context(|| format!("Invalid --environment '{}'", environment))?;
            spec = spec.with_environment(environment);
        }

        let generator = PipelineConfigGenerator::new(settings.pipeline.clone())?;
        Ok(generator.generate(&spec)?)
    }
}

impl PlanCommand {
    pub fn execute(self, settings: &OrchestratorSettings) -> anyhow::Result<()> {
        let config = self.change.generate(settings)?;
        println!("{}", serde_json::to_string_pretty(&config)?);
        Ok(())
    }
}
