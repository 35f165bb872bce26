//! Rollout CLI - local entrypoint to the orchestration services
//!
//! Generates pipelines, runs them against the current checkout, previews
//! test selection and explains rollback failures.

mod commands;

use clap::{Parser, Subcommand};
use commands::{AnalyzeErrorCommand, DeployCommand, PlanCommand, SelectTestsCommand};
use rollout_core::OrchestratorSettings;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, Layer};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "ROLLOUT_LOG_LEVEL", global = true)]
    log_level: String,

    /// Log format: compact, full
    #[arg(
        long,
        default_value = "compact",
        env = "ROLLOUT_LOG_FORMAT",
        global = true
    )]
    log_format: String,

    /// Settings file (YAML or JSON); built-in defaults when omitted
    #[arg(long, env = "ROLLOUT_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the pipeline generated for a change
    Plan(PlanCommand),
    /// Generate a pipeline and run it against the local checkout
    Deploy(DeployCommand),
    /// Show which test suites a set of changed files triggers
    SelectTests(SelectTestsCommand),
    /// Categorize an error message and list recovery options
    AnalyzeError(AnalyzeErrorCommand),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, &cli.log_format)?;

    let settings = match cli.config {
        Some(ref path) => OrchestratorSettings::from_file(path)?,
        None => OrchestratorSettings::default(),
    };

    match cli.command {
        Commands::Plan(cmd) => cmd.execute(&settings),
        Commands::Deploy(cmd) => cmd.execute(&settings),
        Commands::SelectTests(cmd) => cmd.execute(&settings),
        Commands::AnalyzeError(cmd) => cmd.execute(),
    }
}

fn init_tracing(log_level: &str, log_format: &str) -> anyhow::Result<()> {
    // RUST_LOG takes full control when set
    let filter = if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::EnvFilter::try_from_default_env()?
    } else {
        tracing_subscriber::EnvFilter::try_new(format!(
            "rollout={level},\
             rollout_cli={level},\
             rollout_core={level},\
             rollout_audit={level},\
             rollout_deployments={level},\
             rollout_testing={level},\
             rollout_rollback={level},\
             audit={level},\
             reqwest=warn,\
             hyper=warn",
            level = log_level
        ))?
    };

    let fmt_layer = match log_format {
        "full" => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed(),
        _ => tracing_subscriber::fmt::layer() // "compact" or any other value
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed(),
    };

    let subscriber = tracing_subscriber::registry().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
