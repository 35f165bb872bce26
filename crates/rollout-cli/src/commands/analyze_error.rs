//! Analyze Error Command

use clap::Args;
use colored::Colorize;
use rollout_rollback::{analyze_error, recovery_options, RiskLevel};
use std::io::Read;

#[derive(Args)]
pub struct AnalyzeErrorCommand {
    /// Error text; read from stdin when omitted
    message: Option<String>,

    /// Print the analysis and recovery options as JSON
    #[arg(long)]
    json: bool,
}

impl AnalyzeErrorCommand {
    pub fn execute(self) -> anyhow::Result<()> {
        let message = match self.message {
            Some(message) => message,
            None => {
                let mut buffer = String::new();
                std::io::stdin().read_to_string(&mut buffer)?;
                buffer
            }
        };

        let analysis = analyze_error(&message);
        let options = recovery_options(analysis.category);

        if self.json {
            let report = serde_json::json!({
                "analysis": analysis,
                "recovery_options": options,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }

        println!();
        println!("{}", analysis.summary.bright_white().bold());
        println!("  {} {}", "Category:".bright_white(), analysis.category);
        println!("  {} {}", "Severity:".bright_white(), analysis.severity);
        println!("  {} {}", "Root cause:".bright_white(), analysis.root_cause);
        println!(
            "  {} {}",
            "Affected:".bright_white(),
            analysis.affected_components.join(", ")
        );
        println!();
        println!("{}", "Recovery options".bright_white().bold());
        for (index, action) in options.iter().enumerate() {
            let risk = match action.risk {
                RiskLevel::Low => "low risk".bright_green(),
                RiskLevel::Medium => "medium risk".bright_yellow(),
                RiskLevel::High => "high risk".bright_red(),
            };
            let approval = if action.requires_approval {
                ", needs approval"
            } else {
                ""
            };
            println!(
                "  {}. {} ({}, ~{} min{})",
                index + 1,
                action.title,
                risk,
                action.estimated_minutes,
                approval
            );
            println!("     {}", action.description.dimmed());
        }
        println!();
        Ok(())
    }
}
