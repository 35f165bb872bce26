pub mod analyze_error;
pub mod deploy;
pub mod plan;
pub mod select_tests;

pub use analyze_error::AnalyzeErrorCommand;
pub use deploy::DeployCommand;
pub use plan::PlanCommand;
pub use select_tests::SelectTestsCommand;
