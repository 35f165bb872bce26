pub mod suite_runner;
pub mod suite_selector;
pub mod test_scheduler;
pub mod types;

pub use suite_runner::*;
pub use suite_selector::*;
pub use test_scheduler::*;
pub use types::*;
