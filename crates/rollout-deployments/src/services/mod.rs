pub mod types;
pub use types::*;

pub mod pipeline_generator;
pub use pipeline_generator::*;

pub mod stage_executor;
pub use stage_executor::*;

pub mod snapshot_service;
pub use snapshot_service::*;

pub mod pipeline_runner;
pub use pipeline_runner::*;

pub mod deployment_monitor;
pub use deployment_monitor::*;

pub mod approval_gate;
pub use approval_gate::*;

pub mod deployment_trigger;
pub use deployment_trigger::*;
