//! Test Trigger & Scheduler
//!
//! Picks the test suites a change needs, runs them with bounded parallelism
//! and keeps a per-project execution history for pre-merge checks.

pub mod services;
pub mod test_utils;

pub use services::*;
