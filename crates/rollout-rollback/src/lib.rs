//! Rollback Controller
//!
//! Rollbacks always target a verified snapshot and always wait for a human
//! approval. Failed rollbacks come back with a categorized error analysis and
//! an ordered list of recovery actions.

pub mod services;
pub mod test_utils;

pub use services::*;
