// Re-export audit types from core for convenience
pub use rollout_core::{record_audit, AuditRecord, AuditSink};

pub mod services;

pub use services::*;
