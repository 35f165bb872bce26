use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::types::UtcDateTime;

/// A single audit trail entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Operation type (e.g., "DEPLOYMENT_TRIGGERED", "ROLLBACK_APPROVED")
    pub action_type: String,
    pub description: String,
    pub context: serde_json::Value,
    pub actor_id: Option<String>,
    pub recorded_at: UtcDateTime,
}

impl AuditRecord {
    pub fn new(action_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            description: description.into(),
            context: serde_json::Value::Null,
            actor_id: None,
            recorded_at: chrono::Utc::now(),
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }
}

/// One-way audit trail port
///
/// The core never reads audit records back; sinks decide how and where they
/// are kept.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> Result<()>;
}

/// Record an audit entry, logging instead of failing when the sink is down
///
/// Called after the state transition it describes has been committed, so an
/// unavailable sink never leaves core state half-written.
pub async fn record_audit(sink: &dyn AuditSink, record: AuditRecord) {
    let action = record.action_type.clone();
    if let Err(e) = sink.record(record).await {
        tracing::warn!("Failed to write audit record {}: {}", action, e);
    }
}
