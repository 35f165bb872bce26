use rollout_core::{AuditRecord, AuditSink, UtcDateTime};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Writes audit records as structured events on the `audit` tracing target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait::async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: AuditRecord) -> anyhow::Result<()> {
        let context = serde_json::to_string(&record.context)?;
        info!(
            target: "audit",
            action = %record.action_type,
            actor = record.actor_id.as_deref().unwrap_or("system"),
            context = %context,
            "{}",
            record.description
        );
        Ok(())
    }
}

/// Bounded in-process audit log
///
/// Keeps the most recent `capacity` records and answers the same filter
/// queries a persistent audit store would.
pub struct InMemoryAuditLog {
    records: RwLock<VecDeque<AuditRecord>>,
    capacity: usize,
}

impl InMemoryAuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn new_arc(capacity: usize) -> Arc<Self> {
        Arc::new(Self::new(capacity))
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Most recent records first
    pub async fn get_recent_audit_logs(&self, limit: usize) -> Vec<AuditRecord> {
        self.records
            .read()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn get_actor_audit_logs(&self, actor_id: &str) -> Vec<AuditRecord> {
        self.filter_audit_logs(None, Some(actor_id), None, None, usize::MAX, 0)
            .await
    }

    /// Filter by action substring, actor and time range, newest first
    pub async fn filter_audit_logs(
        &self,
        action: Option<&str>,
        actor_id: Option<&str>,
        from: Option<UtcDateTime>,
        to: Option<UtcDateTime>,
        limit: usize,
        offset: usize,
    ) -> Vec<AuditRecord> {
        self.records
            .read()
            .await
            .iter()
            .rev()
            .filter(|r| action.map_or(true, |a| r.action_type.contains(a)))
            .filter(|r| actor_id.map_or(true, |id| r.actor_id.as_deref() == Some(id)))
            .filter(|r| from.map_or(true, |from| r.recorded_at >= from))
            .filter(|r| to.map_or(true, |to| r.recorded_at <= to))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl AuditSink for InMemoryAuditLog {
    async fn record(&self, record: AuditRecord) -> anyhow::Result<()> {
        let mut records = self.records.write().await;
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
        Ok(())
    }
}
