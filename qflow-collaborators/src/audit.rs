//! Audit sink collaborator: a side-channel record of validation and
//! permission decisions, independent of the ledger (which only records
//! execution-level events).

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub at: qflow_common::time::TimestampSeconds,
    pub tenant_id: String,
    pub action: String,
    pub outcome: String,
    pub detail: String,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent);
}

/// Logs via `log::info!` and additionally buffers recent events in memory
/// for tests and the status API to surface without a real audit backend.
pub struct LoggingAuditSink {
    buffer: Mutex<Vec<AuditEvent>>,
    capacity: usize,
}

impl LoggingAuditSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
            capacity,
        }
    }

    pub async fn recent(&self) -> Vec<AuditEvent> {
        self.buffer.lock().await.clone()
    }
}

#[async_trait]
impl AuditSink for LoggingAuditSink {
    async fn record(&self, event: AuditEvent) {
        log::info!(
            target: "qflow::audit",
            "tenant={} action={} outcome={} detail={}",
            event.tenant_id,
            event.action,
            event.outcome,
            event.detail
        );
        let mut buf = self.buffer.lock().await;
        buf.push(event);
        if buf.len() > self.capacity {
            let overflow = buf.len() - self.capacity;
            buf.drain(0..overflow);
        }
    }
}
