//! Audit logging
//!
//! `append` is the only mutator. Events are serialized in the stable
//! [`AuditEvent`] schema and handed to a sink; the in-memory sink backs
//! tests and the read API, the JSONL sink appends one JSON object per
//! line for shipping.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::models::{ActionKind, AuditEvent};
use shared::{GatewayError, Result};
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;

/// Append-only audit sink
///
/// Implementations must not lose events on orderly shutdown.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, event: &AuditEvent) -> Result<()>;
}

/// Filters for reading events back
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub agent_id: Option<String>,
    pub action_kind: Option<ActionKind>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

/// In-memory audit sink with read support
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events matching a filter, in append order
    pub fn query(&self, query: &AuditQuery) -> Vec<AuditEvent> {
        let events = self.events.lock().expect("audit lock poisoned");
        events
            .iter()
            .filter(|e| {
                query
                    .agent_id
                    .as_ref()
                    .map(|a| e.agent_id.as_deref() == Some(a.as_str()))
                    .unwrap_or(true)
                    && query
                        .action_kind
                        .map(|k| e.action_kind == k)
                        .unwrap_or(true)
                    && query.since.map(|t| e.timestamp >= t).unwrap_or(true)
                    && query.until.map(|t| e.timestamp <= t).unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    /// Every event, in append order
    pub fn all(&self) -> Vec<AuditEvent> {
        self.events.lock().expect("audit lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("audit lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, event: &AuditEvent) -> Result<()> {
        self.events
            .lock()
            .expect("audit lock poisoned")
            .push(event.clone());
        Ok(())
    }
}

/// JSONL file sink, one event per line
pub struct JsonlAuditSink {
    path: PathBuf,
    // Serializes appends so concurrent events cannot interleave lines
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn append(&self, event: &AuditEvent) -> Result<()> {
        let mut line = serde_json::to_string(event)
            .map_err(|e| GatewayError::internal(format!("audit serialization failed: {}", e)))?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| GatewayError::internal(format!("audit sink open failed: {}", e)))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| GatewayError::internal(format!("audit sink write failed: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| GatewayError::internal(format!("audit sink flush failed: {}", e)))?;
        Ok(())
    }
}

/// The audit logger used by the pipeline
///
/// Thin wrapper that stamps metrics and shields callers from sink
/// failures: a failed append is logged and counted, never propagated
/// into the response path.
pub struct AuditLogger {
    sink: std::sync::Arc<dyn AuditSink>,
}

impl AuditLogger {
    pub fn new(sink: std::sync::Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// Append one event
    pub async fn append(&self, event: AuditEvent) {
        metrics::counter!(
            "audit_events_total",
            "status" => event.status.to_string()
        )
        .increment(1);

        if let Err(e) = self.sink.append(&event).await {
            tracing::error!(
                event_id = %event.event_id,
                error = %e,
                "Audit sink append failed"
            );
            metrics::counter!("audit_append_failures_total").increment(1);
        }
    }
}
