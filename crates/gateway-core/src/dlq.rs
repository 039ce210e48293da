//! Dead-letter queue for unrecoverable queries
//!
//! Queries that fail with `execute` or `provider_unavailable` after all
//! retries are parked here for operator review. The entry reference is
//! returned to the caller in the error report.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use shared::{ErrorKind, GatewayError, Result};
use uuid::Uuid;

/// One parked query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    /// Returned to the caller as `dead_letter_ref`
    pub entry_ref: String,
    /// Pipeline call that failed
    pub call_id: String,
    pub agent_id: String,
    /// The statement or document query that failed
    pub statement: String,
    /// Taxonomy kind of the final failure
    pub error_kind: ErrorKind,
    /// Sanitized failure detail
    pub error_detail: String,
    pub failed_at: DateTime<Utc>,
}

impl DlqEntry {
    pub fn new(
        call_id: &str,
        agent_id: &str,
        statement: &str,
        error_kind: ErrorKind,
        error_detail: String,
    ) -> Self {
        Self {
            entry_ref: format!("dlq_{}", Uuid::new_v4()),
            call_id: call_id.to_string(),
            agent_id: agent_id.to_string(),
            statement: statement.to_string(),
            error_kind,
            error_detail,
            failed_at: Utc::now(),
        }
    }
}

/// Dead-letter queue contract
#[async_trait]
pub trait DeadLetterQueue: Send + Sync {
    /// Park a failed query
    async fn push(&self, entry: DlqEntry) -> Result<()>;

    /// Current queue length
    async fn len(&self) -> Result<u64>;

    /// Take the oldest entry for reprocessing
    async fn pop(&self) -> Result<Option<DlqEntry>>;

    /// Look at the oldest entry without removing it
    async fn peek(&self) -> Result<Option<DlqEntry>>;
}

/// In-memory DLQ for tests and development
#[derive(Default)]
pub struct InMemoryDlq {
    entries: std::sync::Mutex<Vec<DlqEntry>>,
}

impl InMemoryDlq {
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries, oldest first (for test inspection)
    pub fn entries(&self) -> Vec<DlqEntry> {
        self.entries.lock().expect("dlq lock poisoned").clone()
    }
}

#[async_trait]
impl DeadLetterQueue for InMemoryDlq {
    async fn push(&self, entry: DlqEntry) -> Result<()> {
        self.entries
            .lock()
            .expect("dlq lock poisoned")
            .push(entry);
        Ok(())
    }

    async fn len(&self) -> Result<u64> {
        Ok(self.entries.lock().expect("dlq lock poisoned").len() as u64)
    }

    async fn pop(&self) -> Result<Option<DlqEntry>> {
        let mut entries = self.entries.lock().expect("dlq lock poisoned");
        if entries.is_empty() {
            Ok(None)
        } else {
            Ok(Some(entries.remove(0)))
        }
    }

    async fn peek(&self) -> Result<Option<DlqEntry>> {
        Ok(self
            .entries
            .lock()
            .expect("dlq lock poisoned")
            .first()
            .cloned())
    }
}

/// Redis-backed DLQ
pub struct RedisDlq {
    conn: redis::aio::MultiplexedConnection,
    queue_key: String,
}

impl RedisDlq {
    pub fn new(conn: redis::aio::MultiplexedConnection, queue_key: impl Into<String>) -> Self {
        Self {
            conn,
            queue_key: queue_key.into(),
        }
    }

    /// Connect and build the queue in one step
    pub async fn connect(url: &str, queue_key: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| GatewayError::config(format!("invalid redis url: {}", e)))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| GatewayError::config(format!("redis connection failed: {}", e)))?;
        Ok(Self::new(conn, queue_key))
    }
}

fn redis_err(e: redis::RedisError) -> GatewayError {
    GatewayError::internal(format!("dlq redis error: {}", e))
}

#[async_trait]
impl DeadLetterQueue for RedisDlq {
    async fn push(&self, entry: DlqEntry) -> Result<()> {
        let json = serde_json::to_string(&entry)
            .map_err(|e| GatewayError::internal(format!("dlq serialization failed: {}", e)))?;

        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(&self.queue_key, &json)
            .await
            .map_err(redis_err)?;

        tracing::error!(
            entry_ref = %entry.entry_ref,
            call_id = %entry.call_id,
            agent_id = %entry.agent_id,
            error_kind = %entry.error_kind,
            "Query moved to dead-letter queue"
        );
        metrics::counter!("dlq_entries_total").increment(1);

        Ok(())
    }

    async fn len(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        conn.llen(&self.queue_key).await.map_err(redis_err)
    }

    async fn pop(&self) -> Result<Option<DlqEntry>> {
        let mut conn = self.conn.clone();
        let result: Option<String> = conn
            .rpop(&self.queue_key, None)
            .await
            .map_err(redis_err)?;

        match result {
            Some(json) => {
                let entry = serde_json::from_str(&json)
                    .map_err(|e| GatewayError::internal(format!("corrupt dlq entry: {}", e)))?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    async fn peek(&self) -> Result<Option<DlqEntry>> {
        let mut conn = self.conn.clone();
        let result: Option<String> = conn
            .lindex(&self.queue_key, -1)
            .await
            .map_err(redis_err)?;

        match result {
            Some(json) => {
                let entry = serde_json::from_str(&json)
                    .map_err(|e| GatewayError::internal(format!("corrupt dlq entry: {}", e)))?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }
}
