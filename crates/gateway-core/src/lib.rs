//! Core of the querygate backend: the governed query pipeline
//!
//! Transforms an authenticated agent call into a permitted, executed,
//! audited, cost-attributed database result:
//!
//! - [`vault`]: AES-256-GCM credential sealing
//! - [`registry`]: agents, bindings, hashed API keys
//! - [`permissions`]: `(agent, resource)` capability grants
//! - [`inspector`]: SQL parsing and table extraction
//! - [`connectors`]: driver plugins, per-agent pools, endpoint failover
//! - [`nl2sql`]: schema-scoped natural-language conversion
//! - [`audit`] / [`cost`] / [`dlq`]: record sinks
//! - [`pipeline`]: the stage orchestrator tying it all together

pub mod audit;
pub mod classify;
pub mod connectors;
pub mod cost;
pub mod dlq;
pub mod inspector;
pub mod nl2sql;
pub mod permissions;
pub mod pipeline;
pub mod registry;
pub mod vault;

// Re-export commonly used types
pub use audit::{AuditLogger, AuditQuery, AuditSink, JsonlAuditSink, MemoryAuditSink};
pub use connectors::pool::{PoolSet, PooledConnection};
pub use connectors::{ConnectorFactory, Driver, DriverConnection, DriverQueryOutput};
pub use cost::{
    AlertPeriod, AlertScope, BudgetAlert, BudgetNotification, CostAggregate, CostSink,
    CostTracker, JsonlCostSink, MemoryNotificationSink, NotificationSink,
};
pub use dlq::{DeadLetterQueue, DlqEntry, InMemoryDlq, RedisDlq};
pub use inspector::{SqlInspection, SqlInspector};
pub use nl2sql::{GeneratedSql, NlSqlConverter};
pub use permissions::{caps, BatchDecision, PermissionStore};
pub use pipeline::{Gateway, GatewayParts};
pub use registry::{AgentRegistry, AgentSpec, Registration, RegistryError};
pub use vault::CredentialVault;
