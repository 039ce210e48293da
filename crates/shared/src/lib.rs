//! Shared library for the querygate backend crates
//!
//! This crate provides common functionality used across the gateway:
//! - Configuration management
//! - The closed error taxonomy and user-visible error envelope
//! - Core data models (agents, bindings, permissions, audit, cost)
//! - Logging infrastructure

pub mod config;
pub mod error;
pub mod models;

// Re-export commonly used types
pub use config::{GatewayConfig, PoolConfig, RateLimitConfig, RetryConfig, SinkConfig};
pub use error::{ErrorKind, ErrorReport, ExecuteSubkind, GatewayError, Result};
pub use models::{
    ActionKind, Agent, AuditEvent, AuditStatus, CallContext, Capability, ConnectionParams,
    CostRecord, DatabaseBinding, DatabaseEndpoint, DriverKind, OperationKind, Permission,
    QueryPayload, QueryRequest, QueryResult, ResourceKind, ResultRow, SchemaSnapshot,
    StatementKind, TableSchema,
};

/// Initialize tracing subscriber for structured logging
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "shared=debug,gateway_core=debug,provider_manager=debug,info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
