//! Core data models shared across the gateway crates
//!
//! These records form the vocabulary of the pipeline: agents and their
//! database bindings, permissions, audit events, cost records, query
//! results, and the ingress request contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A registered principal (AI or service) that owns credentials and permissions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Unique, non-empty identifier chosen at registration
    pub agent_id: String,
    /// Human-friendly name
    pub display_name: String,
    /// Free-form classification (e.g. "analytics", "support-bot")
    pub agent_type: String,
    /// When the agent was registered
    pub created_at: DateTime<Utc>,
}

/// Supported database driver kinds
///
/// Serialized as the wire name ("postgres", "plugin:<name>", ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DriverKind {
    Postgres,
    Mysql,
    Mongo,
    Bigquery,
    Snowflake,
    /// An out-of-tree driver registered at startup
    Plugin(String),
}

impl Serialize for DriverKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DriverKind {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl DriverKind {
    /// Whether identifiers for this driver compare case-insensitively
    pub fn case_insensitive(&self) -> bool {
        matches!(
            self,
            DriverKind::Postgres | DriverKind::Mysql | DriverKind::Bigquery | DriverKind::Snowflake
        )
    }

    /// The schema used to qualify bare table names when the binding does
    /// not set one explicitly
    pub fn fallback_schema(&self) -> Option<&'static str> {
        match self {
            DriverKind::Postgres => Some("public"),
            DriverKind::Snowflake => Some("PUBLIC"),
            _ => None,
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverKind::Postgres => write!(f, "postgres"),
            DriverKind::Mysql => write!(f, "mysql"),
            DriverKind::Mongo => write!(f, "mongo"),
            DriverKind::Bigquery => write!(f, "bigquery"),
            DriverKind::Snowflake => write!(f, "snowflake"),
            DriverKind::Plugin(name) => write!(f, "plugin:{}", name),
        }
    }
}

impl FromStr for DriverKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(DriverKind::Postgres),
            "mysql" => Ok(DriverKind::Mysql),
            "mongo" | "mongodb" => Ok(DriverKind::Mongo),
            "bigquery" => Ok(DriverKind::Bigquery),
            "snowflake" => Ok(DriverKind::Snowflake),
            other => match other.strip_prefix("plugin:") {
                Some(name) if !name.is_empty() => Ok(DriverKind::Plugin(name.to_string())),
                _ => Err(format!("unknown driver kind: {}", s)),
            },
        }
    }
}

/// A single database endpoint within a binding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseEndpoint {
    /// Host name or full URL depending on the driver
    pub host: String,
    /// Port, for drivers that use one
    pub port: Option<u16>,
}

/// Connection parameters as supplied at registration, before encryption
///
/// Serialized to JSON and sealed by the vault; never persisted in clear.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Ordered endpoints; the first is the preferred primary
    pub endpoints: Vec<DatabaseEndpoint>,
    /// Database / dataset / project name
    pub database: String,
    /// User name, for drivers that use one
    pub username: Option<String>,
    /// Password or API token, for drivers that use one
    pub password: Option<String>,
    /// Driver-specific extras (warehouse, account, project id, ...)
    #[serde(default)]
    pub options: serde_json::Value,
}

/// The single database attachment associated with an agent
///
/// Exactly one binding exists per agent at a time; updates replace it
/// atomically. `connection_params_encrypted` is a vault ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseBinding {
    /// Owning agent
    pub agent_id: String,
    /// Driver used to reach the database
    pub driver_kind: DriverKind,
    /// Vault-sealed [`ConnectionParams`]
    pub connection_params_encrypted: String,
    /// Display name for the connection
    pub connection_name: String,
    /// Schema used to qualify bare table names; falls back to the
    /// driver default when unset
    pub default_schema: Option<String>,
    /// Endpoint failures tolerated before advancing to the next endpoint
    pub endpoint_failure_threshold: u32,
}

/// An access right on a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Read,
    Write,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Read => write!(f, "read"),
            Capability::Write => write!(f, "write"),
        }
    }
}

/// What kind of named object a permission covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Table,
    Dataset,
    Collection,
}

impl ResourceKind {
    /// Whether resource identifiers of this kind are case-insensitive
    pub fn case_insensitive(&self) -> bool {
        // Document stores keep collection names verbatim
        !matches!(self, ResourceKind::Collection)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Table => write!(f, "table"),
            ResourceKind::Dataset => write!(f, "dataset"),
            ResourceKind::Collection => write!(f, "collection"),
        }
    }
}

/// A grant of capabilities on one resource for one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Permission {
    pub agent_id: String,
    /// Dotted name, e.g. "schema.table"
    pub resource_id: String,
    pub resource_kind: ResourceKind,
    pub caps: BTreeSet<Capability>,
}

/// Statement classification produced by the SQL inspector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Ddl,
    Other,
}

impl StatementKind {
    /// Capability required to run a statement of this kind
    ///
    /// `Other` has no mapping; the inspector rejects it before this is
    /// consulted.
    pub fn required_capability(&self) -> Option<Capability> {
        match self {
            StatementKind::Select => Some(Capability::Read),
            StatementKind::Insert
            | StatementKind::Update
            | StatementKind::Delete
            | StatementKind::Ddl => Some(Capability::Write),
            StatementKind::Other => None,
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatementKind::Select => "select",
            StatementKind::Insert => "insert",
            StatementKind::Update => "update",
            StatementKind::Delete => "delete",
            StatementKind::Ddl => "ddl",
            StatementKind::Other => "other",
        };
        write!(f, "{}", s)
    }
}

/// What a pipeline call did, for audit attribution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    SqlQuery,
    NlQuery,
    AgentRegistered,
    AgentRevoked,
    BindingUpdated,
    PermissionChanged,
    DbFailover,
    ProviderFailover,
    ProviderRegistered,
    Authentication,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionKind::SqlQuery => "sql_query",
            ActionKind::NlQuery => "nl_query",
            ActionKind::AgentRegistered => "agent_registered",
            ActionKind::AgentRevoked => "agent_revoked",
            ActionKind::BindingUpdated => "binding_updated",
            ActionKind::PermissionChanged => "permission_changed",
            ActionKind::DbFailover => "db_failover",
            ActionKind::ProviderFailover => "provider_failover",
            ActionKind::ProviderRegistered => "provider_registered",
            ActionKind::Authentication => "authentication",
        };
        write!(f, "{}", s)
    }
}

/// Outcome recorded on an audit event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Ok,
    Denied,
    Error,
    Blocked,
    Cancelled,
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuditStatus::Ok => "ok",
            AuditStatus::Denied => "denied",
            AuditStatus::Error => "error",
            AuditStatus::Blocked => "blocked",
            AuditStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// One append-only audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event identifier
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    /// Absent only for failed authentication, where no agent resolved
    pub agent_id: Option<String>,
    pub action_kind: ActionKind,
    pub status: AuditStatus,
    /// What the action was about (statement kind, provider id, ...)
    pub subject: String,
    /// Structured detail: tables touched, denied resources, recoveries
    pub details: serde_json::Value,
}

impl AuditEvent {
    /// Create an event stamped now with a fresh id
    pub fn new(
        agent_id: Option<&str>,
        action_kind: ActionKind,
        status: AuditStatus,
        subject: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            agent_id: agent_id.map(|s| s.to_string()),
            action_kind,
            status,
            subject: subject.into(),
            details,
        }
    }
}

/// What kind of work a cost record attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    SqlQuery,
    NlQuery,
    HealthProbe,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationKind::SqlQuery => "sql_query",
            OperationKind::NlQuery => "nl_query",
            OperationKind::HealthProbe => "health_probe",
        };
        write!(f, "{}", s)
    }
}

/// Immutable per-call cost attribution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    /// The pipeline call this record belongs to
    pub call_id: String,
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    /// Provider that served the NL generation, if any
    pub provider_id: Option<String>,
    pub model: Option<String>,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub cost_usd: f64,
    pub operation_kind: OperationKind,
}

/// One result row as an ordered list of column values
pub type ResultRow = Vec<serde_json::Value>;

/// Successful query outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    /// Row data in result order
    pub rows: Vec<ResultRow>,
    /// Column names in result order
    pub columns: Vec<String>,
    pub row_count: usize,
    pub execution_ms: u64,
    /// SQL produced by NL generation, when this was an NL call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_sql: Option<String>,
    /// Fully-qualified tables the statement referenced
    pub tables_touched: BTreeSet<String>,
}

impl QueryResult {
    /// View rows as maps keyed by column name
    pub fn rows_as_maps(&self) -> Vec<serde_json::Map<String, serde_json::Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect()
            })
            .collect()
    }
}

/// How the caller phrased the request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "call_kind", rename_all = "lowercase")]
pub enum QueryPayload {
    /// Raw SQL with optional positional parameters
    Sql {
        text: String,
        #[serde(default)]
        params: Vec<serde_json::Value>,
    },
    /// A natural-language question
    Nl { text: String },
}

/// The ingress record the surface layers hand to the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    /// The plaintext API key presented by the caller
    pub api_key: String,
    pub payload: QueryPayload,
    /// Whether rows should be returned keyed by column name
    #[serde(default)]
    pub as_dict: bool,
    /// Per-request deadline; the per-agent default applies when unset
    pub deadline_ms: Option<u64>,
}

/// Per-call context threaded through the pipeline stages
///
/// Immutable once a field is set; replaces ad-hoc telemetry bags.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Unique id tying together audit and cost records for this call
    pub call_id: String,
    pub started_at: DateTime<Utc>,
    /// Resolved agent, set after authentication
    pub agent_id: Option<String>,
    pub action_kind: ActionKind,
    /// SQL produced by NL generation, set during intake
    pub generated_sql: Option<String>,
    /// Provider usage, set when an NL call completed generation
    pub provider_id: Option<String>,
    pub model: Option<String>,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    /// Provider cost attributed during generation
    pub provider_cost: Option<f64>,
}

impl CallContext {
    /// Fresh context for an inbound call
    pub fn new(action_kind: ActionKind) -> Self {
        Self {
            call_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            agent_id: None,
            action_kind,
            generated_sql: None,
            provider_id: None,
            model: None,
            prompt_tokens: None,
            completion_tokens: None,
            provider_cost: None,
        }
    }
}

/// A table visible to an agent, as handed to the NL converter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    /// Fully-qualified name
    pub name: String,
    /// (column name, type name) pairs in table order
    pub columns: Vec<(String, String)>,
}

/// Snapshot of the schema objects an agent may see
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub tables: Vec<TableSchema>,
}

impl SchemaSnapshot {
    /// Names of every table in the snapshot
    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }
}
