//! Database connectors
//!
//! A [`Driver`] opens connections for one database kind; a
//! [`DriverConnection`] executes statements on one live connection.
//! The [`ConnectorFactory`] owns the driver registry (built-ins plus
//! startup-registered plugins) and the per-agent endpoint failover
//! state: the active endpoint of a multi-endpoint binding is sticky
//! until it accumulates enough consecutive failures, then the factory
//! advances to the next one and reports the switch for auditing.

pub mod bigquery;
pub mod mongo;
pub mod mysql;
pub mod pool;
pub mod postgres;
pub mod snowflake;

use async_trait::async_trait;
use dashmap::DashMap;
use shared::models::{
    ConnectionParams, DatabaseBinding, DatabaseEndpoint, DriverKind, SchemaSnapshot,
};
use shared::{GatewayError, Result, ResultRow};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Raw output of one statement execution
#[derive(Debug, Clone, Default)]
pub struct DriverQueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<ResultRow>,
    /// Rows affected, for statements that return no result set
    pub rows_affected: u64,
}

/// Opens connections for one database kind
#[async_trait]
pub trait Driver: Send + Sync {
    /// Registry key for this driver ("postgres", "mysql", a plugin name)
    fn kind_name(&self) -> &str;

    /// Open a connection against one endpoint
    async fn open(
        &self,
        params: &ConnectionParams,
        endpoint: &DatabaseEndpoint,
    ) -> Result<Box<dyn DriverConnection>>;
}

/// One live connection
#[async_trait]
pub trait DriverConnection: Send {
    /// Execute a statement with positional parameters under a deadline
    ///
    /// Exceeding the deadline yields `timeout`; the caller must then
    /// discard this connection, since the statement may still be
    /// running on it.
    async fn execute(
        &mut self,
        sql: &str,
        params: &[serde_json::Value],
        deadline: Duration,
    ) -> Result<DriverQueryOutput>;

    /// Snapshot the schema objects visible on this connection
    async fn list_resources(&mut self) -> Result<SchemaSnapshot>;

    /// The connection's effective default schema, if the driver has one
    async fn default_schema(&mut self) -> Result<Option<String>>;

    /// Liveness check used before reusing a pooled connection
    async fn ping(&mut self) -> bool;

    /// Close the connection
    async fn close(self: Box<Self>);
}

impl std::fmt::Debug for dyn DriverConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dyn DriverConnection")
    }
}

/// A permanent endpoint advance, reported for auditing
#[derive(Debug, Clone)]
pub struct EndpointFailover {
    pub agent_id: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Default)]
struct EndpointState {
    active_idx: usize,
    consecutive_failures: u32,
}

/// Driver registry plus per-agent endpoint selection
pub struct ConnectorFactory {
    drivers: HashMap<String, Arc<dyn Driver>>,
    endpoint_state: DashMap<String, EndpointState>,
}

impl Default for ConnectorFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectorFactory {
    /// A factory with the built-in drivers registered
    pub fn new() -> Self {
        let mut drivers: HashMap<String, Arc<dyn Driver>> = HashMap::new();
        for driver in [
            Arc::new(postgres::PostgresDriver) as Arc<dyn Driver>,
            Arc::new(mysql::MysqlDriver) as Arc<dyn Driver>,
            Arc::new(bigquery::BigQueryDriver::new()) as Arc<dyn Driver>,
            Arc::new(snowflake::SnowflakeDriver::new()) as Arc<dyn Driver>,
            Arc::new(mongo::MongoDriver::new()) as Arc<dyn Driver>,
        ] {
            drivers.insert(driver.kind_name().to_string(), driver);
        }
        Self {
            drivers,
            endpoint_state: DashMap::new(),
        }
    }

    /// Register an out-of-tree driver at startup
    ///
    /// Plugin names must not collide with built-ins or other plugins.
    pub fn register_plugin(&mut self, driver: Arc<dyn Driver>) -> Result<()> {
        let name = driver.kind_name().to_string();
        if self.drivers.contains_key(&name) {
            return Err(GatewayError::config(format!(
                "driver name '{}' is already registered",
                name
            )));
        }
        tracing::info!(driver = %name, "Plugin driver registered");
        self.drivers.insert(name, driver);
        Ok(())
    }

    fn driver_for(&self, kind: &DriverKind) -> Result<Arc<dyn Driver>> {
        let key = match kind {
            DriverKind::Plugin(name) => name.clone(),
            other => other.to_string(),
        };
        self.drivers.get(&key).cloned().ok_or_else(|| {
            GatewayError::config(format!("no driver registered for kind '{}'", kind))
        })
    }

    /// Open a connection for an agent's binding
    ///
    /// Starts at the agent's sticky active endpoint and walks the
    /// remaining endpoints on connect failures. Permanent advances of
    /// the active endpoint are returned in the failover list.
    pub async fn connect(
        &self,
        agent_id: &str,
        binding: &DatabaseBinding,
        params: &ConnectionParams,
    ) -> Result<(Box<dyn DriverConnection>, Vec<EndpointFailover>)> {
        if params.endpoints.is_empty() {
            return Err(GatewayError::Connect {
                detail: "binding has no endpoints".to_string(),
            });
        }

        let driver = self.driver_for(&binding.driver_kind)?;
        let start = self
            .endpoint_state
            .get(agent_id)
            .map(|s| s.active_idx)
            .unwrap_or(0)
            .min(params.endpoints.len() - 1);

        let mut failovers = Vec::new();
        let mut last_error: Option<GatewayError> = None;

        for attempt in 0..params.endpoints.len() {
            let idx = (start + attempt) % params.endpoints.len();
            let endpoint = &params.endpoints[idx];

            match driver.open(params, endpoint).await {
                Ok(conn) => {
                    if idx == start {
                        // Active endpoint worked: clear its failure streak
                        if let Some(mut state) = self.endpoint_state.get_mut(agent_id) {
                            state.consecutive_failures = 0;
                        }
                    }
                    return Ok((conn, failovers));
                }
                Err(e) => {
                    tracing::warn!(
                        agent_id = agent_id,
                        endpoint = %endpoint.host,
                        error = %e,
                        "Endpoint connect failed"
                    );
                    metrics::counter!("db_connect_failures_total").increment(1);

                    if idx == start {
                        if let Some(switch) = self.record_active_failure(
                            agent_id,
                            binding,
                            params,
                            start,
                        ) {
                            failovers.push(switch);
                        }
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| GatewayError::Connect {
            detail: "no endpoints reachable".to_string(),
        }))
    }

    /// Count a failure against the active endpoint; advance it once the
    /// binding's threshold is reached
    fn record_active_failure(
        &self,
        agent_id: &str,
        binding: &DatabaseBinding,
        params: &ConnectionParams,
        active_idx: usize,
    ) -> Option<EndpointFailover> {
        let mut state = self
            .endpoint_state
            .entry(agent_id.to_string())
            .or_default();
        state.active_idx = active_idx;
        state.consecutive_failures += 1;

        if state.consecutive_failures < binding.endpoint_failure_threshold.max(1) {
            return None;
        }

        let next_idx = (active_idx + 1) % params.endpoints.len();
        if next_idx == active_idx {
            // Single endpoint: nothing to advance to
            state.consecutive_failures = 0;
            return None;
        }

        let from = params.endpoints[active_idx].host.clone();
        let to = params.endpoints[next_idx].host.clone();
        state.active_idx = next_idx;
        state.consecutive_failures = 0;

        tracing::warn!(
            agent_id = agent_id,
            from = %from,
            to = %to,
            "Active database endpoint advanced"
        );
        metrics::counter!("db_endpoint_failovers_total").increment(1);

        Some(EndpointFailover {
            agent_id: agent_id.to_string(),
            from,
            to,
        })
    }

    /// Forget an agent's endpoint state (revocation, binding update)
    pub fn forget_agent(&self, agent_id: &str) {
        self.endpoint_state.remove(agent_id);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory driver used across unit tests

    use super::*;
    use shared::models::TableSchema;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Script for a fake connection
    #[derive(Debug, Clone, Default)]
    pub struct FakeBehavior {
        /// Fail opens against hosts in this list
        pub unreachable_hosts: Vec<String>,
        /// Rows returned by every execute
        pub rows: Vec<ResultRow>,
        pub columns: Vec<String>,
        /// Sleep this long inside execute
        pub execute_delay: Duration,
        /// Fail every execute with this detail
        pub execute_error: Option<String>,
    }

    pub struct FakeDriver {
        pub behavior: Mutex<FakeBehavior>,
        pub opened: AtomicU32,
        pub executed: AtomicU32,
    }

    impl FakeDriver {
        pub fn new(behavior: FakeBehavior) -> Self {
            Self {
                behavior: Mutex::new(behavior),
                opened: AtomicU32::new(0),
                executed: AtomicU32::new(0),
            }
        }
    }

    pub struct FakeConnection {
        behavior: FakeBehavior,
        executed: Arc<AtomicU32>,
        pub alive: bool,
    }

    #[async_trait]
    impl Driver for Arc<FakeDriver> {
        fn kind_name(&self) -> &str {
            "fake"
        }

        async fn open(
            &self,
            _params: &ConnectionParams,
            endpoint: &DatabaseEndpoint,
        ) -> Result<Box<dyn DriverConnection>> {
            let behavior = self.behavior.lock().unwrap().clone();
            if behavior.unreachable_hosts.contains(&endpoint.host) {
                return Err(GatewayError::Connect {
                    detail: format!("{} unreachable", endpoint.host),
                });
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeConnection {
                behavior,
                executed: Arc::new(AtomicU32::new(0)),
                alive: true,
            }))
        }
    }

    #[async_trait]
    impl DriverConnection for FakeConnection {
        async fn execute(
            &mut self,
            _sql: &str,
            _params: &[serde_json::Value],
            deadline: Duration,
        ) -> Result<DriverQueryOutput> {
            self.executed.fetch_add(1, Ordering::SeqCst);
            if !self.behavior.execute_delay.is_zero() {
                if self.behavior.execute_delay > deadline {
                    tokio::time::sleep(deadline).await;
                    return Err(GatewayError::Timeout {
                        deadline_ms: deadline.as_millis() as u64,
                    });
                }
                tokio::time::sleep(self.behavior.execute_delay).await;
            }
            if let Some(detail) = &self.behavior.execute_error {
                return Err(GatewayError::Execute {
                    detail: detail.clone(),
                    subkind: shared::ExecuteSubkind::Statement,
                    dead_letter_ref: None,
                });
            }
            Ok(DriverQueryOutput {
                columns: self.behavior.columns.clone(),
                rows: self.behavior.rows.clone(),
                rows_affected: 0,
            })
        }

        async fn list_resources(&mut self) -> Result<SchemaSnapshot> {
            Ok(SchemaSnapshot {
                tables: vec![TableSchema {
                    name: "public.sales".to_string(),
                    columns: vec![("id".to_string(), "bigint".to_string())],
                }],
            })
        }

        async fn default_schema(&mut self) -> Result<Option<String>> {
            Ok(Some("public".to_string()))
        }

        async fn ping(&mut self) -> bool {
            self.alive
        }

        async fn close(self: Box<Self>) {}
    }

    pub fn params_with_hosts(hosts: &[&str]) -> ConnectionParams {
        ConnectionParams {
            endpoints: hosts
                .iter()
                .map(|h| DatabaseEndpoint {
                    host: h.to_string(),
                    port: Some(5432),
                })
                .collect(),
            database: "testdb".to_string(),
            username: None,
            password: None,
            options: serde_json::Value::Null,
        }
    }

    pub fn binding_for(agent_id: &str, threshold: u32) -> DatabaseBinding {
        DatabaseBinding {
            agent_id: agent_id.to_string(),
            driver_kind: DriverKind::Plugin("fake".to_string()),
            connection_params_encrypted: String::new(),
            connection_name: "test".to_string(),
            default_schema: Some("public".to_string()),
            endpoint_failure_threshold: threshold,
        }
    }

    pub fn factory_with_fake(driver: Arc<FakeDriver>) -> ConnectorFactory {
        let mut factory = ConnectorFactory::new();
        factory
            .register_plugin(Arc::new(driver) as Arc<dyn Driver>)
            .unwrap();
        factory
    }
}
