//! Shared fixtures for pipeline integration tests

use async_trait::async_trait;
use gateway_core::connectors::{
    ConnectorFactory, Driver, DriverConnection, DriverQueryOutput,
};
use gateway_core::{
    AgentSpec, Gateway, GatewayParts, InMemoryDlq, MemoryAuditSink, MemoryNotificationSink,
};
use provider_manager::{
    AiProviderConfig, Completion, CompletionOptions, ProbeResult, ProviderAdapter, ProviderKind,
    RateLimits, RetryPolicy, RetryStrategy, TokenUsage,
};
use shared::models::*;
use shared::{GatewayConfig, GatewayError, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Driver whose connections serve scripted rows and log statements
pub struct ScriptedDriver {
    pub tables: Vec<TableSchema>,
    pub columns: Vec<String>,
    pub rows: Vec<ResultRow>,
    pub execute_delay: Duration,
    /// Every statement that reached a connection
    pub statements: Arc<Mutex<Vec<String>>>,
    pub opened: AtomicU32,
}

impl ScriptedDriver {
    pub fn counting() -> Self {
        Self {
            tables: vec![
                TableSchema {
                    name: "public.sales".to_string(),
                    columns: vec![
                        ("id".to_string(), "bigint".to_string()),
                        ("cid".to_string(), "bigint".to_string()),
                        ("amount".to_string(), "numeric".to_string()),
                    ],
                },
                TableSchema {
                    name: "public.customers".to_string(),
                    columns: vec![
                        ("cid".to_string(), "bigint".to_string()),
                        ("name".to_string(), "text".to_string()),
                    ],
                },
            ],
            columns: vec!["count".to_string()],
            rows: vec![vec![serde_json::json!(42)]],
            execute_delay: Duration::ZERO,
            statements: Arc::new(Mutex::new(Vec::new())),
            opened: AtomicU32::new(0),
        }
    }

    pub fn executed(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }
}

pub struct ScriptedConnection {
    tables: Vec<TableSchema>,
    columns: Vec<String>,
    rows: Vec<ResultRow>,
    execute_delay: Duration,
    statements: Arc<Mutex<Vec<String>>>,
}

/// Newtype wrapper so `Driver` can be implemented for a shared `ScriptedDriver`
/// handle without violating the orphan rule (both `Driver` and `Arc` are
/// foreign to this integration-test crate).
pub struct ScriptedDriverHandle(pub Arc<ScriptedDriver>);

#[async_trait]
impl Driver for ScriptedDriverHandle {
    fn kind_name(&self) -> &str {
        "scripted"
    }

    async fn open(
        &self,
        _params: &ConnectionParams,
        _endpoint: &DatabaseEndpoint,
    ) -> Result<Box<dyn DriverConnection>> {
        self.0.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedConnection {
            tables: self.0.tables.clone(),
            columns: self.0.columns.clone(),
            rows: self.0.rows.clone(),
            execute_delay: self.0.execute_delay,
            statements: self.0.statements.clone(),
        }))
    }
}

#[async_trait]
impl DriverConnection for ScriptedConnection {
    async fn execute(
        &mut self,
        sql: &str,
        _params: &[serde_json::Value],
        deadline: Duration,
    ) -> Result<DriverQueryOutput> {
        self.statements.lock().unwrap().push(sql.to_string());
        if !self.execute_delay.is_zero() {
            if self.execute_delay > deadline {
                tokio::time::sleep(deadline).await;
                return Err(GatewayError::Timeout {
                    deadline_ms: deadline.as_millis() as u64,
                });
            }
            tokio::time::sleep(self.execute_delay).await;
        }
        Ok(DriverQueryOutput {
            columns: self.columns.clone(),
            rows: self.rows.clone(),
            rows_affected: self.rows.len() as u64,
        })
    }

    async fn list_resources(&mut self) -> Result<SchemaSnapshot> {
        Ok(SchemaSnapshot {
            tables: self.tables.clone(),
        })
    }

    async fn default_schema(&mut self) -> Result<Option<String>> {
        Ok(Some("public".to_string()))
    }

    async fn ping(&mut self) -> bool {
        true
    }

    async fn close(self: Box<Self>) {}
}

/// One scripted provider answer
#[derive(Clone)]
pub enum ProviderScript {
    Text(String),
    TerminalError,
}

/// Provider adapter that answers from a script
pub struct ScriptedProvider {
    id: String,
    script: Mutex<VecDeque<ProviderScript>>,
    /// Used when the script runs dry
    fallback: ProviderScript,
    pub calls: AtomicU32,
}

impl ScriptedProvider {
    pub fn always(id: &str, text: &str) -> Self {
        Self {
            id: id.to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback: ProviderScript::Text(text.to_string()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing(id: &str) -> Self {
        Self {
            id: id.to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback: ProviderScript::TerminalError,
            calls: AtomicU32::new(0),
        }
    }

    pub fn scripted(id: &str, steps: Vec<ProviderScript>, fallback: ProviderScript) -> Self {
        Self {
            id: id.to_string(),
            script: Mutex::new(steps.into()),
            fallback,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    async fn complete(
        &self,
        _prompt: &str,
        _options: &CompletionOptions,
        _deadline: Duration,
    ) -> provider_manager::ProviderResult<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match step {
            ProviderScript::Text(text) => Ok(Completion {
                text,
                usage: TokenUsage {
                    prompt_tokens: 120,
                    completion_tokens: 20,
                },
            }),
            ProviderScript::TerminalError => Err(provider_manager::ProviderError::Retriable {
                status: 503,
                message: "scripted outage".to_string(),
            }),
        }
    }

    async fn probe(&self) -> ProbeResult {
        ProbeResult::Healthy
    }
}

/// A gateway wired to scripted fakes, plus handles for inspection
pub struct Harness {
    pub gateway: Gateway,
    pub driver: Arc<ScriptedDriver>,
    pub audit: Arc<MemoryAuditSink>,
    pub dlq: Arc<InMemoryDlq>,
    pub notifications: Arc<MemoryNotificationSink>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(GatewayConfig::for_development(), ScriptedDriver::counting()).await
    }

    pub async fn with_config(config: GatewayConfig, driver: ScriptedDriver) -> Self {
        let driver = Arc::new(driver);
        let mut factory = ConnectorFactory::new();
        factory
            .register_plugin(Arc::new(ScriptedDriverHandle(driver.clone())) as Arc<dyn Driver>)
            .unwrap();

        let audit = Arc::new(MemoryAuditSink::new());
        let dlq = Arc::new(InMemoryDlq::new());
        let notifications = Arc::new(MemoryNotificationSink::new());

        let gateway = Gateway::with_parts(
            config,
            GatewayParts {
                factory,
                audit_sink: audit.clone(),
                cost_sink: None,
                notification_sinks: vec![notifications.clone()],
                dlq: dlq.clone(),
            },
        )
        .unwrap();

        Self {
            gateway,
            driver,
            audit,
            dlq,
            notifications,
        }
    }

    /// Register `analytics` with the scripted driver; returns its key
    pub async fn register_analytics(&self) -> String {
        let registration = self
            .gateway
            .register_agent(AgentSpec {
                agent_id: "analytics".to_string(),
                display_name: "Analytics agent".to_string(),
                agent_type: "reporting".to_string(),
                driver_kind: DriverKind::Plugin("scripted".to_string()),
                connection_name: "warehouse".to_string(),
                connection_params: ConnectionParams {
                    endpoints: vec![DatabaseEndpoint {
                        host: "db.internal".to_string(),
                        port: Some(5432),
                    }],
                    database: "sales".to_string(),
                    username: Some("reader".to_string()),
                    password: Some("secret".to_string()),
                    options: serde_json::Value::Null,
                },
                default_schema: Some("public".to_string()),
                endpoint_failure_threshold: 3,
            })
            .await
            .unwrap();
        registration.api_key_plaintext
    }

    /// Install a scripted provider and route the agent's calls to it
    pub async fn install_provider(&self, adapter: ScriptedProvider) {
        let id = adapter.provider_id().to_string();
        self.gateway
            .providers()
            .registry()
            .upsert(provider_config(&id))
            .unwrap();
        self.gateway
            .providers()
            .install_adapter(Arc::new(adapter))
            .await;
        self.gateway
            .providers()
            .set_default_provider(&id)
            .await
            .unwrap();
    }

    pub fn sql_request(key: &str, sql: &str) -> QueryRequest {
        QueryRequest {
            api_key: key.to_string(),
            payload: QueryPayload::Sql {
                text: sql.to_string(),
                params: Vec::new(),
            },
            as_dict: false,
            deadline_ms: Some(2_000),
        }
    }

    pub fn nl_request(key: &str, question: &str) -> QueryRequest {
        QueryRequest {
            api_key: key.to_string(),
            payload: QueryPayload::Nl {
                text: question.to_string(),
            },
            as_dict: false,
            deadline_ms: Some(2_000),
        }
    }
}

pub fn provider_config(id: &str) -> AiProviderConfig {
    AiProviderConfig {
        provider_id: id.to_string(),
        kind: ProviderKind::Local,
        endpoint: Some("http://localhost:11434".to_string()),
        model: format!("{}-model", id),
        credential_ref: None,
        rate_limits: RateLimits {
            per_minute: 10_000,
            per_hour: 100_000,
        },
        retry_policy: RetryPolicy {
            strategy: RetryStrategy::None,
            max_attempts: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            jitter: false,
        },
        version: 0,
        prompt_cost_per_1k: 0.01,
        completion_cost_per_1k: 0.03,
    }
}
