//! The query pipeline
//!
//! Orchestrates every inbound call through the fixed stage order:
//! authenticate → intake → parse → permit → execute → audit → cost.
//! Any stage may short-circuit with a structured error; audit and cost
//! records are written for every authenticated call (success or
//! failure) before the response is returned. A failed authentication
//! is recorded as an authentication event only.

use crate::audit::{AuditLogger, AuditSink, MemoryAuditSink};
use crate::classify::{is_fatal_execute, similar_resources};
use crate::connectors::pool::PoolSet;
use crate::connectors::ConnectorFactory;
use crate::cost::{CostSink, CostTracker, JsonlCostSink, NotificationSink};
use crate::dlq::{DeadLetterQueue, DlqEntry, InMemoryDlq, RedisDlq};
use crate::inspector::{SqlInspection, SqlInspector};
use crate::nl2sql::NlSqlConverter;
use crate::permissions::PermissionStore;
use crate::registry::{AgentRegistry, AgentSpec, Registration, RegistryError};
use crate::vault::CredentialVault;
use dashmap::DashMap;
use provider_manager::{
    AiProviderConfig, ProviderManager, ProviderRegistry, SwitchRecord,
};
use shared::config::SinkConfig;
use shared::models::*;
use shared::{ErrorReport, GatewayConfig, GatewayError};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Pluggable pieces of a gateway
pub struct GatewayParts {
    pub factory: ConnectorFactory,
    pub audit_sink: Arc<dyn AuditSink>,
    pub cost_sink: Option<Arc<dyn CostSink>>,
    pub notification_sinks: Vec<Arc<dyn NotificationSink>>,
    pub dlq: Arc<dyn DeadLetterQueue>,
}

/// Mutable per-call bookkeeping gathered across stages
#[derive(Default)]
struct CallTelemetry {
    statement_kind: Option<StatementKind>,
    tables: Vec<String>,
    denied: Vec<String>,
    execution_ms: Option<u64>,
    generation_confidence: Option<f64>,
    cancelled: bool,
}

/// The gateway: pipeline plus the management plane around it
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<AgentRegistry>,
    permissions: Arc<PermissionStore>,
    pools: Arc<PoolSet>,
    providers: Arc<ProviderManager>,
    converter: NlSqlConverter,
    audit: AuditLogger,
    costs: Arc<CostTracker>,
    dlq: Arc<dyn DeadLetterQueue>,
    /// USD per second of database execution, when configured per agent
    execution_rates: DashMap<String, f64>,
}

impl Gateway {
    /// Build a gateway with sinks taken from configuration
    pub async fn new(config: GatewayConfig) -> shared::Result<Self> {
        let audit_sink: Arc<dyn AuditSink> = match &config.audit_sink {
            SinkConfig::Memory => Arc::new(MemoryAuditSink::new()),
            SinkConfig::Jsonl { path } => Arc::new(crate::audit::JsonlAuditSink::new(path)),
            SinkConfig::Redis { .. } => {
                return Err(GatewayError::config("audit sink does not support redis"))
            }
        };
        let cost_sink: Option<Arc<dyn CostSink>> = match &config.cost_sink {
            SinkConfig::Memory => None,
            SinkConfig::Jsonl { path } => Some(Arc::new(JsonlCostSink::new(path))),
            SinkConfig::Redis { .. } => {
                return Err(GatewayError::config("cost sink does not support redis"))
            }
        };
        let dlq: Arc<dyn DeadLetterQueue> = match &config.dlq_sink {
            SinkConfig::Redis { url, key } => Arc::new(RedisDlq::connect(url, key).await?),
            _ => Arc::new(InMemoryDlq::new()),
        };

        Self::with_parts(
            config,
            GatewayParts {
                factory: ConnectorFactory::new(),
                audit_sink,
                cost_sink,
                notification_sinks: Vec::new(),
                dlq,
            },
        )
    }

    /// Build a gateway from explicit parts (tests, embedders)
    pub fn with_parts(config: GatewayConfig, parts: GatewayParts) -> shared::Result<Self> {
        let vault = Arc::new(CredentialVault::from_config(&config)?);
        let registry = Arc::new(AgentRegistry::new(vault));
        let permissions = Arc::new(PermissionStore::new());
        let pools = Arc::new(PoolSet::new(Arc::new(parts.factory), config.pool.clone()));
        let provider_registry = Arc::new(ProviderRegistry::new(config.air_gapped));
        let providers = Arc::new(ProviderManager::new(provider_registry));
        let converter = NlSqlConverter::new(providers.clone());
        let audit = AuditLogger::new(parts.audit_sink);
        let costs = Arc::new(CostTracker::with_record_sink(
            parts.notification_sinks,
            parts.cost_sink,
        ));

        Ok(Self {
            config,
            registry,
            permissions,
            pools,
            providers,
            converter,
            audit,
            costs,
            dlq: parts.dlq,
            execution_rates: DashMap::new(),
        })
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn permissions(&self) -> &PermissionStore {
        &self.permissions
    }

    pub fn providers(&self) -> &ProviderManager {
        &self.providers
    }

    pub fn costs(&self) -> &CostTracker {
        &self.costs
    }

    pub fn pools(&self) -> &Arc<PoolSet> {
        &self.pools
    }

    pub fn dlq(&self) -> &Arc<dyn DeadLetterQueue> {
        &self.dlq
    }

    /// Configure the per-agent execution rate used for SQL cost
    pub fn set_execution_rate(&self, agent_id: &str, usd_per_second: f64) {
        self.execution_rates
            .insert(agent_id.to_string(), usd_per_second);
    }

    /// Spawn the idle-connection sweeper over all agent pools
    pub fn spawn_pool_sweeper(
        &self,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        self.pools.spawn_sweeper(interval, cancel)
    }

    /// Default rate limits and retry policy for new providers
    ///
    /// Surface layers seed `AiProviderConfig` from these when the
    /// operator did not override them per provider.
    pub fn provider_defaults(
        &self,
    ) -> (provider_manager::RateLimits, provider_manager::RetryPolicy) {
        use shared::config::RetryStrategyKind;

        let limits = provider_manager::RateLimits {
            per_minute: self.config.rate_limit.per_minute,
            per_hour: self.config.rate_limit.per_hour,
        };
        let retry = provider_manager::RetryPolicy {
            strategy: match self.config.retry.strategy {
                RetryStrategyKind::None => provider_manager::RetryStrategy::None,
                RetryStrategyKind::Fixed => provider_manager::RetryStrategy::Fixed,
                RetryStrategyKind::Linear => provider_manager::RetryStrategy::Linear,
                RetryStrategyKind::Exponential => provider_manager::RetryStrategy::Exponential,
            },
            max_attempts: self.config.retry.max_attempts,
            base_delay: self.config.retry.base_delay,
            max_delay: self.config.retry.max_delay,
            jitter: self.config.retry.jitter,
        };
        (limits, retry)
    }

    // ----- management plane -----

    /// Register an agent with its binding; audited
    pub async fn register_agent(
        &self,
        spec: AgentSpec,
    ) -> Result<Registration, RegistryError> {
        let registration = self.registry.register(spec)?;
        self.audit
            .append(AuditEvent::new(
                Some(&registration.agent.agent_id),
                ActionKind::AgentRegistered,
                AuditStatus::Ok,
                registration.agent.display_name.clone(),
                serde_json::json!({"agent_type": registration.agent.agent_type}),
            ))
            .await;
        Ok(registration)
    }

    /// Revoke an agent: tombstones it, cascades to permissions, keys,
    /// pools, and provider groups; audited
    pub async fn revoke_agent(&self, agent_id: &str) -> Result<(), RegistryError> {
        self.registry.revoke(agent_id)?;
        self.permissions.revoke_agent(agent_id);
        self.pools.close_agent(agent_id).await;
        self.providers.remove_agent(agent_id).await;

        self.audit
            .append(AuditEvent::new(
                Some(agent_id),
                ActionKind::AgentRevoked,
                AuditStatus::Ok,
                "revocation cascade complete",
                serde_json::json!({}),
            ))
            .await;
        Ok(())
    }

    /// Replace an agent's binding and invalidate its pooled connections
    pub async fn update_binding(
        &self,
        agent_id: &str,
        driver_kind: DriverKind,
        connection_name: String,
        params: &ConnectionParams,
        default_schema: Option<String>,
        endpoint_failure_threshold: u32,
    ) -> Result<DatabaseBinding, RegistryError> {
        let binding = self.registry.update_binding(
            agent_id,
            driver_kind,
            connection_name,
            params,
            default_schema,
            endpoint_failure_threshold,
        )?;
        self.pools.close_agent(agent_id).await;

        self.audit
            .append(AuditEvent::new(
                Some(agent_id),
                ActionKind::BindingUpdated,
                AuditStatus::Ok,
                binding.connection_name.clone(),
                serde_json::json!({"driver_kind": binding.driver_kind}),
            ))
            .await;
        Ok(binding)
    }

    /// Grant capabilities on a resource; audited
    pub async fn grant_permission(
        &self,
        agent_id: &str,
        resource_id: &str,
        resource_kind: ResourceKind,
        capabilities: BTreeSet<Capability>,
    ) {
        self.permissions
            .set(agent_id, resource_id, resource_kind, capabilities.clone());
        self.audit
            .append(AuditEvent::new(
                Some(agent_id),
                ActionKind::PermissionChanged,
                AuditStatus::Ok,
                resource_id.to_string(),
                serde_json::json!({"caps": capabilities, "resource_kind": resource_kind}),
            ))
            .await;
    }

    /// Register an AI provider; air-gapped violations surface as
    /// `blocked` and leave nothing stored
    pub async fn register_provider(
        &self,
        config: AiProviderConfig,
    ) -> Result<AiProviderConfig, ErrorReport> {
        let provider_id = config.provider_id.clone();
        match self.providers.register_provider(config).await {
            Ok(stored) => {
                self.audit
                    .append(AuditEvent::new(
                        None,
                        ActionKind::ProviderRegistered,
                        AuditStatus::Ok,
                        stored.provider_id.clone(),
                        serde_json::json!({"kind": stored.kind, "version": stored.version}),
                    ))
                    .await;
                Ok(stored)
            }
            Err(e) => {
                let err = crate::classify::classify_provider_error(e);
                self.audit
                    .append(AuditEvent::new(
                        None,
                        ActionKind::ProviderRegistered,
                        AuditStatus::Blocked,
                        provider_id,
                        serde_json::json!({"error": err.kind()}),
                    ))
                    .await;
                Err(ErrorReport::from_error(&err, None))
            }
        }
    }

    // ----- the pipeline -----

    /// Handle one query request
    pub async fn handle(&self, request: QueryRequest) -> Result<QueryResult, ErrorReport> {
        self.handle_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Handle one query request with caller-driven cancellation
    pub async fn handle_with_cancel(
        &self,
        request: QueryRequest,
        cancel: CancellationToken,
    ) -> Result<QueryResult, ErrorReport> {
        let action_kind = match request.payload {
            QueryPayload::Sql { .. } => ActionKind::SqlQuery,
            QueryPayload::Nl { .. } => ActionKind::NlQuery,
        };
        let mut ctx = CallContext::new(action_kind);
        let mut telemetry = CallTelemetry::default();

        // Stage 1: authenticate. Failure here is recorded as an
        // authentication event only, per the audit contract.
        let agent_id = match self.registry.authenticate(&request.api_key) {
            Ok(agent_id) => agent_id,
            Err(e) => {
                let err = match e {
                    RegistryError::Revoked => GatewayError::Revoked,
                    _ => GatewayError::Auth,
                };
                metrics::counter!("queries_total", "outcome" => "auth_failed").increment(1);
                self.audit
                    .append(AuditEvent::new(
                        None,
                        ActionKind::Authentication,
                        AuditStatus::Error,
                        "api key rejected",
                        serde_json::json!({"error": err.kind()}),
                    ))
                    .await;
                return Err(ErrorReport::from_error(&err, None));
            }
        };
        ctx.agent_id = Some(agent_id.clone());

        let deadline = request
            .deadline_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.default_deadline);
        let started = Instant::now();

        let outcome = self
            .run_stages(&request, &agent_id, deadline, started, &cancel, &mut ctx, &mut telemetry)
            .await;

        // Stages 6 and 7 run for every authenticated call, success or
        // failure, before the response leaves the gateway.
        self.emit_audit(&ctx, &telemetry, &outcome).await;
        self.emit_cost(&ctx, &telemetry).await;

        match outcome {
            Ok(result) => {
                metrics::counter!("queries_total", "outcome" => "ok").increment(1);
                Ok(result)
            }
            Err(err) => {
                metrics::counter!("queries_total", "outcome" => err.kind().as_str().to_string())
                    .increment(1);
                Err(ErrorReport::from_error(&err, ctx.generated_sql.as_deref()))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_stages(
        &self,
        request: &QueryRequest,
        agent_id: &str,
        deadline: Duration,
        started: Instant,
        cancel: &CancellationToken,
        ctx: &mut CallContext,
        telemetry: &mut CallTelemetry,
    ) -> shared::Result<QueryResult> {
        if deadline.is_zero() {
            return Err(GatewayError::Timeout { deadline_ms: 0 });
        }

        let binding = self
            .registry
            .binding(agent_id)
            .map_err(|_| GatewayError::internal("binding missing for live agent"))?;
        let params = self
            .registry
            .connection_params(&binding)
            .map_err(|_| GatewayError::internal("binding credentials unreadable"))?;

        let default_schema = effective_default_schema(&binding, &params);
        let resource_kind = resource_kind_for(&binding.driver_kind);

        // Stage 2: intake. NL calls generate SQL here; the generated
        // text is captured for every subsequent record.
        let (statement, inspection) = match &request.payload {
            QueryPayload::Sql { text, .. } => {
                // Stage 3: parse
                let inspection = if binding.driver_kind == DriverKind::Mongo {
                    let query: serde_json::Value =
                        serde_json::from_str(text).map_err(|e| GatewayError::Parse {
                            detail: format!("document query is not valid JSON: {}", e),
                            generated_sql: None,
                        })?;
                    SqlInspector::inspect_document(&query)?
                } else {
                    SqlInspector::inspect(text, &binding.driver_kind, default_schema.as_deref())?
                };
                (text.clone(), inspection)
            }
            QueryPayload::Nl { text } => {
                if binding.driver_kind == DriverKind::Mongo {
                    // Generated SQL cannot run on a document store
                    return Err(GatewayError::Parse {
                        detail: "natural-language calls are not supported for document stores"
                            .to_string(),
                        generated_sql: None,
                    });
                }

                let (snapshot, all_tables) = self
                    .readable_snapshot(agent_id, &binding, &params, resource_kind, deadline)
                    .await?;

                let remaining = remaining_deadline(deadline, started)?;
                let generated = self
                    .converter
                    .convert(
                        agent_id,
                        text,
                        &snapshot,
                        &binding.driver_kind,
                        default_schema.as_deref(),
                        remaining,
                    )
                    .await?;

                ctx.generated_sql = Some(generated.sql.clone());
                ctx.provider_id = Some(generated.provider_id.clone());
                ctx.model = Some(generated.model.clone());
                ctx.prompt_tokens = Some(generated.usage.prompt_tokens);
                ctx.completion_tokens = Some(generated.usage.completion_tokens);
                ctx.provider_cost = Some(generated.cost_usd);
                telemetry.generation_confidence = Some(generated.confidence);

                self.audit_provider_failovers(agent_id, &generated.failovers)
                    .await;

                // Tables the model invented are caught before permit so
                // the caller gets a name suggestion instead of a denial.
                // Tables that exist but are forbidden fall through to
                // the permit stage and come back as denials.
                reject_unknown_tables(
                    &generated.inspection,
                    &snapshot,
                    &all_tables,
                    resource_kind,
                )?;

                (generated.sql.clone(), generated.inspection)
            }
        };

        telemetry.statement_kind = Some(inspection.statement_kind);
        telemetry.tables = inspection.tables.clone();

        // Stage 4: permit
        let required = inspection
            .statement_kind
            .required_capability()
            .ok_or_else(|| GatewayError::internal("unmapped statement kind"))?;

        let decision = self.permissions.check_batch(
            agent_id,
            inspection
                .tables
                .iter()
                .map(|t| (t.as_str(), resource_kind, required)),
        );
        if !decision.all_allowed() {
            let denied: Vec<String> = decision.denied.iter().cloned().collect();
            telemetry.denied = denied.clone();
            metrics::counter!("queries_denied_total").increment(1);
            return Err(GatewayError::PermissionDenied {
                denied,
                generated_sql: ctx.generated_sql.clone(),
            });
        }

        // Stage 5: execute
        if cancel.is_cancelled() {
            // Cancelled before execution: no DB work is issued
            telemetry.cancelled = true;
            return Err(GatewayError::Cancelled);
        }

        let remaining = remaining_deadline(deadline, started)?;
        let acquire_timeout = self.config.pool.acquire_timeout.min(remaining);
        let (mut handle, endpoint_failovers) = self
            .pools
            .acquire(agent_id, &binding, &params, acquire_timeout)
            .await?;
        self.audit_endpoint_failovers(&endpoint_failovers).await;

        let bind_params = match &request.payload {
            QueryPayload::Sql { params, .. } => params.clone(),
            QueryPayload::Nl { .. } => Vec::new(),
        };

        let remaining = match remaining_deadline(deadline, started) {
            Ok(remaining) => remaining,
            Err(e) => {
                self.pools.release(handle, true).await;
                return Err(e);
            }
        };

        let exec_started = Instant::now();
        let exec_result = {
            let fut = handle.conn().execute(&statement, &bind_params, remaining);
            tokio::pin!(fut);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = &mut fut => Some(result),
            }
        };
        let execution_ms = exec_started.elapsed().as_millis() as u64;
        telemetry.execution_ms = Some(execution_ms);

        let Some(exec_result) = exec_result else {
            // Cancelled mid-execution: the statement may still be
            // running, so the connection is discarded
            telemetry.cancelled = true;
            self.pools.release(handle, true).await;
            return Err(GatewayError::Cancelled);
        };

        match exec_result {
            Ok(output) => {
                self.pools.release(handle, false).await;
                Ok(QueryResult {
                    row_count: output.rows.len(),
                    rows: output.rows,
                    columns: output.columns,
                    execution_ms,
                    generated_sql: ctx.generated_sql.clone(),
                    tables_touched: inspection.tables.iter().cloned().collect(),
                })
            }
            Err(err) => {
                self.pools.release(handle, is_fatal_execute(&err)).await;
                Err(self.park_if_unrecoverable(ctx, agent_id, &statement, err).await)
            }
        }
    }

    /// Schema snapshot filtered to the agent's readable resources
    ///
    /// Returns the filtered snapshot (the only thing a provider may
    /// see) and the normalized names of every table that exists, which
    /// the unknown-table check needs.
    async fn readable_snapshot(
        &self,
        agent_id: &str,
        binding: &DatabaseBinding,
        params: &ConnectionParams,
        resource_kind: ResourceKind,
        deadline: Duration,
    ) -> shared::Result<(SchemaSnapshot, BTreeSet<String>)> {
        let acquire_timeout = self.config.pool.acquire_timeout.min(deadline);
        let (mut handle, endpoint_failovers) = self
            .pools
            .acquire(agent_id, binding, params, acquire_timeout)
            .await?;
        self.audit_endpoint_failovers(&endpoint_failovers).await;

        let result = handle.conn().list_resources().await;
        match result {
            Ok(mut snapshot) => {
                self.pools.release(handle, false).await;
                let all_tables: BTreeSet<String> = snapshot
                    .tables
                    .iter()
                    .map(|table| PermissionStore::normalize(&table.name, resource_kind))
                    .collect();
                let readable = self
                    .permissions
                    .resources_with(agent_id, Capability::Read);
                snapshot.tables.retain(|table| {
                    readable.contains(&PermissionStore::normalize(&table.name, resource_kind))
                });
                Ok((snapshot, all_tables))
            }
            Err(e) => {
                self.pools.release(handle, is_fatal_execute(&e)).await;
                Err(e)
            }
        }
    }

    async fn audit_provider_failovers(&self, agent_id: &str, failovers: &[SwitchRecord]) {
        for switch in failovers {
            self.audit
                .append(AuditEvent::new(
                    Some(agent_id),
                    ActionKind::ProviderFailover,
                    AuditStatus::Ok,
                    format!("{} -> {}", switch.from_provider, switch.to_provider),
                    serde_json::json!({
                        "reason": switch.reason,
                        "recovered_internally": true,
                    }),
                ))
                .await;
        }
    }

    async fn audit_endpoint_failovers(
        &self,
        failovers: &[crate::connectors::EndpointFailover],
    ) {
        for failover in failovers {
            self.audit
                .append(AuditEvent::new(
                    Some(&failover.agent_id),
                    ActionKind::DbFailover,
                    AuditStatus::Ok,
                    format!("{} -> {}", failover.from, failover.to),
                    serde_json::json!({"recovered_internally": true}),
                ))
                .await;
        }
    }

    /// Park terminally failed queries in the DLQ, attaching the ref
    async fn park_if_unrecoverable(
        &self,
        ctx: &CallContext,
        agent_id: &str,
        statement: &str,
        err: GatewayError,
    ) -> GatewayError {
        let kind = err.kind();
        if !matches!(
            kind,
            shared::ErrorKind::Execute | shared::ErrorKind::ProviderUnavailable
        ) {
            return err;
        }

        let entry = DlqEntry::new(
            &ctx.call_id,
            agent_id,
            statement,
            kind,
            err.to_string(),
        );
        let entry_ref = entry.entry_ref.clone();
        if let Err(push_err) = self.dlq.push(entry).await {
            tracing::error!(error = %push_err, "Dead-letter push failed");
            return err;
        }

        match err {
            GatewayError::Execute {
                detail, subkind, ..
            } => GatewayError::Execute {
                detail,
                subkind,
                dead_letter_ref: Some(entry_ref),
            },
            GatewayError::ProviderUnavailable { detail, .. } => {
                GatewayError::ProviderUnavailable {
                    detail,
                    dead_letter_ref: Some(entry_ref),
                }
            }
            other => other,
        }
    }

    async fn emit_audit(
        &self,
        ctx: &CallContext,
        telemetry: &CallTelemetry,
        outcome: &shared::Result<QueryResult>,
    ) {
        let status = match outcome {
            Ok(_) => AuditStatus::Ok,
            Err(e) if telemetry.cancelled => {
                debug_assert_eq!(e.kind(), shared::ErrorKind::Cancelled);
                AuditStatus::Cancelled
            }
            Err(GatewayError::PermissionDenied { .. }) => AuditStatus::Denied,
            Err(GatewayError::Blocked { .. }) => AuditStatus::Blocked,
            Err(_) => AuditStatus::Error,
        };

        let mut details = serde_json::json!({
            "call_id": ctx.call_id,
            "tables_touched": telemetry.tables,
            "statement_kind": telemetry.statement_kind.map(|k| k.to_string()),
        });
        if !telemetry.denied.is_empty() {
            details["denied_resources"] = serde_json::json!(telemetry.denied);
        }
        if let Some(ms) = telemetry.execution_ms {
            details["execution_ms"] = serde_json::json!(ms);
        }
        if let Some(ref sql) = ctx.generated_sql {
            details["generated_sql"] = serde_json::json!(sql);
        }
        if let Some(confidence) = telemetry.generation_confidence {
            details["generation_confidence"] = serde_json::json!(confidence);
        }
        if let Err(e) = outcome {
            details["error_kind"] = serde_json::json!(e.kind());
        }

        let subject = telemetry
            .statement_kind
            .map(|k| k.to_string())
            .unwrap_or_else(|| "unparsed".to_string());

        self.audit
            .append(AuditEvent::new(
                ctx.agent_id.as_deref(),
                ctx.action_kind,
                status,
                subject,
                details,
            ))
            .await;
    }

    async fn emit_cost(&self, ctx: &CallContext, telemetry: &CallTelemetry) {
        let Some(ref agent_id) = ctx.agent_id else {
            return;
        };

        let rate = self
            .execution_rates
            .get(agent_id.as_str())
            .map(|r| *r)
            .unwrap_or(0.0);
        let db_cost = telemetry.execution_ms.unwrap_or(0) as f64 / 1000.0 * rate;
        let provider_cost = ctx.provider_cost.unwrap_or(0.0);

        let operation_kind = match ctx.action_kind {
            ActionKind::NlQuery => OperationKind::NlQuery,
            _ => OperationKind::SqlQuery,
        };

        self.costs
            .record(CostRecord {
                call_id: ctx.call_id.clone(),
                timestamp: chrono::Utc::now(),
                agent_id: agent_id.clone(),
                provider_id: ctx.provider_id.clone(),
                model: ctx.model.clone(),
                prompt_tokens: ctx.prompt_tokens,
                completion_tokens: ctx.completion_tokens,
                cost_usd: db_cost + provider_cost,
                operation_kind,
            })
            .await;
    }
}

/// NL-generated tables must exist in the database
///
/// Suggestions come from the readable snapshot only, so the report
/// cannot leak names the agent is not allowed to see.
fn reject_unknown_tables(
    inspection: &SqlInspection,
    readable: &SchemaSnapshot,
    all_tables: &BTreeSet<String>,
    resource_kind: ResourceKind,
) -> shared::Result<()> {
    let readable_names: Vec<String> = readable.tables.iter().map(|t| t.name.clone()).collect();

    for table in &inspection.tables {
        let normalized = PermissionStore::normalize(table, resource_kind);
        if !all_tables.contains(&normalized) {
            return Err(GatewayError::SchemaUnknown {
                resource: table.clone(),
                suggestions: similar_resources(table, &readable_names, 3),
            });
        }
    }
    Ok(())
}

fn effective_default_schema(
    binding: &DatabaseBinding,
    params: &ConnectionParams,
) -> Option<String> {
    binding
        .default_schema
        .clone()
        .or_else(|| {
            binding
                .driver_kind
                .fallback_schema()
                .map(|s| s.to_string())
        })
        .or_else(|| match binding.driver_kind {
            // MySQL and BigQuery scope tables by database/dataset name
            DriverKind::Mysql | DriverKind::Bigquery => Some(params.database.clone()),
            _ => None,
        })
}

fn resource_kind_for(driver: &DriverKind) -> ResourceKind {
    match driver {
        DriverKind::Mongo => ResourceKind::Collection,
        DriverKind::Bigquery => ResourceKind::Dataset,
        _ => ResourceKind::Table,
    }
}

fn remaining_deadline(deadline: Duration, started: Instant) -> shared::Result<Duration> {
    let remaining = deadline.saturating_sub(started.elapsed());
    if remaining.is_zero() {
        Err(GatewayError::Timeout {
            deadline_ms: deadline.as_millis() as u64,
        })
    } else {
        Ok(remaining)
    }
}
