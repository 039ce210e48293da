//! The provider manager
//!
//! Routes every completion call through three layers: the per-provider
//! rate limiter, the per-provider retry policy, and the agent's
//! failover group. Internal recoveries (retries, failovers) never
//! surface to the caller; they are returned as recovery records for the
//! pipeline to audit.

use crate::adapters::{build_adapter, Completion, CompletionOptions, ProviderAdapter};
use crate::config::AiProviderConfig;
use crate::registry::ProviderRegistry;
use crate::error::{ProviderError, ProviderResult};
use crate::failover::{FailoverGroup, FailoverGroupConfig, SwitchRecord};
use crate::health::{HealthProber, SwitchEvents};
use crate::rate_limiter::ProviderRateLimiter;
use crate::retry::execute_with_retry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Outcome of a managed completion call
#[derive(Debug)]
pub struct CallOutcome {
    pub completion: Completion,
    /// Provider that ultimately served the call
    pub provider_id: String,
    pub model: String,
    /// Cost attributed from the provider's pricing configuration
    pub cost_usd: f64,
    /// Failovers performed while serving this call, for auditing
    pub failovers: Vec<SwitchRecord>,
}

/// Central router for AI provider calls
pub struct ProviderManager {
    registry: Arc<ProviderRegistry>,
    rate_limiter: ProviderRateLimiter,
    adapters: Arc<RwLock<HashMap<String, Arc<dyn ProviderAdapter>>>>,
    groups: Arc<RwLock<HashMap<String, Arc<FailoverGroup>>>>,
    /// Used when an agent has no failover group
    default_provider_id: RwLock<Option<String>>,
}

impl ProviderManager {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            rate_limiter: ProviderRateLimiter::new(),
            adapters: Arc::new(RwLock::new(HashMap::new())),
            groups: Arc::new(RwLock::new(HashMap::new())),
            default_provider_id: RwLock::new(None),
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Register a provider configuration and construct its adapter
    ///
    /// Air-gapped admission applies both in the registry and at adapter
    /// construction; a rejected provider leaves no state behind.
    pub async fn register_provider(
        &self,
        config: AiProviderConfig,
    ) -> ProviderResult<AiProviderConfig> {
        let stored = self.registry.upsert(config)?;
        let adapter = build_adapter(&stored, self.registry.air_gapped())?;

        self.adapters
            .write()
            .await
            .insert(stored.provider_id.clone(), adapter);
        // Fresh configuration, fresh buckets
        self.rate_limiter.forget(&stored.provider_id);

        Ok(stored)
    }

    /// Install a pre-built adapter (tests, plugins)
    pub async fn install_adapter(&self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters
            .write()
            .await
            .insert(adapter.provider_id().to_string(), adapter);
    }

    /// Set the provider used by agents without a failover group
    pub async fn set_default_provider(&self, provider_id: &str) -> ProviderResult<()> {
        // Must be registered
        self.registry.get(provider_id)?;
        *self.default_provider_id.write().await = Some(provider_id.to_string());
        Ok(())
    }

    /// Create or replace the failover group for an agent
    pub async fn set_failover_group(&self, config: FailoverGroupConfig) -> ProviderResult<()> {
        // Every member must be registered before the group can exist
        self.registry.get(&config.primary_provider_id)?;
        for backup in &config.ordered_backups {
            self.registry.get(backup)?;
        }

        let agent_id = config.agent_id.clone();
        self.groups
            .write()
            .await
            .insert(agent_id, Arc::new(FailoverGroup::new(config)));
        Ok(())
    }

    /// The failover group for an agent, if one exists
    pub async fn group_for(&self, agent_id: &str) -> Option<Arc<FailoverGroup>> {
        self.groups.read().await.get(agent_id).cloned()
    }

    /// Remove all provider state owned by an agent
    pub async fn remove_agent(&self, agent_id: &str) {
        self.groups.write().await.remove(agent_id);
    }

    /// Start background health probing
    pub fn spawn_health_prober(&self, interval: Duration) -> (HealthProber, SwitchEvents) {
        HealthProber::spawn(self.groups.clone(), self.adapters.clone(), interval)
    }

    /// Complete a prompt for an agent
    ///
    /// Candidate order comes from the agent's failover group (active
    /// provider first) or the default provider. Per candidate: rate
    /// limit, then retry per its policy. Rate limits propagate to the
    /// caller immediately; terminal failures advance to the next
    /// candidate and are reported in the outcome's `failovers`.
    pub async fn complete(
        &self,
        agent_id: &str,
        prompt: &str,
        options: &CompletionOptions,
        deadline: Duration,
    ) -> ProviderResult<CallOutcome> {
        let group = self.group_for(agent_id).await;
        let candidates = match &group {
            Some(group) => group.candidates().await,
            None => match self.default_provider_id.read().await.clone() {
                Some(provider_id) => vec![provider_id],
                None => {
                    return Err(ProviderError::Config(format!(
                        "agent '{}' has no failover group and no default provider is set",
                        agent_id
                    )))
                }
            },
        };

        let mut failovers = Vec::new();
        let mut last_error: Option<ProviderError> = None;

        for provider_id in candidates {
            let config = self.registry.get(&provider_id)?;

            // Air-gapped policy is also enforced per call: a registry
            // toggled after registration must not leak calls out.
            if self.registry.air_gapped() && !config.admissible_air_gapped() {
                return Err(ProviderError::Blocked(format!(
                    "provider '{}' is not admissible in air-gapped mode",
                    provider_id
                )));
            }

            if let Err(e) = self.rate_limiter.check(&provider_id, config.rate_limits) {
                // The caller decides whether to wait; queuing here would
                // hide the backpressure signal.
                return Err(e);
            }

            let adapter = {
                let guard = self.adapters.read().await;
                guard.get(&provider_id).cloned()
            }
            .ok_or_else(|| {
                ProviderError::Config(format!("no adapter installed for '{}'", provider_id))
            })?;

            let result = execute_with_retry(&config.retry_policy, &provider_id, || {
                adapter.complete(prompt, options, deadline)
            })
            .await;

            match result {
                Ok(completion) => {
                    if let Some(group) = &group {
                        group.record_success(&provider_id).await;
                    }
                    let cost_usd = attribute_cost(&config, &completion);
                    metrics::counter!("provider_calls_total", "outcome" => "ok").increment(1);
                    return Ok(CallOutcome {
                        completion,
                        provider_id,
                        model: config.model,
                        cost_usd,
                        failovers,
                    });
                }
                Err(e) if matches!(e, ProviderError::RateLimited { .. }) => return Err(e),
                Err(e) if matches!(e, ProviderError::Client { .. }) => {
                    // The prompt itself is bad; another provider will not fix it
                    metrics::counter!("provider_calls_total", "outcome" => "client_error")
                        .increment(1);
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        agent_id = agent_id,
                        provider_id = %provider_id,
                        error = %e,
                        "Provider failed terminally, trying next candidate"
                    );
                    if let Some(group) = &group {
                        if let Some(switch) = group.record_failure(&provider_id).await {
                            failovers.push(switch);
                        }
                    }
                    last_error = Some(e);
                }
            }
        }

        metrics::counter!("provider_calls_total", "outcome" => "exhausted").increment(1);
        Err(ProviderError::Exhausted(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no candidate providers".to_string()),
        ))
    }
}

/// Token-based cost attribution from the provider's pricing
fn attribute_cost(config: &AiProviderConfig, completion: &Completion) -> f64 {
    let prompt = completion.usage.prompt_tokens as f64 / 1000.0 * config.prompt_cost_per_1k;
    let generated =
        completion.usage.completion_tokens as f64 / 1000.0 * config.completion_cost_per_1k;
    prompt + generated
}
