//! Versioned provider registry
//!
//! Configurations are versioned: every upsert retains the previous
//! version so an operator can roll back a bad model or endpoint change.
//! Air-gapped admission is enforced here, at registration time, and
//! re-checked by the manager at every call site.

use crate::config::AiProviderConfig;
use crate::error::{ProviderError, ProviderResult};
use std::collections::HashMap;
use std::sync::RwLock;

/// Versioned provider registry
///
/// Current configurations are served from a snapshot map; superseded
/// versions are retained for rollback.
pub struct ProviderRegistry {
    air_gapped: bool,
    inner: RwLock<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    current: HashMap<String, AiProviderConfig>,
    history: HashMap<String, Vec<AiProviderConfig>>,
}

impl ProviderRegistry {
    pub fn new(air_gapped: bool) -> Self {
        Self {
            air_gapped,
            inner: RwLock::new(RegistryState::default()),
        }
    }

    /// Whether the registry enforces air-gapped admission
    pub fn air_gapped(&self) -> bool {
        self.air_gapped
    }

    /// Register or update a provider configuration
    ///
    /// The stored version is bumped past the current one; the previous
    /// configuration moves into the rollback history.
    pub fn upsert(&self, mut config: AiProviderConfig) -> ProviderResult<AiProviderConfig> {
        if self.air_gapped && !config.admissible_air_gapped() {
            metrics::counter!("provider_registrations_blocked_total").increment(1);
            return Err(ProviderError::Blocked(format!(
                "provider kind '{}' is not admissible in air-gapped mode",
                config.kind
            )));
        }

        let mut state = self.inner.write().expect("registry lock poisoned");
        let next_version = state
            .current
            .get(&config.provider_id)
            .map(|c| c.version + 1)
            .unwrap_or(1);
        config.version = next_version;

        if let Some(prev) = state.current.insert(config.provider_id.clone(), config.clone()) {
            state
                .history
                .entry(prev.provider_id.clone())
                .or_default()
                .push(prev);
        }

        tracing::info!(
            provider_id = %config.provider_id,
            kind = %config.kind,
            version = config.version,
            "Provider configuration stored"
        );

        Ok(config)
    }

    /// Fetch the current configuration for a provider
    pub fn get(&self, provider_id: &str) -> ProviderResult<AiProviderConfig> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .current
            .get(provider_id)
            .cloned()
            .ok_or_else(|| {
                ProviderError::Config(format!("provider '{}' is not registered", provider_id))
            })
    }

    /// List current configurations
    pub fn list(&self) -> Vec<AiProviderConfig> {
        let state = self.inner.read().expect("registry lock poisoned");
        let mut configs: Vec<_> = state.current.values().cloned().collect();
        configs.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        configs
    }

    /// Restore a prior version as current
    ///
    /// The displaced current version joins the history, so rollbacks are
    /// themselves reversible.
    pub fn rollback(&self, provider_id: &str, version: u32) -> ProviderResult<AiProviderConfig> {
        let mut state = self.inner.write().expect("registry lock poisoned");

        let idx = state
            .history
            .get(provider_id)
            .and_then(|versions| versions.iter().position(|c| c.version == version))
            .ok_or_else(|| {
                ProviderError::Config(format!(
                    "no version {} in history for provider '{}'",
                    version, provider_id
                ))
            })?;

        let restored = state.history.get_mut(provider_id).expect("checked above")[idx].clone();
        let current_version = state
            .current
            .get(provider_id)
            .map(|c| c.version)
            .unwrap_or(0);

        let mut reinstated = restored;
        reinstated.version = current_version + 1;

        if let Some(prev) = state
            .current
            .insert(provider_id.to_string(), reinstated.clone())
        {
            state
                .history
                .entry(provider_id.to_string())
                .or_default()
                .push(prev);
        }

        tracing::info!(
            provider_id = provider_id,
            restored_from = version,
            new_version = reinstated.version,
            "Provider configuration rolled back"
        );

        Ok(reinstated)
    }
}
