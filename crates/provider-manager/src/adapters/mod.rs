//! Provider adapter contract and adapter construction
//!
//! An adapter turns a prompt into a completion against one concrete
//! provider API. Everything above this seam (rate limiting, retries,
//! failover) is provider-agnostic.

pub mod anthropic;
pub mod local;
pub mod openai;

use crate::config::{AiProviderConfig, ProviderKind};
use crate::error::{ProviderError, ProviderResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Token accounting reported by a provider
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// A completed provider call
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

/// Options forwarded with a completion request
#[derive(Debug, Clone)]
pub struct CompletionOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    /// Instructions sent alongside the prompt, when the API separates them
    pub system: Option<String>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.0,
            system: None,
        }
    }
}

/// Result of an out-of-band health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    Healthy,
    Unhealthy,
}

/// One concrete provider API
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Identifier of the provider this adapter serves
    fn provider_id(&self) -> &str;

    /// Request a completion, observing `deadline`
    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
        deadline: Duration,
    ) -> ProviderResult<Completion>;

    /// Cheap liveness probe, used by the health checker
    async fn probe(&self) -> ProbeResult;
}

impl std::fmt::Debug for dyn ProviderAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dyn ProviderAdapter(provider_id={})", self.provider_id())
    }
}

/// Build the adapter for a provider configuration
///
/// Air-gapped admission is a construction-time guard: a non-admissible
/// configuration never yields an adapter, so no call path can reach a
/// forbidden endpoint.
pub fn build_adapter(
    config: &AiProviderConfig,
    air_gapped: bool,
) -> ProviderResult<Arc<dyn ProviderAdapter>> {
    if air_gapped && !config.admissible_air_gapped() {
        return Err(ProviderError::Blocked(format!(
            "provider '{}' (kind {}) cannot be constructed in air-gapped mode",
            config.provider_id, config.kind
        )));
    }

    let credential = config.resolve_credential()?;

    match config.kind {
        ProviderKind::Openai | ProviderKind::Custom => Ok(Arc::new(
            openai::OpenAiAdapter::new(config, credential)?,
        )),
        ProviderKind::Anthropic => Ok(Arc::new(anthropic::AnthropicAdapter::new(
            config, credential,
        )?)),
        ProviderKind::Local => Ok(Arc::new(local::LocalAdapter::new(config)?)),
    }
}

/// Shared reqwest client construction for adapters
pub(crate) fn build_http_client() -> ProviderResult<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| ProviderError::Config(format!("failed to build HTTP client: {}", e)))
}
