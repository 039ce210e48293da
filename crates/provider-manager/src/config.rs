//! Provider configuration types
//!
//! The records an operator registers per provider: kind, endpoint,
//! model, credential reference, rate limits, retry policy, and pricing.
//! Versioned storage of these records lives in [`crate::registry`].

use crate::error::{ProviderError, ProviderResult};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Kinds of AI providers the gateway can dispatch to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Openai,
    Anthropic,
    /// A locally hosted model (Ollama-compatible API)
    Local,
    /// An arbitrary OpenAI-compatible endpoint
    Custom,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderKind::Openai => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Local => "local",
            ProviderKind::Custom => "custom",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::Openai),
            "anthropic" => Ok(ProviderKind::Anthropic),
            "local" => Ok(ProviderKind::Local),
            "custom" => Ok(ProviderKind::Custom),
            other => Err(format!("unknown provider kind: {}", other)),
        }
    }
}

/// Per-provider rate limits over two horizons
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimits {
    pub per_minute: u32,
    pub per_hour: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            per_minute: 60,
            per_hour: 1000,
        }
    }
}

/// Retry strategy for a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    None,
    Fixed,
    Linear,
    Exponential,
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub strategy: RetryStrategy,
    /// Total attempts including the first
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    /// Randomize each delay by up to ±50%
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: true,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// One version of a provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiProviderConfig {
    /// Stable identifier, unique across the registry
    pub provider_id: String,
    pub kind: ProviderKind,
    /// Base endpoint; required for local/custom, optional override for
    /// hosted kinds
    pub endpoint: Option<String>,
    pub model: String,
    /// Name of the environment variable holding the API credential.
    /// The raw credential itself is never stored in the registry.
    pub credential_ref: Option<String>,
    #[serde(default)]
    pub rate_limits: RateLimits,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    /// Monotonically increasing, managed by the registry
    #[serde(default)]
    pub version: u32,
    /// USD per 1k prompt tokens, for cost attribution
    #[serde(default)]
    pub prompt_cost_per_1k: f64,
    /// USD per 1k completion tokens
    #[serde(default)]
    pub completion_cost_per_1k: f64,
}

impl AiProviderConfig {
    /// Resolve the provider credential from the process environment
    pub fn resolve_credential(&self) -> ProviderResult<Option<SecretString>> {
        match &self.credential_ref {
            None => Ok(None),
            Some(var) => std::env::var(var)
                .map(|v| Some(SecretString::from(v)))
                .map_err(|_| {
                    ProviderError::Config(format!(
                        "credential_ref '{}' is not set for provider {}",
                        var, self.provider_id
                    ))
                }),
        }
    }

    /// Whether this provider is admissible under air-gapped policy
    ///
    /// Only local models and custom providers with a private (non-public)
    /// endpoint qualify.
    pub fn admissible_air_gapped(&self) -> bool {
        match self.kind {
            ProviderKind::Local => true,
            ProviderKind::Custom => self
                .endpoint
                .as_deref()
                .map(is_private_endpoint)
                .unwrap_or(false),
            ProviderKind::Openai | ProviderKind::Anthropic => false,
        }
    }
}

/// Private-network heuristic for air-gapped admission
fn is_private_endpoint(endpoint: &str) -> bool {
    let host = endpoint
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .split(['/', ':'])
        .next()
        .unwrap_or("");

    host == "localhost"
        || host.ends_with(".local")
        || host.ends_with(".internal")
        || host.parse::<std::net::Ipv4Addr>().map_or(false, |ip| {
            ip.is_private() || ip.is_loopback() || ip.is_link_local()
        })
}
