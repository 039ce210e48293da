//! Configuration management using environment variables
//!
//! All recognized options live under the `GATEWAY_` prefix. Unknown
//! `GATEWAY_`-prefixed variables are rejected at startup so typos fail
//! loudly rather than silently falling back to defaults.

use crate::error::{GatewayError, Result};
use secrecy::SecretString;
use std::env;
use std::time::Duration;

/// Operating mode of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvMode {
    Development,
    Production,
}

/// Top-level gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Development relaxes the encryption-key requirement
    pub env_mode: EnvMode,
    /// 32-byte key for the credential vault, base64-encoded in the env
    pub encryption_key: Option<SecretString>,
    /// When set, only local / private-endpoint providers are admissible
    pub air_gapped: bool,
    pub pool: PoolConfig,
    /// Deadline applied when a request does not carry one
    pub default_deadline: Duration,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub audit_sink: SinkConfig,
    pub cost_sink: SinkConfig,
    pub dlq_sink: SinkConfig,
}

/// Connection pool tuning (per agent)
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Hard cap on live connections
    pub max_open: usize,
    /// Connections kept warm
    pub min_idle: usize,
    /// Idle connections older than this are closed
    pub max_idle_age: Duration,
    /// How long acquire waits before `pool_timeout`
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_open: 5,
            min_idle: 1,
            max_idle_age: Duration::from_secs(300),
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

/// Default provider rate limits, overridable per provider
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub per_minute: u32,
    pub per_hour: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: 60,
            per_hour: 1000,
        }
    }
}

/// Retry strategy names recognized in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategyKind {
    None,
    Fixed,
    Linear,
    Exponential,
}

impl std::str::FromStr for RetryStrategyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "fixed" => Ok(Self::Fixed),
            "linear" => Ok(Self::Linear),
            "exponential" => Ok(Self::Exponential),
            other => Err(format!("unknown retry strategy: {}", other)),
        }
    }
}

/// Default provider retry policy, overridable per provider
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub strategy: RetryStrategyKind,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategyKind::Exponential,
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: true,
        }
    }
}

/// Where a sink writes (audit, cost, DLQ)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkConfig {
    /// Keep records in process memory (tests, development)
    Memory,
    /// Append JSON lines to a file
    Jsonl { path: String },
    /// Push onto a Redis list
    Redis { url: String, key: String },
}

/// Every recognized `GATEWAY_` variable
const KNOWN_KEYS: &[&str] = &[
    "GATEWAY_ENV",
    "GATEWAY_ENCRYPTION_KEY",
    "GATEWAY_AIR_GAPPED",
    "GATEWAY_POOL_MAX_OPEN",
    "GATEWAY_POOL_MIN_IDLE",
    "GATEWAY_POOL_MAX_IDLE_AGE_MS",
    "GATEWAY_POOL_ACQUIRE_TIMEOUT_MS",
    "GATEWAY_DEADLINE_DEFAULT_MS",
    "GATEWAY_RATE_LIMIT_PER_MINUTE",
    "GATEWAY_RATE_LIMIT_PER_HOUR",
    "GATEWAY_RETRY_STRATEGY",
    "GATEWAY_RETRY_MAX_ATTEMPTS",
    "GATEWAY_RETRY_BASE_DELAY_MS",
    "GATEWAY_RETRY_MAX_DELAY_MS",
    "GATEWAY_RETRY_JITTER",
    "GATEWAY_AUDIT_SINK",
    "GATEWAY_AUDIT_SINK_PATH",
    "GATEWAY_COST_SINK",
    "GATEWAY_COST_SINK_PATH",
    "GATEWAY_DLQ_SINK",
    "GATEWAY_DLQ_REDIS_URL",
    "GATEWAY_DLQ_REDIS_KEY",
];

impl GatewayConfig {
    /// Load configuration from environment variables
    ///
    /// Fails with `config` when a value does not parse, when an unknown
    /// `GATEWAY_` variable is present, or when `GATEWAY_ENCRYPTION_KEY`
    /// is missing outside development mode.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        reject_unknown_keys()?;

        let env_mode = match env::var("GATEWAY_ENV").as_deref() {
            Ok("production") | Ok("prod") => EnvMode::Production,
            _ => EnvMode::Development,
        };

        let encryption_key = env::var("GATEWAY_ENCRYPTION_KEY")
            .ok()
            .map(SecretString::from);
        if encryption_key.is_none() && env_mode == EnvMode::Production {
            return Err(GatewayError::config(
                "GATEWAY_ENCRYPTION_KEY must be set outside development mode",
            ));
        }

        Ok(Self {
            env_mode,
            encryption_key,
            air_gapped: bool_var("GATEWAY_AIR_GAPPED")?,
            pool: PoolConfig {
                max_open: parsed_var("GATEWAY_POOL_MAX_OPEN", 5)?,
                min_idle: parsed_var("GATEWAY_POOL_MIN_IDLE", 1)?,
                max_idle_age: Duration::from_millis(parsed_var(
                    "GATEWAY_POOL_MAX_IDLE_AGE_MS",
                    300_000,
                )?),
                acquire_timeout: Duration::from_millis(parsed_var(
                    "GATEWAY_POOL_ACQUIRE_TIMEOUT_MS",
                    10_000,
                )?),
            },
            default_deadline: Duration::from_millis(parsed_var(
                "GATEWAY_DEADLINE_DEFAULT_MS",
                30_000,
            )?),
            rate_limit: RateLimitConfig {
                per_minute: parsed_var("GATEWAY_RATE_LIMIT_PER_MINUTE", 60)?,
                per_hour: parsed_var("GATEWAY_RATE_LIMIT_PER_HOUR", 1000)?,
            },
            retry: RetryConfig {
                strategy: env::var("GATEWAY_RETRY_STRATEGY")
                    .map(|s| {
                        s.parse::<RetryStrategyKind>()
                            .map_err(GatewayError::config)
                    })
                    .unwrap_or(Ok(RetryStrategyKind::Exponential))?,
                max_attempts: parsed_var("GATEWAY_RETRY_MAX_ATTEMPTS", 3)?,
                base_delay: Duration::from_millis(parsed_var("GATEWAY_RETRY_BASE_DELAY_MS", 500)?),
                max_delay: Duration::from_millis(parsed_var("GATEWAY_RETRY_MAX_DELAY_MS", 8000)?),
                jitter: env::var("GATEWAY_RETRY_JITTER")
                    .map(|v| v != "false" && v != "0")
                    .unwrap_or(true),
            },
            audit_sink: sink_var("GATEWAY_AUDIT_SINK", "GATEWAY_AUDIT_SINK_PATH")?,
            cost_sink: sink_var("GATEWAY_COST_SINK", "GATEWAY_COST_SINK_PATH")?,
            dlq_sink: dlq_sink_var()?,
        })
    }

    /// A development configuration with everything defaulted
    pub fn for_development() -> Self {
        Self {
            env_mode: EnvMode::Development,
            encryption_key: None,
            air_gapped: false,
            pool: PoolConfig::default(),
            default_deadline: Duration::from_secs(30),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            audit_sink: SinkConfig::Memory,
            cost_sink: SinkConfig::Memory,
            dlq_sink: SinkConfig::Memory,
        }
    }
}

fn reject_unknown_keys() -> Result<()> {
    for (key, _) in env::vars() {
        if key.starts_with("GATEWAY_") && !KNOWN_KEYS.contains(&key.as_str()) {
            return Err(GatewayError::config(format!(
                "unrecognized configuration variable: {}",
                key
            )));
        }
    }
    Ok(())
}

fn bool_var(key: &str) -> Result<bool> {
    match env::var(key).as_deref() {
        Ok("true") | Ok("1") | Ok("yes") => Ok(true),
        Ok("false") | Ok("0") | Ok("no") | Err(_) => Ok(false),
        Ok(other) => Err(GatewayError::config(format!(
            "invalid boolean for {}: {}",
            key, other
        ))),
    }
}

fn parsed_var<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| GatewayError::config(format!("invalid value for {}: {}", key, raw))),
        Err(_) => Ok(default),
    }
}

fn sink_var(kind_key: &str, path_key: &str) -> Result<SinkConfig> {
    match env::var(kind_key).as_deref() {
        Ok("jsonl") => {
            let path = env::var(path_key).map_err(|_| {
                GatewayError::config(format!("{} requires {}", kind_key, path_key))
            })?;
            Ok(SinkConfig::Jsonl { path })
        }
        Ok("memory") | Err(_) => Ok(SinkConfig::Memory),
        Ok(other) => Err(GatewayError::config(format!(
            "unknown sink kind for {}: {}",
            kind_key, other
        ))),
    }
}

fn dlq_sink_var() -> Result<SinkConfig> {
    match env::var("GATEWAY_DLQ_SINK").as_deref() {
        Ok("redis") => {
            let url = env::var("GATEWAY_DLQ_REDIS_URL").map_err(|_| {
                GatewayError::config("GATEWAY_DLQ_SINK=redis requires GATEWAY_DLQ_REDIS_URL")
            })?;
            let key =
                env::var("GATEWAY_DLQ_REDIS_KEY").unwrap_or_else(|_| "querygate_dlq".to_string());
            Ok(SinkConfig::Redis { url, key })
        }
        Ok("memory") | Err(_) => Ok(SinkConfig::Memory),
        Ok(other) => Err(GatewayError::config(format!(
            "unknown sink kind for GATEWAY_DLQ_SINK: {}",
            other
        ))),
    }
}
