//! Agent registry
//!
//! Maps agent identifiers to their database binding and hashed API
//! keys. Registration mints a single API key with 256 bits of entropy;
//! only its Argon2id hash is kept. Authentication looks keys up by a
//! short prefix and verifies with Argon2's constant-time comparison; a
//! miss still burns one verification against a pre-computed dummy hash
//! so timing reveals nothing about which prefixes exist.
//!
//! # Key format
//!
//! ```text
//! qga_<43 base64url chars>  (47 total chars)
//! ```
//!
//! The first 12 characters are stored as the lookup prefix.

use argon2::password_hash::{rand_core::OsRng as HashOsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Argon2, Params};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rand::RngCore;
use shared::models::{Agent, ConnectionParams, DatabaseBinding, DriverKind};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::vault::CredentialVault;

/// Bytes of entropy in a generated key (256 bits)
const KEY_ENTROPY_BYTES: usize = 32;

/// Key prefix stored for lookup
const PREFIX_LENGTH: usize = 12;

/// Marker at the front of every key
const KEY_MARKER: &str = "qga_";

/// Argon2 memory cost in KiB (19 MiB; interactive API-key latency)
const ARGON2_MEMORY_COST: u32 = 19_456;

/// Argon2 time cost (iterations)
const ARGON2_TIME_COST: u32 = 2;

/// Argon2 parallelism degree
const ARGON2_PARALLELISM: u32 = 1;

const DUMMY_KEY: &str = "qga_AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";

/// Pre-computed dummy hash for timing mitigation, one per process
static DUMMY_HASH: Lazy<String> = Lazy::new(|| {
    let argon2 = hasher();
    let salt = SaltString::generate(&mut HashOsRng);
    argon2
        .hash_password(DUMMY_KEY.as_bytes(), &salt)
        .expect("dummy hash precomputation cannot fail")
        .to_string()
});

fn hasher() -> Argon2<'static> {
    let params = Params::new(
        ARGON2_MEMORY_COST,
        ARGON2_TIME_COST,
        ARGON2_PARALLELISM,
        None,
    )
    .expect("valid Argon2 parameters");
    Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params)
}

/// Errors from registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Agent id already registered
    #[error("agent '{0}' already exists")]
    Conflict(String),

    /// No such agent
    #[error("agent '{0}' not found")]
    NotFound(String),

    /// Key did not resolve to a live agent
    ///
    /// Deliberately carries no distinction between malformed, unknown,
    /// and mismatched keys.
    #[error("authentication failed")]
    AuthFailed,

    /// Key resolved to a revoked agent
    #[error("agent has been revoked")]
    Revoked,

    /// Agent identifier failed validation
    #[error("invalid agent id: {0}")]
    InvalidAgentId(String),

    /// Vault failure sealing or opening connection parameters
    #[error(transparent)]
    Vault(#[from] shared::GatewayError),

    /// Hashing failure
    #[error("key hashing failed: {0}")]
    Hash(String),
}

/// A stored API key: hash and lookup prefix only
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub key_hash: String,
    pub prefix: String,
    pub agent_id: String,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct AgentRecord {
    agent: Agent,
    binding: DatabaseBinding,
    revoked_at: Option<DateTime<Utc>>,
}

/// Outcome of a successful registration
#[derive(Debug)]
pub struct Registration {
    pub agent: Agent,
    /// Shown exactly once; only the hash survives
    pub api_key_plaintext: String,
}

/// What to register an agent with
#[derive(Debug, Clone)]
pub struct AgentSpec {
    pub agent_id: String,
    pub display_name: String,
    pub agent_type: String,
    pub driver_kind: DriverKind,
    pub connection_name: String,
    pub connection_params: ConnectionParams,
    pub default_schema: Option<String>,
    pub endpoint_failure_threshold: u32,
}

/// In-process agent registry
///
/// Mutations take the write lock per entity; reads clone snapshots out
/// so hot paths never hold the lock across awaits.
pub struct AgentRegistry {
    vault: Arc<CredentialVault>,
    argon2: Argon2<'static>,
    agents: RwLock<HashMap<String, AgentRecord>>,
    keys: RwLock<Vec<ApiKeyRecord>>,
}

impl AgentRegistry {
    pub fn new(vault: Arc<CredentialVault>) -> Self {
        // Warm the dummy hash so first-miss latency matches steady state
        Lazy::force(&DUMMY_HASH);
        Self {
            vault,
            argon2: hasher(),
            agents: RwLock::new(HashMap::new()),
            keys: RwLock::new(Vec::new()),
        }
    }

    /// Register an agent, its binding, and an initial API key atomically
    pub fn register(&self, spec: AgentSpec) -> Result<Registration, RegistryError> {
        if spec.agent_id.trim().is_empty() {
            return Err(RegistryError::InvalidAgentId(
                "agent id must be non-empty".to_string(),
            ));
        }

        let params_json = serde_json::to_string(&spec.connection_params)
            .map_err(|e| RegistryError::Hash(e.to_string()))?;
        let sealed = self.vault.encrypt(&params_json)?;

        let (plaintext, key_record) = self.mint_key(&spec.agent_id)?;

        let agent = Agent {
            agent_id: spec.agent_id.clone(),
            display_name: spec.display_name,
            agent_type: spec.agent_type,
            created_at: Utc::now(),
        };
        let binding = DatabaseBinding {
            agent_id: spec.agent_id.clone(),
            driver_kind: spec.driver_kind,
            connection_params_encrypted: sealed,
            connection_name: spec.connection_name,
            default_schema: spec.default_schema,
            endpoint_failure_threshold: spec.endpoint_failure_threshold,
        };

        {
            let mut agents = self.agents.write().expect("registry lock poisoned");
            if agents.contains_key(&spec.agent_id) {
                return Err(RegistryError::Conflict(spec.agent_id));
            }
            agents.insert(
                spec.agent_id.clone(),
                AgentRecord {
                    agent: agent.clone(),
                    binding,
                    revoked_at: None,
                },
            );
        }
        self.keys
            .write()
            .expect("registry lock poisoned")
            .push(key_record);

        tracing::info!(agent_id = %agent.agent_id, "Agent registered");
        metrics::counter!("agents_registered_total").increment(1);

        Ok(Registration {
            agent,
            api_key_plaintext: plaintext,
        })
    }

    /// Resolve an API key to a live agent id
    ///
    /// Constant-time with respect to key existence: a lookup miss (or a
    /// malformed key) performs one dummy verification so response time
    /// does not reveal whether the prefix is known.
    pub fn authenticate(&self, api_key: &str) -> Result<String, RegistryError> {
        if !is_plausible_key(api_key) {
            self.dummy_verify();
            return Err(RegistryError::AuthFailed);
        }

        let prefix: String = api_key.chars().take(PREFIX_LENGTH).collect();
        let candidates: Vec<ApiKeyRecord> = {
            let keys = self.keys.read().expect("registry lock poisoned");
            keys.iter()
                .filter(|k| k.prefix == prefix && k.revoked_at.is_none())
                .cloned()
                .collect()
        };

        if candidates.is_empty() {
            self.dummy_verify();
            return Err(RegistryError::AuthFailed);
        }

        for candidate in &candidates {
            if self.verify_key(api_key, &candidate.key_hash) {
                let agents = self.agents.read().expect("registry lock poisoned");
                return match agents.get(&candidate.agent_id) {
                    Some(record) if record.revoked_at.is_none() => {
                        Ok(candidate.agent_id.clone())
                    }
                    Some(_) => Err(RegistryError::Revoked),
                    None => Err(RegistryError::AuthFailed),
                };
            }
        }

        Err(RegistryError::AuthFailed)
    }

    /// Fetch an agent
    pub fn get(&self, agent_id: &str) -> Result<Agent, RegistryError> {
        let agents = self.agents.read().expect("registry lock poisoned");
        agents
            .get(agent_id)
            .filter(|r| r.revoked_at.is_none())
            .map(|r| r.agent.clone())
            .ok_or_else(|| RegistryError::NotFound(agent_id.to_string()))
    }

    /// Fetch an agent's database binding
    pub fn binding(&self, agent_id: &str) -> Result<DatabaseBinding, RegistryError> {
        let agents = self.agents.read().expect("registry lock poisoned");
        agents
            .get(agent_id)
            .filter(|r| r.revoked_at.is_none())
            .map(|r| r.binding.clone())
            .ok_or_else(|| RegistryError::NotFound(agent_id.to_string()))
    }

    /// Open the sealed connection parameters of a binding
    pub fn connection_params(
        &self,
        binding: &DatabaseBinding,
    ) -> Result<ConnectionParams, RegistryError> {
        let opened = self.vault.decrypt(&binding.connection_params_encrypted)?;
        use secrecy::ExposeSecret;
        serde_json::from_str(opened.expose_secret())
            .map_err(|_| RegistryError::Vault(shared::GatewayError::internal(
                "sealed connection parameters are corrupt",
            )))
    }

    /// List live agents
    pub fn list(&self) -> Vec<Agent> {
        let agents = self.agents.read().expect("registry lock poisoned");
        let mut result: Vec<Agent> = agents
            .values()
            .filter(|r| r.revoked_at.is_none())
            .map(|r| r.agent.clone())
            .collect();
        result.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        result
    }

    /// Revoke an agent and all of its keys
    ///
    /// Tombstones rather than deletes: audit and cost records keep a
    /// referent, and `authenticate` maps the dead keys to `Revoked`.
    pub fn revoke(&self, agent_id: &str) -> Result<(), RegistryError> {
        let now = Utc::now();
        {
            let mut agents = self.agents.write().expect("registry lock poisoned");
            let record = agents
                .get_mut(agent_id)
                .filter(|r| r.revoked_at.is_none())
                .ok_or_else(|| RegistryError::NotFound(agent_id.to_string()))?;
            record.revoked_at = Some(now);
        }
        {
            let mut keys = self.keys.write().expect("registry lock poisoned");
            for key in keys.iter_mut().filter(|k| k.agent_id == agent_id) {
                key.revoked_at = Some(now);
            }
        }

        tracing::info!(agent_id = agent_id, "Agent revoked");
        metrics::counter!("agents_revoked_total").increment(1);
        Ok(())
    }

    /// Replace an agent's database binding atomically
    pub fn update_binding(
        &self,
        agent_id: &str,
        driver_kind: DriverKind,
        connection_name: String,
        connection_params: &ConnectionParams,
        default_schema: Option<String>,
        endpoint_failure_threshold: u32,
    ) -> Result<DatabaseBinding, RegistryError> {
        let params_json = serde_json::to_string(connection_params)
            .map_err(|e| RegistryError::Hash(e.to_string()))?;
        let sealed = self.vault.encrypt(&params_json)?;

        let mut agents = self.agents.write().expect("registry lock poisoned");
        let record = agents
            .get_mut(agent_id)
            .filter(|r| r.revoked_at.is_none())
            .ok_or_else(|| RegistryError::NotFound(agent_id.to_string()))?;

        record.binding = DatabaseBinding {
            agent_id: agent_id.to_string(),
            driver_kind,
            connection_params_encrypted: sealed,
            connection_name,
            default_schema,
            endpoint_failure_threshold,
        };

        tracing::info!(agent_id = agent_id, "Database binding replaced");
        Ok(record.binding.clone())
    }

    fn mint_key(&self, agent_id: &str) -> Result<(String, ApiKeyRecord), RegistryError> {
        let mut random_bytes = [0u8; KEY_ENTROPY_BYTES];
        rand::rngs::OsRng
            .try_fill_bytes(&mut random_bytes)
            .map_err(|e| RegistryError::Hash(e.to_string()))?;

        let plaintext = format!("{}{}", KEY_MARKER, URL_SAFE_NO_PAD.encode(random_bytes));
        let prefix: String = plaintext.chars().take(PREFIX_LENGTH).collect();

        let salt = SaltString::generate(&mut HashOsRng);
        let hash = self
            .argon2
            .hash_password(plaintext.as_bytes(), &salt)
            .map_err(|e| RegistryError::Hash(e.to_string()))?
            .to_string();

        Ok((
            plaintext,
            ApiKeyRecord {
                key_hash: hash,
                prefix,
                agent_id: agent_id.to_string(),
                created_at: Utc::now(),
                revoked_at: None,
            },
        ))
    }

    fn verify_key(&self, key: &str, hash: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(hash) else {
            return false;
        };
        self.argon2
            .verify_password(key.as_bytes(), &parsed)
            .is_ok()
    }

    fn dummy_verify(&self) {
        let _ = self.verify_key(DUMMY_KEY, &DUMMY_HASH);
    }
}

/// Cheap structural check before prefix lookup
///
/// Failures still pay the dummy-verify cost so a malformed key is
/// indistinguishable from an unknown one.
fn is_plausible_key(key: &str) -> bool {
    key.len() == KEY_MARKER.len() + 43
        && key.starts_with(KEY_MARKER)
        && URL_SAFE_NO_PAD.decode(&key[KEY_MARKER.len()..]).is_ok()
}
