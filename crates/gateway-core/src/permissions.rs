//! Permission store
//!
//! Maps `(agent, resource)` tuples to capability sets. Absence of an
//! entry means no access. Resource identifiers are normalized per
//! resource kind: relational names compare case-insensitively, document
//! collection names are kept verbatim.

use shared::models::{Capability, Permission, ResourceKind};
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

/// Result of a batch permission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchDecision {
    /// Resources the agent holds the required capability for
    pub allowed: BTreeSet<String>,
    /// Resources the agent lacks, in their original spelling
    pub denied: BTreeSet<String>,
}

impl BatchDecision {
    pub fn all_allowed(&self) -> bool {
        self.denied.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Entry {
    resource_kind: ResourceKind,
    caps: BTreeSet<Capability>,
}

/// In-process permission store with per-agent entries
///
/// Default deny: checks against unknown agents or resources are false.
pub struct PermissionStore {
    // agent_id -> normalized resource_id -> entry
    grants: RwLock<HashMap<String, HashMap<String, Entry>>>,
}

impl Default for PermissionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionStore {
    pub fn new() -> Self {
        Self {
            grants: RwLock::new(HashMap::new()),
        }
    }

    /// Normalize a resource identifier under a kind's policy
    pub fn normalize(resource_id: &str, kind: ResourceKind) -> String {
        let trimmed = resource_id.trim();
        if kind.case_insensitive() {
            trimmed.to_ascii_lowercase()
        } else {
            trimmed.to_string()
        }
    }

    /// Upsert the capability set for `(agent, resource)`
    pub fn set(
        &self,
        agent_id: &str,
        resource_id: &str,
        resource_kind: ResourceKind,
        caps: BTreeSet<Capability>,
    ) {
        let normalized = Self::normalize(resource_id, resource_kind);
        let mut grants = self.grants.write().expect("permission lock poisoned");
        grants.entry(agent_id.to_string()).or_default().insert(
            normalized,
            Entry {
                resource_kind,
                caps,
            },
        );

        tracing::debug!(
            agent_id = agent_id,
            resource_id = resource_id,
            "Permission upserted"
        );
    }

    /// Remove the entry for `(agent, resource)`
    pub fn revoke(&self, agent_id: &str, resource_id: &str, resource_kind: ResourceKind) {
        let normalized = Self::normalize(resource_id, resource_kind);
        let mut grants = self.grants.write().expect("permission lock poisoned");
        if let Some(agent_grants) = grants.get_mut(agent_id) {
            agent_grants.remove(&normalized);
        }
    }

    /// Remove every entry owned by an agent (revocation cascade)
    pub fn revoke_agent(&self, agent_id: &str) {
        self.grants
            .write()
            .expect("permission lock poisoned")
            .remove(agent_id);
    }

    /// Whether the agent holds `required` on the resource
    pub fn check(
        &self,
        agent_id: &str,
        resource_id: &str,
        resource_kind: ResourceKind,
        required: Capability,
    ) -> bool {
        let normalized = Self::normalize(resource_id, resource_kind);
        let grants = self.grants.read().expect("permission lock poisoned");
        grants
            .get(agent_id)
            .and_then(|agent_grants| agent_grants.get(&normalized))
            .map(|entry| entry.caps.contains(&required))
            .unwrap_or(false)
    }

    /// Check many `(resource, capability)` pairs at once
    ///
    /// Used by the pipeline after SQL parsing; the denied set keeps the
    /// caller's original spellings so reports match the query text.
    pub fn check_batch<'a>(
        &self,
        agent_id: &str,
        checks: impl IntoIterator<Item = (&'a str, ResourceKind, Capability)>,
    ) -> BatchDecision {
        let grants = self.grants.read().expect("permission lock poisoned");
        let agent_grants = grants.get(agent_id);

        let mut decision = BatchDecision {
            allowed: BTreeSet::new(),
            denied: BTreeSet::new(),
        };

        for (resource_id, kind, required) in checks {
            let normalized = Self::normalize(resource_id, kind);
            let granted = agent_grants
                .and_then(|g| g.get(&normalized))
                .map(|entry| entry.caps.contains(&required))
                .unwrap_or(false);
            if granted {
                decision.allowed.insert(resource_id.to_string());
            } else {
                decision.denied.insert(resource_id.to_string());
            }
        }

        decision
    }

    /// Resources the agent holds at least `required` on
    pub fn resources_with(&self, agent_id: &str, required: Capability) -> BTreeSet<String> {
        let grants = self.grants.read().expect("permission lock poisoned");
        grants
            .get(agent_id)
            .map(|agent_grants| {
                agent_grants
                    .iter()
                    .filter(|(_, entry)| entry.caps.contains(&required))
                    .map(|(resource, _)| resource.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All grants for an agent, for management surfaces
    pub fn list(&self, agent_id: &str) -> Vec<Permission> {
        let grants = self.grants.read().expect("permission lock poisoned");
        grants
            .get(agent_id)
            .map(|agent_grants| {
                agent_grants
                    .iter()
                    .map(|(resource, entry)| Permission {
                        agent_id: agent_id.to_string(),
                        resource_id: resource.clone(),
                        resource_kind: entry.resource_kind,
                        caps: entry.caps.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Convenience constructor for a capability set
pub fn caps(list: &[Capability]) -> BTreeSet<Capability> {
    list.iter().copied().collect()
}
