//! Provider failover groups
//!
//! A failover group ties an agent to a primary provider and an ordered
//! list of backups. Terminal failures degrade a provider's health; once
//! consecutive failures reach the group threshold the active provider
//! advances to the next candidate. A successful probe restores health
//! and, when policy permits, the primary is reinstated.
//!
//! # Provider health state machine
//!
//! ```text
//! Healthy
//!   ↓ (transient/terminal failure)
//! Degraded
//!   ↓ (threshold consecutive failures)
//! Unhealthy
//!   ↓ (successful probe or call)
//! Healthy
//! ```
//!
//! All active-provider transitions are appended to `switch_history`,
//! which is never truncated or rewritten.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Health of one provider within a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderHealth {
    /// Normal operation
    Healthy,
    /// At least one recent failure, below the threshold
    Degraded,
    /// Threshold consecutive failures reached
    Unhealthy,
}

impl std::fmt::Display for ProviderHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderHealth::Healthy => write!(f, "healthy"),
            ProviderHealth::Degraded => write!(f, "degraded"),
            ProviderHealth::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Why the active provider changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchReason {
    /// Consecutive failures reached the threshold
    FailureThreshold,
    /// A recovered primary was reinstated
    PrimaryRestored,
    /// Operator forced the switch
    Manual,
}

/// One immutable entry in a group's switch history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchRecord {
    pub timestamp: DateTime<Utc>,
    pub from_provider: String,
    pub to_provider: String,
    pub reason: SwitchReason,
}

/// Configuration for a failover group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverGroupConfig {
    pub agent_id: String,
    pub primary_provider_id: String,
    /// Tried in order after the primary
    pub ordered_backups: Vec<String>,
    pub health_check_enabled: bool,
    pub auto_failover_enabled: bool,
    /// Consecutive failures before the active provider advances
    pub consecutive_failure_threshold: u32,
    /// Reinstate the primary when a probe finds it healthy again
    pub revert_to_primary: bool,
}

#[derive(Debug)]
struct ProviderState {
    health: ProviderHealth,
    consecutive_failures: u32,
    last_failure: Option<DateTime<Utc>>,
}

impl ProviderState {
    fn new() -> Self {
        Self {
            health: ProviderHealth::Healthy,
            consecutive_failures: 0,
            last_failure: None,
        }
    }
}

#[derive(Debug)]
struct GroupState {
    active: String,
    providers: HashMap<String, ProviderState>,
    switch_history: Vec<SwitchRecord>,
}

/// A failover group with serialized state transitions
pub struct FailoverGroup {
    config: FailoverGroupConfig,
    state: RwLock<GroupState>,
}

impl FailoverGroup {
    pub fn new(config: FailoverGroupConfig) -> Self {
        let mut providers = HashMap::new();
        providers.insert(config.primary_provider_id.clone(), ProviderState::new());
        for backup in &config.ordered_backups {
            providers.insert(backup.clone(), ProviderState::new());
        }

        Self {
            state: RwLock::new(GroupState {
                active: config.primary_provider_id.clone(),
                providers,
                switch_history: Vec::new(),
            }),
            config,
        }
    }

    pub fn config(&self) -> &FailoverGroupConfig {
        &self.config
    }

    /// Every provider in the group, active-first then remaining in order
    pub async fn candidates(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut ordered = vec![state.active.clone()];
        if self.config.primary_provider_id != state.active {
            ordered.push(self.config.primary_provider_id.clone());
        }
        for backup in &self.config.ordered_backups {
            if *backup != state.active {
                ordered.push(backup.clone());
            }
        }
        ordered
    }

    /// The provider calls should currently go to
    pub async fn active_provider(&self) -> String {
        self.state.read().await.active.clone()
    }

    /// Health of a provider in the group
    pub async fn health_of(&self, provider_id: &str) -> Option<ProviderHealth> {
        self.state
            .read()
            .await
            .providers
            .get(provider_id)
            .map(|p| p.health)
    }

    /// Immutable view of the switch history
    pub async fn switch_history(&self) -> Vec<SwitchRecord> {
        self.state.read().await.switch_history.clone()
    }

    /// Record a successful call against a provider
    pub async fn record_success(&self, provider_id: &str) {
        let mut state = self.state.write().await;
        if let Some(provider) = state.providers.get_mut(provider_id) {
            if provider.health != ProviderHealth::Healthy {
                tracing::info!(
                    agent_id = %self.config.agent_id,
                    provider_id = provider_id,
                    previous = %provider.health,
                    "Provider recovered"
                );
            }
            provider.health = ProviderHealth::Healthy;
            provider.consecutive_failures = 0;
            provider.last_failure = None;
        }
    }

    /// Record a terminal failure against a provider
    ///
    /// Returns a [`SwitchRecord`] when the failure tripped the threshold
    /// and the active provider advanced.
    pub async fn record_failure(&self, provider_id: &str) -> Option<SwitchRecord> {
        let mut state = self.state.write().await;

        let threshold = self.config.consecutive_failure_threshold;
        let provider = state.providers.get_mut(provider_id)?;
        provider.consecutive_failures += 1;
        provider.last_failure = Some(Utc::now());
        provider.health = if provider.consecutive_failures >= threshold {
            ProviderHealth::Unhealthy
        } else {
            ProviderHealth::Degraded
        };

        tracing::debug!(
            agent_id = %self.config.agent_id,
            provider_id = provider_id,
            consecutive_failures = provider.consecutive_failures,
            threshold = threshold,
            health = %provider.health,
            "Recorded provider failure"
        );

        let tripped = provider.health == ProviderHealth::Unhealthy;
        if !(tripped && self.config.auto_failover_enabled && state.active == provider_id) {
            return None;
        }

        let next = self.next_candidate(&state, provider_id)?;
        Some(Self::switch_active(
            &self.config,
            &mut state,
            next,
            SwitchReason::FailureThreshold,
        ))
    }

    /// Apply a probe result to a provider
    ///
    /// A healthy probe of the primary reinstates it as active when the
    /// group's `revert_to_primary` policy is set.
    pub async fn record_probe(
        &self,
        provider_id: &str,
        healthy: bool,
    ) -> Option<SwitchRecord> {
        let mut state = self.state.write().await;
        let threshold = self.config.consecutive_failure_threshold;

        {
            let provider = state.providers.get_mut(provider_id)?;
            if healthy {
                provider.health = ProviderHealth::Healthy;
                provider.consecutive_failures = 0;
            } else {
                provider.consecutive_failures += 1;
                provider.last_failure = Some(Utc::now());
                provider.health = if provider.consecutive_failures >= threshold {
                    ProviderHealth::Unhealthy
                } else {
                    ProviderHealth::Degraded
                };
            }
        }

        let should_restore = healthy
            && self.config.revert_to_primary
            && provider_id == self.config.primary_provider_id
            && state.active != self.config.primary_provider_id;

        if should_restore {
            let primary = self.config.primary_provider_id.clone();
            return Some(Self::switch_active(
                &self.config,
                &mut state,
                primary,
                SwitchReason::PrimaryRestored,
            ));
        }

        None
    }

    /// Next provider to try, preferring not-unhealthy candidates
    fn next_candidate(&self, state: &GroupState, failed: &str) -> Option<String> {
        let mut order = vec![self.config.primary_provider_id.clone()];
        order.extend(self.config.ordered_backups.iter().cloned());

        // First pass: skip unhealthy providers entirely
        for candidate in &order {
            if candidate != failed {
                if let Some(p) = state.providers.get(candidate) {
                    if p.health != ProviderHealth::Unhealthy {
                        return Some(candidate.clone());
                    }
                }
            }
        }
        // Degenerate case: everything is unhealthy, rotate anyway
        order.into_iter().find(|c| c != failed)
    }

    fn switch_active(
        config: &FailoverGroupConfig,
        state: &mut GroupState,
        to: String,
        reason: SwitchReason,
    ) -> SwitchRecord {
        let record = SwitchRecord {
            timestamp: Utc::now(),
            from_provider: state.active.clone(),
            to_provider: to.clone(),
            reason,
        };

        tracing::warn!(
            agent_id = %config.agent_id,
            from = %record.from_provider,
            to = %record.to_provider,
            reason = ?reason,
            "Failover group switched active provider"
        );
        metrics::counter!("provider_failovers_total").increment(1);

        state.active = to;
        state.switch_history.push(record.clone());
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(threshold: u32, revert: bool) -> FailoverGroup {
        FailoverGroup::new(FailoverGroupConfig {
            agent_id: "analytics".to_string(),
            primary_provider_id: "p1".to_string(),
            ordered_backups: vec!["p2".to_string(), "p3".to_string()],
            health_check_enabled: true,
            auto_failover_enabled: true,
            consecutive_failure_threshold: threshold,
            revert_to_primary: revert,
        })
    }

    #[tokio::test]
    async fn test_starts_on_primary_and_healthy() {
        let g = group(3, false);
        assert_eq!(g.active_provider().await, "p1");
        assert_eq!(g.health_of("p1").await, Some(ProviderHealth::Healthy));
        assert!(g.switch_history().await.is_empty());
    }

    #[tokio::test]
    async fn test_failure_below_threshold_degrades_without_switching() {
        let g = group(3, false);

        assert!(g.record_failure("p1").await.is_none());
        assert!(g.record_failure("p1").await.is_none());

        assert_eq!(g.health_of("p1").await, Some(ProviderHealth::Degraded));
        assert_eq!(g.active_provider().await, "p1");
    }

    #[tokio::test]
    async fn test_threshold_failures_advance_to_backup() {
        let g = group(3, false);

        g.record_failure("p1").await;
        g.record_failure("p1").await;
        let switch = g.record_failure("p1").await.expect("should switch");

        assert_eq!(switch.from_provider, "p1");
        assert_eq!(switch.to_provider, "p2");
        assert_eq!(switch.reason, SwitchReason::FailureThreshold);
        assert_eq!(g.active_provider().await, "p2");
        assert_eq!(g.health_of("p1").await, Some(ProviderHealth::Unhealthy));

        let history = g.switch_history().await;
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_active_is_always_primary_or_backup() {
        let g = group(1, false);

        for provider in ["p1", "p2", "p3", "p1", "p2"] {
            g.record_failure(provider).await;
            let active = g.active_provider().await;
            assert!(
                ["p1", "p2", "p3"].contains(&active.as_str()),
                "active {} escaped the group",
                active
            );
        }
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let g = group(3, false);

        g.record_failure("p1").await;
        g.record_failure("p1").await;
        g.record_success("p1").await;
        assert_eq!(g.health_of("p1").await, Some(ProviderHealth::Healthy));

        // Counter restarted: two more failures still do not trip
        g.record_failure("p1").await;
        assert!(g.record_failure("p1").await.is_none());
        assert_eq!(g.active_provider().await, "p1");
    }

    #[tokio::test]
    async fn test_probe_restores_primary_when_policy_set() {
        let g = group(1, true);

        g.record_failure("p1").await.expect("switched to backup");
        assert_eq!(g.active_provider().await, "p2");

        let switch = g.record_probe("p1", true).await.expect("should restore");
        assert_eq!(switch.reason, SwitchReason::PrimaryRestored);
        assert_eq!(g.active_provider().await, "p1");
        assert_eq!(g.switch_history().await.len(), 2);
    }

    #[tokio::test]
    async fn test_probe_does_not_restore_without_policy() {
        let g = group(1, false);

        g.record_failure("p1").await.expect("switched to backup");
        assert!(g.record_probe("p1", true).await.is_none());
        assert_eq!(g.active_provider().await, "p2");
        // Health is restored even though the active provider stays put
        assert_eq!(g.health_of("p1").await, Some(ProviderHealth::Healthy));
    }

    #[tokio::test]
    async fn test_failed_probe_degrades() {
        let g = group(2, false);

        g.record_probe("p2", false).await;
        assert_eq!(g.health_of("p2").await, Some(ProviderHealth::Degraded));
        g.record_probe("p2", false).await;
        assert_eq!(g.health_of("p2").await, Some(ProviderHealth::Unhealthy));
    }

    #[tokio::test]
    async fn test_candidates_lead_with_active() {
        let g = group(1, false);
        assert_eq!(g.candidates().await, vec!["p1", "p2", "p3"]);

        g.record_failure("p1").await;
        assert_eq!(g.candidates().await, vec!["p2", "p1", "p3"]);
    }
}
