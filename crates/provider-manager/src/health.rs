//! Out-of-band provider health probing
//!
//! A background task walks every registered failover group on an
//! interval and probes each member provider. Probe outcomes feed the
//! same health state machine as live traffic, so a recovered primary
//! can be reinstated without waiting for a caller to hit it.

use crate::adapters::{ProbeResult, ProviderAdapter};
use crate::failover::{FailoverGroup, SwitchRecord};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Handle to the spawned prober task
pub struct HealthProber {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

/// Switches produced by probes are reported here so the caller can
/// audit them
pub type SwitchEvents = mpsc::UnboundedReceiver<(String, SwitchRecord)>;

impl HealthProber {
    /// Spawn the probe loop
    ///
    /// `groups` maps agent ids to their failover groups; `adapters`
    /// maps provider ids to adapters. Groups with health checks
    /// disabled are skipped.
    pub fn spawn(
        groups: Arc<tokio::sync::RwLock<HashMap<String, Arc<FailoverGroup>>>>,
        adapters: Arc<tokio::sync::RwLock<HashMap<String, Arc<dyn ProviderAdapter>>>>,
        interval: Duration,
    ) -> (Self, SwitchEvents) {
        let cancel = CancellationToken::new();
        let child = cancel.child_token();
        let (tx, rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = child.cancelled() => {
                        tracing::debug!("Health prober shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        run_probe_round(&groups, &adapters, &tx).await;
                    }
                }
            }
        });

        (Self { cancel, handle }, rx)
    }

    /// Stop the loop and wait for it to finish
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

async fn run_probe_round(
    groups: &tokio::sync::RwLock<HashMap<String, Arc<FailoverGroup>>>,
    adapters: &tokio::sync::RwLock<HashMap<String, Arc<dyn ProviderAdapter>>>,
    tx: &mpsc::UnboundedSender<(String, SwitchRecord)>,
) {
    let groups_snapshot: Vec<Arc<FailoverGroup>> = {
        let guard = groups.read().await;
        guard.values().cloned().collect()
    };

    for group in groups_snapshot {
        if !group.config().health_check_enabled {
            continue;
        }

        for provider_id in group.candidates().await {
            let adapter = {
                let guard = adapters.read().await;
                guard.get(&provider_id).cloned()
            };
            let Some(adapter) = adapter else {
                continue;
            };

            let healthy = adapter.probe().await == ProbeResult::Healthy;
            metrics::counter!(
                "provider_probes_total",
                "outcome" => if healthy { "healthy" } else { "unhealthy" }
            )
            .increment(1);

            tracing::trace!(
                agent_id = %group.config().agent_id,
                provider_id = %provider_id,
                healthy = healthy,
                "Probed provider"
            );

            if let Some(switch) = group.record_probe(&provider_id, healthy).await {
                let _ = tx.send((group.config().agent_id.clone(), switch));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{Completion, CompletionOptions, TokenUsage};
    use crate::error::ProviderResult;
    use crate::failover::FailoverGroupConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlakyAdapter {
        id: String,
        healthy: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ProviderAdapter for FlakyAdapter {
        fn provider_id(&self) -> &str {
            &self.id
        }

        async fn complete(
            &self,
            _prompt: &str,
            _options: &CompletionOptions,
            _deadline: Duration,
        ) -> ProviderResult<Completion> {
            Ok(Completion {
                text: "ok".into(),
                usage: TokenUsage::default(),
            })
        }

        async fn probe(&self) -> ProbeResult {
            if self.healthy.load(Ordering::SeqCst) {
                ProbeResult::Healthy
            } else {
                ProbeResult::Unhealthy
            }
        }
    }

    #[tokio::test]
    async fn test_probe_restores_primary_and_reports_switch() {
        let primary_healthy = Arc::new(AtomicBool::new(false));

        let group = Arc::new(FailoverGroup::new(FailoverGroupConfig {
            agent_id: "a1".to_string(),
            primary_provider_id: "p1".to_string(),
            ordered_backups: vec!["p2".to_string()],
            health_check_enabled: true,
            auto_failover_enabled: true,
            consecutive_failure_threshold: 1,
            revert_to_primary: true,
        }));
        // Put the group onto the backup first
        group.record_failure("p1").await.expect("switch to backup");

        let mut groups = HashMap::new();
        groups.insert("a1".to_string(), group.clone());
        let groups = Arc::new(tokio::sync::RwLock::new(groups));

        let mut adapters: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert(
            "p1".to_string(),
            Arc::new(FlakyAdapter {
                id: "p1".to_string(),
                healthy: primary_healthy.clone(),
            }),
        );
        adapters.insert(
            "p2".to_string(),
            Arc::new(FlakyAdapter {
                id: "p2".to_string(),
                healthy: Arc::new(AtomicBool::new(true)),
            }),
        );
        let adapters = Arc::new(tokio::sync::RwLock::new(adapters));

        let (tx, mut rx) = mpsc::unbounded_channel();

        // First round: primary still down, no switch
        run_probe_round(&groups, &adapters, &tx).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(group.active_provider().await, "p2");

        // Primary recovers; next round restores it
        primary_healthy.store(true, Ordering::SeqCst);
        run_probe_round(&groups, &adapters, &tx).await;

        let (agent_id, switch) = rx.try_recv().expect("switch reported");
        assert_eq!(agent_id, "a1");
        assert_eq!(switch.to_provider, "p1");
        assert_eq!(group.active_provider().await, "p1");
    }

    #[tokio::test]
    async fn test_prober_shutdown_is_clean() {
        let groups = Arc::new(tokio::sync::RwLock::new(HashMap::new()));
        let adapters = Arc::new(tokio::sync::RwLock::new(HashMap::new()));

        let (prober, _events) =
            HealthProber::spawn(groups, adapters, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        prober.shutdown().await;
    }
}
