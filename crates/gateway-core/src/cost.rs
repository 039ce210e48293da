//! Cost tracking
//!
//! `record` is the only mutator; records are immutable once written.
//! Aggregates are computed on read. Budget alerts re-evaluate on every
//! record and fire edge-triggered: one notification per alert per
//! period, when the aggregate first crosses the threshold.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use shared::models::CostRecord;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Aggregated cost over a period
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostAggregate {
    pub total_cost: f64,
    pub by_provider: HashMap<String, f64>,
    pub by_operation_kind: HashMap<String, f64>,
    /// Keyed by ISO date ("2025-06-01")
    pub by_day: HashMap<String, f64>,
    pub record_count: usize,
}

/// Alert evaluation period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertPeriod {
    Daily,
    Monthly,
    /// Sliding window of the given number of hours
    Custom(u32),
}

/// Alert scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertScope {
    Global,
    PerAgent(String),
}

/// A budget alert definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetAlert {
    pub name: String,
    pub threshold_usd: f64,
    pub period: AlertPeriod,
    pub scope: AlertScope,
}

/// A fired alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetNotification {
    pub alert_name: String,
    pub scope: AlertScope,
    pub period_key: String,
    pub spent_usd: f64,
    pub threshold_usd: f64,
    pub fired_at: DateTime<Utc>,
}

/// Receives budget notifications
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: &BudgetNotification);
}

/// In-memory notification sink for tests and development
#[derive(Default)]
pub struct MemoryNotificationSink {
    notifications: Mutex<Vec<BudgetNotification>>,
}

impl MemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<BudgetNotification> {
        self.notifications
            .lock()
            .expect("notification lock poisoned")
            .clone()
    }
}

#[async_trait]
impl NotificationSink for MemoryNotificationSink {
    async fn notify(&self, notification: &BudgetNotification) {
        self.notifications
            .lock()
            .expect("notification lock poisoned")
            .push(notification.clone());
    }
}

/// Durable destination for cost records
///
/// Implementations must not lose records on orderly shutdown.
#[async_trait]
pub trait CostSink: Send + Sync {
    async fn record(&self, record: &CostRecord) -> shared::Result<()>;
}

/// JSONL file sink, one cost record per line
pub struct JsonlCostSink {
    path: std::path::PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlCostSink {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl CostSink for JsonlCostSink {
    async fn record(&self, record: &CostRecord) -> shared::Result<()> {
        use tokio::io::AsyncWriteExt;

        let mut line = serde_json::to_string(record).map_err(|e| {
            shared::GatewayError::internal(format!("cost serialization failed: {}", e))
        })?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| shared::GatewayError::internal(format!("cost sink open failed: {}", e)))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| shared::GatewayError::internal(format!("cost sink write failed: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| shared::GatewayError::internal(format!("cost sink flush failed: {}", e)))?;
        Ok(())
    }
}

struct TrackerState {
    records: Vec<CostRecord>,
    alerts: Vec<BudgetAlert>,
    /// (alert name, period key) pairs that already fired
    fired: HashSet<(String, String)>,
}

/// The cost tracker
pub struct CostTracker {
    state: Mutex<TrackerState>,
    sinks: Vec<std::sync::Arc<dyn NotificationSink>>,
    /// Optional durable shipping target alongside the in-memory log
    record_sink: Option<std::sync::Arc<dyn CostSink>>,
}

impl CostTracker {
    pub fn new(sinks: Vec<std::sync::Arc<dyn NotificationSink>>) -> Self {
        Self::with_record_sink(sinks, None)
    }

    pub fn with_record_sink(
        sinks: Vec<std::sync::Arc<dyn NotificationSink>>,
        record_sink: Option<std::sync::Arc<dyn CostSink>>,
    ) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                records: Vec::new(),
                alerts: Vec::new(),
                fired: HashSet::new(),
            }),
            sinks,
            record_sink,
        }
    }

    /// Install or replace a budget alert by name
    pub fn set_alert(&self, alert: BudgetAlert) {
        let mut state = self.state.lock().expect("cost lock poisoned");
        state.alerts.retain(|a| a.name != alert.name);
        state.alerts.push(alert);
    }

    /// Record one immutable cost record and re-evaluate matching alerts
    pub async fn record(&self, record: CostRecord) {
        metrics::counter!(
            "cost_records_total",
            "operation" => record.operation_kind.to_string()
        )
        .increment(1);

        if let Some(ref sink) = self.record_sink {
            if let Err(e) = sink.record(&record).await {
                tracing::error!(
                    call_id = %record.call_id,
                    error = %e,
                    "Cost sink record failed"
                );
                metrics::counter!("cost_record_failures_total").increment(1);
            }
        }

        let notifications = {
            let mut state = self.state.lock().expect("cost lock poisoned");
            state.records.push(record.clone());
            evaluate_alerts(&mut state, &record)
        };

        for notification in notifications {
            tracing::warn!(
                alert = %notification.alert_name,
                spent_usd = notification.spent_usd,
                threshold_usd = notification.threshold_usd,
                "Budget alert crossed"
            );
            for sink in &self.sinks {
                sink.notify(&notification).await;
            }
        }
    }

    /// Aggregate records since `since` (optionally for one agent)
    pub fn aggregate(&self, since: DateTime<Utc>, agent_id: Option<&str>) -> CostAggregate {
        let state = self.state.lock().expect("cost lock poisoned");
        let mut aggregate = CostAggregate::default();

        for record in state
            .records
            .iter()
            .filter(|r| r.timestamp >= since)
            .filter(|r| agent_id.map(|a| r.agent_id == a).unwrap_or(true))
        {
            aggregate.total_cost += record.cost_usd;
            aggregate.record_count += 1;
            if let Some(ref provider) = record.provider_id {
                *aggregate.by_provider.entry(provider.clone()).or_default() += record.cost_usd;
            }
            *aggregate
                .by_operation_kind
                .entry(record.operation_kind.to_string())
                .or_default() += record.cost_usd;
            *aggregate
                .by_day
                .entry(record.timestamp.format("%Y-%m-%d").to_string())
                .or_default() += record.cost_usd;
        }

        aggregate
    }

    /// Records after the cursor position, with the next cursor
    ///
    /// The cursor is an index into the append-only record log, so
    /// consumers can export asynchronously without missing records.
    pub fn stream_since(&self, cursor: usize) -> (Vec<CostRecord>, usize) {
        let state = self.state.lock().expect("cost lock poisoned");
        let records: Vec<CostRecord> = state.records.iter().skip(cursor).cloned().collect();
        let next = state.records.len();
        (records, next)
    }
}

/// Evaluate alerts against the record that just landed
fn evaluate_alerts(state: &mut TrackerState, record: &CostRecord) -> Vec<BudgetNotification> {
    let mut notifications = Vec::new();
    let now = record.timestamp;

    let alerts = state.alerts.clone();
    for alert in alerts {
        // Scope must match the incoming record
        let scope_agent = match &alert.scope {
            AlertScope::Global => None,
            AlertScope::PerAgent(agent) => {
                if *agent != record.agent_id {
                    continue;
                }
                Some(agent.as_str())
            }
        };

        let (window_start, period_key) = period_window(&alert.period, now);
        let spent: f64 = state
            .records
            .iter()
            .filter(|r| r.timestamp >= window_start)
            .filter(|r| scope_agent.map(|a| r.agent_id == a).unwrap_or(true))
            .map(|r| r.cost_usd)
            .sum();

        if spent < alert.threshold_usd {
            continue;
        }

        let fired_key = (alert.name.clone(), period_key.clone());
        if !state.fired.insert(fired_key) {
            // Already fired for this period: edge-triggered, not level
            continue;
        }

        notifications.push(BudgetNotification {
            alert_name: alert.name.clone(),
            scope: alert.scope.clone(),
            period_key,
            spent_usd: spent,
            threshold_usd: alert.threshold_usd,
            fired_at: Utc::now(),
        });
    }

    notifications
}

/// Window start and a stable key identifying the current period
fn period_window(period: &AlertPeriod, now: DateTime<Utc>) -> (DateTime<Utc>, String) {
    match period {
        AlertPeriod::Daily => {
            let start = Utc
                .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
                .single()
                .unwrap_or(now);
            (start, now.format("%Y-%m-%d").to_string())
        }
        AlertPeriod::Monthly => {
            let start = Utc
                .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
                .single()
                .unwrap_or(now);
            (start, now.format("%Y-%m").to_string())
        }
        AlertPeriod::Custom(hours) => {
            let start = now - ChronoDuration::hours(*hours as i64);
            // Bucket the sliding window so the edge trigger has a period
            let bucket = now.timestamp() / (*hours as i64 * 3600).max(1);
            (start, format!("w{}", bucket))
        }
    }
}
