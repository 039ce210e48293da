//! End-to-end pipeline scenarios over scripted drivers and providers

mod common;

use common::{Harness, ProviderScript, ScriptedDriver, ScriptedProvider};
use gateway_core::caps;
use provider_manager::{FailoverGroupConfig, ProviderAdapter};
use shared::models::*;
use shared::{ErrorKind, GatewayConfig};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn grant_read_sales(harness: &Harness) {
    harness.gateway.permissions().set(
        "analytics",
        "public.sales",
        ResourceKind::Table,
        caps(&[Capability::Read]),
    );
}

#[tokio::test]
async fn test_happy_path_sql() {
    let harness = Harness::new().await;
    let key = harness.register_analytics().await;
    grant_read_sales(&harness);

    let result = harness
        .gateway
        .handle(Harness::sql_request(&key, "SELECT COUNT(*) FROM public.sales"))
        .await
        .unwrap();

    assert_eq!(result.columns, vec!["count"]);
    assert_eq!(result.row_count, 1);
    assert_eq!(result.rows[0][0], serde_json::json!(42));
    assert!(result.generated_sql.is_none());
    assert!(result.tables_touched.contains("public.sales"));

    // One audit event for the query, one for registration
    let query_events: Vec<_> = harness
        .audit
        .all()
        .into_iter()
        .filter(|e| e.action_kind == ActionKind::SqlQuery)
        .collect();
    assert_eq!(query_events.len(), 1);
    assert_eq!(query_events[0].status, AuditStatus::Ok);

    // One cost record with the matching call id
    let (records, _) = harness.gateway.costs().stream_since(0);
    assert_eq!(records.len(), 1);
    assert_eq!(
        Some(records[0].call_id.as_str()),
        query_events[0].details["call_id"].as_str()
    );
}

#[tokio::test]
async fn test_permission_deny_lists_every_resource_and_skips_execution() {
    let harness = Harness::new().await;
    let key = harness.register_analytics().await;
    grant_read_sales(&harness);

    let report = harness
        .gateway
        .handle(Harness::sql_request(
            &key,
            "SELECT * FROM public.sales JOIN public.customers USING (cid)",
        ))
        .await
        .unwrap_err();

    assert_eq!(report.error, ErrorKind::PermissionDenied);
    assert_eq!(
        report.denied_resources,
        Some(vec!["public.customers".to_string()])
    );
    assert!(!report.suggested_fixes.is_empty());

    // No driver-level statement was issued
    assert!(harness.driver.executed().is_empty());

    let denied: Vec<_> = harness
        .audit
        .all()
        .into_iter()
        .filter(|e| e.status == AuditStatus::Denied)
        .collect();
    assert_eq!(denied.len(), 1);
    let tables = denied[0].details["tables_touched"].as_array().unwrap();
    assert_eq!(tables.len(), 2);

    // Cost is still attributed to the denied call
    let (records, _) = harness.gateway.costs().stream_since(0);
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn test_nl_success_carries_generated_sql() {
    let harness = Harness::new().await;
    let key = harness.register_analytics().await;
    grant_read_sales(&harness);
    harness
        .install_provider(ScriptedProvider::always(
            "p1",
            "SELECT COUNT(*) FROM public.sales",
        ))
        .await;

    let result = harness
        .gateway
        .handle(Harness::nl_request(&key, "how many sales"))
        .await
        .unwrap();

    assert_eq!(
        result.generated_sql.as_deref(),
        Some("SELECT COUNT(*) FROM public.sales")
    );
    assert_eq!(result.row_count, 1);

    let nl_events: Vec<_> = harness
        .audit
        .all()
        .into_iter()
        .filter(|e| e.action_kind == ActionKind::NlQuery)
        .collect();
    assert_eq!(nl_events.len(), 1);
    assert_eq!(nl_events[0].status, AuditStatus::Ok);

    // Provider tokens were attributed
    let (records, _) = harness.gateway.costs().stream_since(0);
    assert_eq!(records[0].prompt_tokens, Some(120));
    assert_eq!(records[0].operation_kind, OperationKind::NlQuery);
    assert!(records[0].cost_usd > 0.0);
}

#[tokio::test]
async fn test_nl_leaking_forbidden_table_is_denied_without_execution() {
    let harness = Harness::new().await;
    let key = harness.register_analytics().await;
    grant_read_sales(&harness);
    harness
        .install_provider(ScriptedProvider::always(
            "p1",
            "SELECT s.id FROM sales s JOIN customers c ON s.cid = c.cid",
        ))
        .await;

    let report = harness
        .gateway
        .handle(Harness::nl_request(&key, "join sales and customers"))
        .await
        .unwrap_err();

    assert_eq!(report.error, ErrorKind::PermissionDenied);
    assert_eq!(
        report.denied_resources,
        Some(vec!["public.customers".to_string()])
    );
    // The generated SQL is captured in the report
    assert!(report.generated_sql.unwrap().contains("JOIN customers"));
    assert!(harness.driver.executed().is_empty());
}

#[tokio::test]
async fn test_nl_prompt_sees_only_readable_schema() {
    let harness = Harness::new().await;
    let key = harness.register_analytics().await;
    grant_read_sales(&harness);

    // A provider that echoes nothing useful; we only care about the
    // system prompt it received
    struct PromptCapture {
        inner: ScriptedProvider,
        prompts: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl provider_manager::ProviderAdapter for PromptCapture {
        fn provider_id(&self) -> &str {
            self.inner.provider_id()
        }

        async fn complete(
            &self,
            prompt: &str,
            options: &provider_manager::CompletionOptions,
            deadline: Duration,
        ) -> provider_manager::ProviderResult<provider_manager::Completion> {
            self.prompts
                .lock()
                .unwrap()
                .push(options.system.clone().unwrap_or_default());
            self.inner.complete(prompt, options, deadline).await
        }

        async fn probe(&self) -> provider_manager::ProbeResult {
            provider_manager::ProbeResult::Healthy
        }
    }

    let capture = std::sync::Arc::new(PromptCapture {
        inner: ScriptedProvider::always("p1", "SELECT COUNT(*) FROM public.sales"),
        prompts: std::sync::Mutex::new(Vec::new()),
    });

    harness
        .gateway
        .providers()
        .registry()
        .upsert(common::provider_config("p1"))
        .unwrap();
    harness
        .gateway
        .providers()
        .install_adapter(capture.clone())
        .await;
    harness
        .gateway
        .providers()
        .set_default_provider("p1")
        .await
        .unwrap();

    harness
        .gateway
        .handle(Harness::nl_request(&key, "how many sales"))
        .await
        .unwrap();

    let prompts = capture.prompts.lock().unwrap();
    assert!(prompts[0].contains("public.sales"));
    // The forbidden table never reaches the provider
    assert!(!prompts[0].contains("customers"));
}

#[tokio::test]
async fn test_nl_unknown_table_suggests_similar_names() {
    let harness = Harness::new().await;
    let key = harness.register_analytics().await;
    grant_read_sales(&harness);
    harness
        .install_provider(ScriptedProvider::always(
            "p1",
            "SELECT COUNT(*) FROM public.salez",
        ))
        .await;

    let report = harness
        .gateway
        .handle(Harness::nl_request(&key, "how many salez"))
        .await
        .unwrap_err();

    assert_eq!(report.error, ErrorKind::SchemaUnknown);
    assert!(report.suggested_fixes[0].contains("public.sales"));
    assert!(harness.driver.executed().is_empty());
}

#[tokio::test]
async fn test_pool_timeout_when_saturated() {
    let mut config = GatewayConfig::for_development();
    config.pool.max_open = 1;
    config.pool.acquire_timeout = Duration::from_millis(50);

    let mut driver = ScriptedDriver::counting();
    driver.execute_delay = Duration::from_millis(300);
    let harness = Harness::with_config(config, driver).await;
    let key = harness.register_analytics().await;
    grant_read_sales(&harness);

    let slow = harness
        .gateway
        .handle(Harness::sql_request(&key, "SELECT COUNT(*) FROM public.sales"));
    let contender = async {
        // Let the first call take the only slot
        tokio::time::sleep(Duration::from_millis(50)).await;
        harness
            .gateway
            .handle(Harness::sql_request(&key, "SELECT COUNT(*) FROM public.sales"))
            .await
    };

    let (first, second) = tokio::join!(slow, contender);

    assert!(first.is_ok());
    let report = second.unwrap_err();
    assert_eq!(report.error, ErrorKind::PoolTimeout);
    assert!(report.retry_after_ms.is_some());
}

#[tokio::test]
async fn test_provider_failover_after_threshold() {
    let harness = Harness::new().await;
    let key = harness.register_analytics().await;
    grant_read_sales(&harness);

    let p1 = ScriptedProvider::failing("p1");
    let p2 = ScriptedProvider::always("p2", "SELECT COUNT(*) FROM public.sales");

    for (id, adapter) in [("p1", p1), ("p2", p2)] {
        harness
            .gateway
            .providers()
            .registry()
            .upsert(common::provider_config(id))
            .unwrap();
        harness
            .gateway
            .providers()
            .install_adapter(std::sync::Arc::new(adapter))
            .await;
    }
    harness
        .gateway
        .providers()
        .set_failover_group(FailoverGroupConfig {
            agent_id: "analytics".to_string(),
            primary_provider_id: "p1".to_string(),
            ordered_backups: vec!["p2".to_string()],
            health_check_enabled: false,
            auto_failover_enabled: true,
            consecutive_failure_threshold: 3,
            revert_to_primary: false,
        })
        .await
        .unwrap();

    // Three calls: p1 fails each time, p2 serves transparently; the
    // third failure trips the threshold and switches the group
    for _ in 0..3 {
        let result = harness
            .gateway
            .handle(Harness::nl_request(&key, "how many sales"))
            .await
            .unwrap();
        assert_eq!(result.row_count, 1);
    }

    let group = harness
        .gateway
        .providers()
        .group_for("analytics")
        .await
        .unwrap();
    assert_eq!(group.active_provider().await, "p2");
    let history = group.switch_history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].to_provider, "p2");

    // The internal recovery was audited
    let failover_events: Vec<_> = harness
        .audit
        .all()
        .into_iter()
        .filter(|e| e.action_kind == ActionKind::ProviderFailover)
        .collect();
    assert_eq!(failover_events.len(), 1);

    // Subsequent calls go straight to the backup
    let before = harness.audit.len();
    harness
        .gateway
        .handle(Harness::nl_request(&key, "how many sales"))
        .await
        .unwrap();
    let new_failovers = harness
        .audit
        .all()
        .into_iter()
        .skip(before)
        .filter(|e| e.action_kind == ActionKind::ProviderFailover)
        .count();
    assert_eq!(new_failovers, 0);
}

#[tokio::test]
async fn test_air_gapped_blocks_hosted_provider_registration() {
    let mut config = GatewayConfig::for_development();
    config.air_gapped = true;
    let harness = Harness::with_config(config, ScriptedDriver::counting()).await;

    let mut hosted = common::provider_config("cloud");
    hosted.kind = provider_manager::ProviderKind::Openai;
    hosted.endpoint = None;

    let report = harness
        .gateway
        .register_provider(hosted)
        .await
        .unwrap_err();
    assert_eq!(report.error, ErrorKind::Blocked);

    // Nothing was stored
    assert!(harness
        .gateway
        .providers()
        .registry()
        .get("cloud")
        .is_err());

    let blocked_events: Vec<_> = harness
        .audit
        .all()
        .into_iter()
        .filter(|e| e.status == AuditStatus::Blocked)
        .collect();
    assert_eq!(blocked_events.len(), 1);
}

#[tokio::test]
async fn test_failed_authentication_audits_without_agent() {
    let harness = Harness::new().await;
    harness.register_analytics().await;

    let report = harness
        .gateway
        .handle(Harness::sql_request("qga_bogus", "SELECT 1"))
        .await
        .unwrap_err();
    assert_eq!(report.error, ErrorKind::Auth);
    assert!(!report.user_friendly_message.is_empty());

    let auth_events: Vec<_> = harness
        .audit
        .all()
        .into_iter()
        .filter(|e| e.action_kind == ActionKind::Authentication)
        .collect();
    assert_eq!(auth_events.len(), 1);
    assert!(auth_events[0].agent_id.is_none());

    // Auth failures produce no cost record
    let (records, _) = harness.gateway.costs().stream_since(0);
    assert!(records.is_empty());
}

#[tokio::test]
async fn test_revoked_agent_is_rejected_and_pools_closed() {
    let harness = Harness::new().await;
    let key = harness.register_analytics().await;
    grant_read_sales(&harness);

    harness
        .gateway
        .handle(Harness::sql_request(&key, "SELECT COUNT(*) FROM public.sales"))
        .await
        .unwrap();

    harness.gateway.revoke_agent("analytics").await.unwrap();

    let report = harness
        .gateway
        .handle(Harness::sql_request(&key, "SELECT COUNT(*) FROM public.sales"))
        .await
        .unwrap_err();
    assert_eq!(report.error, ErrorKind::Revoked);

    // Permissions were cascaded away
    assert!(harness.gateway.permissions().list("analytics").is_empty());
}

#[tokio::test]
async fn test_empty_sql_is_parse_error() {
    let harness = Harness::new().await;
    let key = harness.register_analytics().await;

    for bad in ["", "   ", "-- comment only"] {
        let report = harness
            .gateway
            .handle(Harness::sql_request(&key, bad))
            .await
            .unwrap_err();
        assert_eq!(report.error, ErrorKind::Parse, "input: {:?}", bad);
    }
    assert!(harness.driver.executed().is_empty());
}

#[tokio::test]
async fn test_zero_deadline_times_out_before_driver_work() {
    let harness = Harness::new().await;
    let key = harness.register_analytics().await;
    grant_read_sales(&harness);

    let mut request = Harness::sql_request(&key, "SELECT COUNT(*) FROM public.sales");
    request.deadline_ms = Some(0);

    let report = harness.gateway.handle(request).await.unwrap_err();
    assert_eq!(report.error, ErrorKind::Timeout);
    assert!(harness.driver.executed().is_empty());

    // Audit and cost still recorded for the authenticated call
    let (records, _) = harness.gateway.costs().stream_since(0);
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn test_slow_query_times_out_and_discards_connection() {
    let mut driver = ScriptedDriver::counting();
    driver.execute_delay = Duration::from_millis(500);
    let harness = Harness::with_config(GatewayConfig::for_development(), driver).await;
    let key = harness.register_analytics().await;
    grant_read_sales(&harness);

    let mut request = Harness::sql_request(&key, "SELECT COUNT(*) FROM public.sales");
    request.deadline_ms = Some(100);

    let report = harness.gateway.handle(request).await.unwrap_err();
    assert_eq!(report.error, ErrorKind::Timeout);

    // The abandoned connection was not pooled: a new call opens fresh
    let opened_before = harness.driver.opened.load(Ordering::SeqCst);
    let mut request = Harness::sql_request(&key, "SELECT COUNT(*) FROM public.sales");
    request.deadline_ms = Some(2_000);
    harness.gateway.handle(request).await.unwrap();
    assert!(harness.driver.opened.load(Ordering::SeqCst) > opened_before);
}

#[tokio::test]
async fn test_cancellation_before_execution_issues_no_db_work() {
    let harness = Harness::new().await;
    let key = harness.register_analytics().await;
    grant_read_sales(&harness);

    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = harness
        .gateway
        .handle_with_cancel(
            Harness::sql_request(&key, "SELECT COUNT(*) FROM public.sales"),
            cancel,
        )
        .await
        .unwrap_err();

    assert_eq!(report.error, ErrorKind::Cancelled);
    assert!(harness.driver.executed().is_empty());

    // Cancelled calls still audit and cost
    let cancelled: Vec<_> = harness
        .audit
        .all()
        .into_iter()
        .filter(|e| e.status == AuditStatus::Cancelled)
        .collect();
    assert_eq!(cancelled.len(), 1);
    let (records, _) = harness.gateway.costs().stream_since(0);
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn test_cancellation_during_execution_discards_connection() {
    let mut driver = ScriptedDriver::counting();
    driver.execute_delay = Duration::from_millis(400);
    let harness = Harness::with_config(GatewayConfig::for_development(), driver).await;
    let key = harness.register_analytics().await;
    grant_read_sales(&harness);

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let report = harness
        .gateway
        .handle_with_cancel(
            Harness::sql_request(&key, "SELECT COUNT(*) FROM public.sales"),
            cancel,
        )
        .await
        .unwrap_err();

    assert_eq!(report.error, ErrorKind::Cancelled);
    // The statement reached the driver before cancellation
    assert_eq!(harness.driver.executed().len(), 1);
}

#[tokio::test]
async fn test_generation_failure_reports_truncated_output_and_hints() {
    let harness = Harness::new().await;
    let key = harness.register_analytics().await;
    grant_read_sales(&harness);
    // Both the first pass and the repair pass return junk
    harness
        .install_provider(ScriptedProvider::always("p1", "I cannot write SQL, sorry!"))
        .await;

    let report = harness
        .gateway
        .handle(Harness::nl_request(&key, "count the sales please"))
        .await
        .unwrap_err();

    assert_eq!(report.error, ErrorKind::Generation);
    assert!(report.actionable_details.contains("I cannot write SQL"));
    assert!(!report.suggested_fixes.is_empty());
    assert!(harness.driver.executed().is_empty());
}

#[tokio::test]
async fn test_generation_repair_pass_recovers() {
    let harness = Harness::new().await;
    let key = harness.register_analytics().await;
    grant_read_sales(&harness);
    harness
        .install_provider(ScriptedProvider::scripted(
            "p1",
            vec![ProviderScript::Text("SELEKT oops".to_string())],
            ProviderScript::Text("SELECT COUNT(*) FROM public.sales".to_string()),
        ))
        .await;

    let result = harness
        .gateway
        .handle(Harness::nl_request(&key, "how many sales"))
        .await
        .unwrap();
    assert_eq!(result.row_count, 1);
    assert_eq!(
        result.generated_sql.as_deref(),
        Some("SELECT COUNT(*) FROM public.sales")
    );
}

#[tokio::test]
async fn test_write_statement_requires_write_capability() {
    let harness = Harness::new().await;
    let key = harness.register_analytics().await;
    grant_read_sales(&harness);

    let report = harness
        .gateway
        .handle(Harness::sql_request(
            &key,
            "INSERT INTO public.sales (id) VALUES (1)",
        ))
        .await
        .unwrap_err();
    assert_eq!(report.error, ErrorKind::PermissionDenied);

    // Granting write makes the same statement pass
    harness.gateway.permissions().set(
        "analytics",
        "public.sales",
        ResourceKind::Table,
        caps(&[Capability::Read, Capability::Write]),
    );
    harness
        .gateway
        .handle(Harness::sql_request(
            &key,
            "INSERT INTO public.sales (id) VALUES (1)",
        ))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_provider_defaults_come_from_config() {
    let mut config = GatewayConfig::for_development();
    config.rate_limit.per_minute = 7;
    config.retry.max_attempts = 9;
    let harness = Harness::with_config(config, ScriptedDriver::counting()).await;

    let (limits, retry) = harness.gateway.provider_defaults();
    assert_eq!(limits.per_minute, 7);
    assert_eq!(retry.max_attempts, 9);
}

#[tokio::test]
async fn test_budget_alert_fires_through_pipeline() {
    let harness = Harness::new().await;
    let key = harness.register_analytics().await;
    grant_read_sales(&harness);
    harness
        .install_provider(ScriptedProvider::always(
            "p1",
            "SELECT COUNT(*) FROM public.sales",
        ))
        .await;

    harness.gateway.costs().set_alert(gateway_core::BudgetAlert {
        name: "nl-cap".to_string(),
        threshold_usd: 0.003,
        period: gateway_core::AlertPeriod::Daily,
        scope: gateway_core::AlertScope::PerAgent("analytics".to_string()),
    });

    // Each NL call costs 120/1000*0.01 + 20/1000*0.03 = 0.0018
    harness
        .gateway
        .handle(Harness::nl_request(&key, "how many sales"))
        .await
        .unwrap();
    assert!(harness.notifications.all().is_empty());

    harness
        .gateway
        .handle(Harness::nl_request(&key, "how many sales"))
        .await
        .unwrap();
    assert_eq!(harness.notifications.all().len(), 1);
}
