//! Monitor snapshot and alert lifecycle tests

use concierge_storage::monitor::{
    AlertCondition, AlertRule, AlertSeverity, AlertStatus, HealthStatus, MonitorEvent,
};
use concierge_storage::query::SelectQuery;
use concierge_storage::{Error, Guest, TenantScope};
use concierge_tests::{tenant, Fault, Hotel, TestLayer, TestLayerBuilder};
use std::time::Duration;

const BREAKER_KEY: &str = "guests.find_many";

fn open_circuit_rule(cooldown: Duration) -> AlertRule {
    AlertRule::new(
        "open_circuits",
        "Circuit breaker open",
        AlertCondition::OpenCircuits,
        0.0,
        AlertSeverity::Critical,
        cooldown,
    )
}

async fn layer_with_rules(rules: Vec<AlertRule>) -> TestLayer {
    TestLayerBuilder::new()
        .max_attempts(1)
        .circuit(1, Duration::from_secs(60))
        .alert_rules(rules)
        .build()
        .await
        .unwrap()
}

/// Fail one guest query so its breaker opens
async fn trip_breaker(test: &TestLayer) {
    test.store.inject_fault(Fault::ConnectionReset, 1);
    let err = test
        .repository::<Guest>()
        .find_many(&TenantScope::tenant(tenant::primary()), SelectQuery::new())
        .await
        .unwrap_err();
    assert!(!err.is_circuit_open());
    assert_eq!(test.handler().breakers().open_circuits(), vec![BREAKER_KEY.to_string()]);
}

#[tokio::test]
async fn open_circuit_raises_and_auto_resolves_alert() {
    let test = layer_with_rules(vec![open_circuit_rule(Duration::ZERO)]).await;
    let mut events = test.monitor().subscribe();

    trip_breaker(&test).await;
    let snapshot = test.monitor().tick().await;
    assert_eq!(snapshot.health.open_circuits, vec![BREAKER_KEY.to_string()]);
    assert_ne!(snapshot.health.status, HealthStatus::Healthy);

    let active = test.monitor().active_alerts();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].rule_id, "open_circuits");
    assert_eq!(active[0].status, AlertStatus::Active);
    assert_eq!(active[0].observed_value, 1.0);
    match events.try_recv().unwrap() {
        MonitorEvent::AlertRaised(alert) => assert_eq!(alert.id, active[0].id),
        other => panic!("unexpected event {:?}", other),
    }

    // Still open: the alert is not raised twice
    test.monitor().tick().await;
    assert_eq!(test.monitor().active_alerts().len(), 1);
    assert!(events.try_recv().is_err());

    assert!(test.handler().breakers().reset(BREAKER_KEY));
    test.monitor().tick().await;
    assert!(test.monitor().active_alerts().is_empty());

    let history = test.monitor().alert_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, AlertStatus::Resolved);
    assert!(history[0].auto_resolved);
    assert!(history[0].resolved_at.is_some());
    assert!(matches!(
        events.try_recv().unwrap(),
        MonitorEvent::AlertResolved(_)
    ));
}

#[tokio::test]
async fn acknowledge_then_resolve_by_hand() {
    let test = layer_with_rules(vec![open_circuit_rule(Duration::from_secs(600))]).await;
    trip_breaker(&test).await;
    test.monitor().tick().await;
    let alert = test.monitor().active_alerts().remove(0);

    let acknowledged = test
        .monitor()
        .acknowledge_alert(alert.id, "night-manager")
        .unwrap();
    assert_eq!(acknowledged.status, AlertStatus::Acknowledged);
    assert_eq!(acknowledged.acknowledged_by.as_deref(), Some("night-manager"));
    assert!(acknowledged.acknowledged_at.is_some());

    let resolved = test.monitor().resolve_alert(alert.id).unwrap();
    assert_eq!(resolved.status, AlertStatus::Resolved);
    assert!(!resolved.auto_resolved);
    assert!(test.monitor().active_alerts().is_empty());

    // The condition still holds, but the rule is cooling down
    test.monitor().tick().await;
    assert!(test.monitor().active_alerts().is_empty());

    let err = test.monitor().resolve_alert(alert.id).unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    let err = test
        .monitor()
        .acknowledge_alert(uuid::Uuid::new_v4(), "night-manager")
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn pool_utilization_alert_follows_checkouts() {
    let rule = AlertRule::new(
        "pool_utilization",
        "Connection pool saturated",
        AlertCondition::PoolUtilization,
        0.5,
        AlertSeverity::Warning,
        Duration::ZERO,
    );
    let test = TestLayerBuilder::new()
        .max_connections(2)
        .alert_rules(vec![rule])
        .build()
        .await
        .unwrap();

    let first = test.pool().acquire().await.unwrap();
    let second = test.pool().acquire().await.unwrap();
    let snapshot = test.monitor().tick().await;
    assert_eq!(snapshot.connection.active, 2);
    let active = test.monitor().active_alerts();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].observed_value, 1.0);
    assert_eq!(active[0].severity, AlertSeverity::Warning);

    drop(first);
    drop(second);
    test.monitor().tick().await;
    assert!(test.monitor().active_alerts().is_empty());
}

#[tokio::test]
async fn error_rate_alert_counts_failed_operations() {
    let rule = AlertRule::new(
        "high_error_rate",
        "High error rate",
        AlertCondition::ErrorRate,
        0.25,
        AlertSeverity::Critical,
        Duration::ZERO,
    );
    let test = layer_with_rules(vec![rule]).await;
    Hotel::build(tenant::primary(), 1).seed(&test.store);
    let guests = test.repository::<Guest>();
    let scope = TenantScope::tenant(tenant::primary());

    guests.find_many(&scope, SelectQuery::new()).await.unwrap();
    test.store.inject_fault(Fault::StatementTimeout, 1);
    guests.count(&scope, concierge_storage::Filter::All).await.unwrap_err();

    let snapshot = test.monitor().tick().await;
    assert_eq!(snapshot.query.total_queries, 1);
    assert_eq!(snapshot.query.errors, 1);
    assert_eq!(snapshot.performance.error_rate, 0.5);
    assert_eq!(test.monitor().active_alerts().len(), 1);
}

#[tokio::test]
async fn disabled_and_removed_rules_do_not_fire() {
    let test = layer_with_rules(vec![open_circuit_rule(Duration::ZERO)]).await;
    trip_breaker(&test).await;

    test.monitor().set_rule_enabled("open_circuits", false).unwrap();
    test.monitor().tick().await;
    assert!(test.monitor().active_alerts().is_empty());

    test.monitor().set_rule_enabled("open_circuits", true).unwrap();
    test.monitor().tick().await;
    assert_eq!(test.monitor().active_alerts().len(), 1);

    assert!(test.monitor().remove_rule("open_circuits"));
    assert!(!test.monitor().remove_rule("open_circuits"));
    assert!(test.monitor().rules().is_empty());
    assert!(matches!(
        test.monitor().set_rule_enabled("open_circuits", true),
        Err(Error::NotFound(_))
    ));

    test.monitor().add_rule(open_circuit_rule(Duration::ZERO));
    test.monitor().add_rule(open_circuit_rule(Duration::from_secs(5)));
    let rules = test.monitor().rules();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].cooldown, Duration::from_secs(5));
}

#[tokio::test]
async fn snapshots_are_kept_in_order() {
    let test = TestLayerBuilder::new().build().await.unwrap();
    Hotel::build(tenant::primary(), 2).seed(&test.store);
    assert!(test.monitor().latest_snapshot().is_none());

    test.monitor().tick().await;
    test.repository::<Guest>()
        .find_many(&TenantScope::tenant(tenant::primary()), SelectQuery::new())
        .await
        .unwrap();
    test.monitor().tick().await;

    let snapshots = test.monitor().snapshots();
    assert_eq!(snapshots.len(), 2);
    assert!(snapshots[0].timestamp <= snapshots[1].timestamp);
    assert_eq!(snapshots[0].query.total_queries, 0);
    assert_eq!(snapshots[1].query.total_queries, 1);
    assert_eq!(snapshots[1].query.rows_returned, 2);
    assert_eq!(test.monitor().latest_snapshot(), Some(snapshots[1].clone()));
    assert!(snapshots[1].storage.is_none());
}

#[tokio::test]
async fn background_loop_samples_until_shutdown() {
    let test = TestLayerBuilder::new()
        .monitor_every(Duration::from_millis(20))
        .build()
        .await
        .unwrap();
    assert!(test.monitor().is_running());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!test.monitor().snapshots().is_empty());

    test.shutdown().await;
    assert!(!test.monitor().is_running());
}
