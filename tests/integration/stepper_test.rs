//! Integration tests for the per-user notification stepper and bundling

use escalade::config::{EngineConfig, RateLimitConfig};
use escalade::models::{AlertGroup, LogRecordType};
use escalade::services::grouping::GroupingService;
use escalade::services::log_records::LogRecordService;
use escalade::services::notification::NotifyError;
use serde_json::json;
use serial_test::serial;
use sqlx::PgPool;

use crate::common::db::TestDb;
use crate::common::fixtures::{self, StaticOnCallResolver, TestEngine};

struct Scenario {
    integration: i32,
    user: i32,
}

async fn seed(pool: &PgPool) -> Scenario {
    let org = fixtures::create_org(pool).await;
    let integration = fixtures::create_integration(pool, org).await;
    let chain = fixtures::create_chain(pool, org, 0).await;
    fixtures::create_default_filter(pool, integration, Some(chain)).await;

    let user = fixtures::create_user(pool, org, "carol").await;
    fixtures::add_notification_policy(pool, user, "default").await;
    fixtures::add_notification_policy(pool, user, "important").await;
    fixtures::add_notify_persons_step(pool, chain, 0, &[user], false).await;

    Scenario { integration, user }
}

async fn ingest(engine: &TestEngine, pool: &PgPool, integration: i32, key: &str) -> AlertGroup {
    let (group, _) = GroupingService::ingest(
        pool,
        &engine.config,
        &RateLimitConfig::from_env(),
        &StaticOnCallResolver { user_ids: vec![] },
        &engine.bus,
        integration,
        json!({ "grouping_key": key, "title": format!("Alert {}", key) }),
    )
    .await
    .unwrap()
    .unwrap();
    group
}

#[tokio::test]
#[serial]
async fn test_low_priority_burst_bundles_into_one_delivery() {
    let db = TestDb::new().await;
    let s = seed(&db.pool).await;
    let engine = TestEngine::new(db.pool.clone(), EngineConfig::default());

    let group_a = ingest(&engine, &db.pool, s.integration, "a").await;
    let group_b = ingest(&engine, &db.pool, s.integration, "b").await;

    // Escalation steps and bundle inserts run now; the flush stays in the
    // future until drained
    engine.pump().await;
    assert_eq!(engine.notifier.sent_count(), 0, "nothing fires inside the window");

    let (bundles,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM notification_bundles")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(bundles, 1);

    engine.drain().await;

    let sent = engine.notifier.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1, "one merged delivery for the burst");
    let (user, message) = &sent[0];
    assert_eq!(*user, s.user);
    assert_eq!(message.alert_group_ids.len(), 2);
    assert!(message.alert_group_ids.contains(&group_a.id));
    assert!(message.alert_group_ids.contains(&group_b.id));
}

#[tokio::test]
#[serial]
async fn test_acknowledged_groups_drop_out_of_the_bundle() {
    let db = TestDb::new().await;
    let s = seed(&db.pool).await;
    let engine = TestEngine::new(db.pool.clone(), EngineConfig::default());

    let group_a = ingest(&engine, &db.pool, s.integration, "a").await;
    let group_b = ingest(&engine, &db.pool, s.integration, "b").await;
    engine.pump().await;

    escalade::services::state_machine::AlertGroupService::acknowledge(
        &db.pool,
        &engine.config,
        &engine.bus,
        group_a.id,
        Some(s.user),
    )
    .await
    .unwrap();

    engine.drain().await;

    let sent = engine.notifier.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1.alert_group_ids, vec![group_b.id]);
}

#[tokio::test]
#[serial]
async fn test_zero_window_sends_directly() {
    let db = TestDb::new().await;
    let s = seed(&db.pool).await;
    let config = EngineConfig {
        bundle_window: std::time::Duration::ZERO,
        ..EngineConfig::default()
    };
    let engine = TestEngine::new(db.pool.clone(), config);

    let group = ingest(&engine, &db.pool, s.integration, "a").await;
    engine.pump().await;

    assert_eq!(engine.notifier.sent_count(), 1);
    let (bundles,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM notification_bundles")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(bundles, 0);

    let records = LogRecordService::list_for_group(&db.pool, group.id)
        .await
        .unwrap();
    assert!(records
        .iter()
        .any(|r| r.record_type == LogRecordType::PersonalNotificationTriggered));
}

#[tokio::test]
#[serial]
async fn test_redelivered_notify_task_does_not_double_page() {
    let db = TestDb::new().await;
    let s = seed(&db.pool).await;
    let config = EngineConfig {
        bundle_window: std::time::Duration::ZERO,
        ..EngineConfig::default()
    };
    let engine = TestEngine::new(db.pool.clone(), config);

    let group = ingest(&engine, &db.pool, s.integration, "a").await;
    engine.pump().await;
    assert_eq!(engine.notifier.sent_count(), 1);

    // Requeue the completed notify task as if the worker had crashed after
    // the send but before marking it done
    sqlx::query(
        "UPDATE scheduled_tasks SET status = 'pending', eta = NOW() WHERE kind = 'notify_user' AND payload->>'position' = '0'",
    )
    .execute(&db.pool)
    .await
    .unwrap();
    engine.pump().await;

    assert_eq!(engine.notifier.sent_count(), 1, "log record dedup must hold");
    let records = LogRecordService::list_for_group(&db.pool, group.id)
        .await
        .unwrap();
    let triggered = records
        .iter()
        .filter(|r| r.record_type == LogRecordType::PersonalNotificationTriggered)
        .count();
    assert_eq!(triggered, 1);
}

#[tokio::test]
#[serial]
async fn test_terminal_delivery_failure_records_and_moves_on() {
    let db = TestDb::new().await;
    let s = seed(&db.pool).await;
    let config = EngineConfig {
        bundle_window: std::time::Duration::ZERO,
        ..EngineConfig::default()
    };
    let engine = TestEngine::new(db.pool.clone(), config);
    *engine.notifier.fail_with.lock().unwrap() = Some(NotifyError::NotVerified);

    let group = ingest(&engine, &db.pool, s.integration, "a").await;
    engine.drain().await;

    assert_eq!(engine.notifier.sent_count(), 0);
    let records = LogRecordService::list_for_group(&db.pool, group.id)
        .await
        .unwrap();
    assert!(records
        .iter()
        .any(|r| r.record_type == LogRecordType::PersonalNotificationFailed
            && r.error_code.as_deref() == Some("not_verified")));
}

#[tokio::test]
#[serial]
async fn test_policy_wait_step_delays_the_next_notify() {
    let db = TestDb::new().await;
    let s = seed(&db.pool).await;
    fixtures::add_notification_wait(&db.pool, s.user, "default", 1, 300).await;
    sqlx::query(
        "INSERT INTO notification_policies (user_id, tier, position, step, channel) VALUES ($1, 'default', 2, 'notify', 'webhook')",
    )
    .bind(s.user)
    .execute(&db.pool)
    .await
    .unwrap();

    let config = EngineConfig {
        bundle_window: std::time::Duration::ZERO,
        ..EngineConfig::default()
    };
    let engine = TestEngine::new(db.pool.clone(), config);

    ingest(&engine, &db.pool, s.integration, "a").await;
    engine.pump().await;
    assert_eq!(engine.notifier.sent_count(), 1, "wait holds the second send");

    engine.drain().await;
    assert_eq!(engine.notifier.sent_count(), 2);
    assert_eq!(engine.notifier.sent_user_ids(), vec![s.user, s.user]);
}

#[tokio::test]
#[serial]
async fn test_acknowledged_group_stops_the_stepper() {
    let db = TestDb::new().await;
    let s = seed(&db.pool).await;
    fixtures::add_notification_wait(&db.pool, s.user, "default", 1, 300).await;
    sqlx::query(
        "INSERT INTO notification_policies (user_id, tier, position, step, channel) VALUES ($1, 'default', 2, 'notify', 'webhook')",
    )
    .bind(s.user)
    .execute(&db.pool)
    .await
    .unwrap();

    let config = EngineConfig {
        bundle_window: std::time::Duration::ZERO,
        ..EngineConfig::default()
    };
    let engine = TestEngine::new(db.pool.clone(), config);

    let group = ingest(&engine, &db.pool, s.integration, "a").await;
    engine.pump().await;
    assert_eq!(engine.notifier.sent_count(), 1);

    escalade::services::state_machine::AlertGroupService::acknowledge(
        &db.pool,
        &engine.config,
        &engine.bus,
        group.id,
        Some(s.user),
    )
    .await
    .unwrap();
    engine.drain().await;

    assert_eq!(engine.notifier.sent_count(), 1, "ack halts the personal plan");
    let (pointers,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM active_notification_pointers WHERE alert_group_id = $1")
            .bind(group.id)
            .fetch_one(&db.pool)
            .await
            .unwrap();
    assert_eq!(pointers, 0);
}
