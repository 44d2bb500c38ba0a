//! Integration tests for direct paging

use escalade::config::EngineConfig;
use escalade::error::EngineError;
use escalade::events::EventBus;
use escalade::models::LogRecordType;
use escalade::services::log_records::LogRecordService;
use escalade::services::paging::{DirectPagingService, PageRequest};
use escalade::services::state_machine::AlertGroupService;
use serial_test::serial;
use sqlx::PgPool;

use crate::common::db::TestDb;
use crate::common::fixtures::{self, TestEngine};

fn request(org: i32, from: i32, users: Vec<(i32, bool)>) -> PageRequest {
    PageRequest {
        organization_id: org,
        team_id: None,
        from_user_id: from,
        title: None,
        message: "Database primary is unreachable".to_string(),
        users,
        existing_group_id: None,
    }
}

async fn seed_users(pool: &PgPool, org: i32, count: usize) -> Vec<i32> {
    let mut ids = Vec::new();
    for i in 0..count {
        let id = fixtures::create_user(pool, org, &format!("user{}", i)).await;
        fixtures::add_notification_policy(pool, id, "default").await;
        fixtures::add_notification_policy(pool, id, "important").await;
        ids.push(id);
    }
    ids
}

#[tokio::test]
#[serial]
async fn test_page_without_team_or_users_is_rejected() {
    let db = TestDb::new().await;
    let org = fixtures::create_org(&db.pool).await;
    let from = fixtures::create_user(&db.pool, org, "pager").await;
    let bus = EventBus::default();

    let err = DirectPagingService::page(&db.pool, &bus, &request(org, from, vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UserOrTeamRequired));
}

#[tokio::test]
#[serial]
async fn test_page_creates_group_and_notifies_despite_ack() {
    let db = TestDb::new().await;
    let org = fixtures::create_org(&db.pool).await;
    let users = seed_users(&db.pool, org, 2).await;
    let from = fixtures::create_user(&db.pool, org, "pager").await;

    let config = EngineConfig {
        bundle_window: std::time::Duration::ZERO,
        ..EngineConfig::default()
    };
    let engine = TestEngine::new(db.pool.clone(), config);

    let group = DirectPagingService::page(
        &db.pool,
        &engine.bus,
        &request(org, from, vec![(users[0], false), (users[1], true)]),
    )
    .await
    .unwrap();

    // Ack from someone else must not mute directly paged users
    AlertGroupService::acknowledge(&db.pool, &engine.config, &engine.bus, group.id, Some(from))
        .await
        .unwrap();
    engine.drain().await;

    let mut sent = engine.notifier.sent_user_ids();
    sent.sort_unstable();
    assert_eq!(sent, users);

    let records = LogRecordService::list_for_group(&db.pool, group.id)
        .await
        .unwrap();
    let paged = records
        .iter()
        .filter(|r| r.record_type == LogRecordType::DirectPaging)
        .count();
    assert_eq!(paged, 2);
}

#[tokio::test]
#[serial]
async fn test_team_page_notifies_team_members() {
    let db = TestDb::new().await;
    let org = fixtures::create_org(&db.pool).await;
    let users = seed_users(&db.pool, org, 2).await;
    let from = fixtures::create_user(&db.pool, org, "pager").await;
    let team = fixtures::create_team(&db.pool, org, "Platform").await;
    for user in &users {
        fixtures::add_team_member(&db.pool, team, *user).await;
    }

    let config = EngineConfig {
        bundle_window: std::time::Duration::ZERO,
        ..EngineConfig::default()
    };
    let engine = TestEngine::new(db.pool.clone(), config);

    let mut req = request(org, from, vec![]);
    req.team_id = Some(team);
    let group = DirectPagingService::page(&db.pool, &engine.bus, &req)
        .await
        .unwrap();
    engine.drain().await;

    assert_eq!(group.title, "Paging team Platform");
    let mut sent = engine.notifier.sent_user_ids();
    sent.sort_unstable();
    assert_eq!(sent, users);

    let records = LogRecordService::list_for_group(&db.pool, group.id)
        .await
        .unwrap();
    let paged = records
        .iter()
        .filter(|r| r.record_type == LogRecordType::DirectPaging)
        .count();
    assert_eq!(paged, 2);
}

#[tokio::test]
#[serial]
async fn test_default_title_names_the_paged_users() {
    let db = TestDb::new().await;
    let org = fixtures::create_org(&db.pool).await;
    let users = seed_users(&db.pool, org, 2).await;
    let from = fixtures::create_user(&db.pool, org, "pager").await;
    let bus = EventBus::default();

    let group = DirectPagingService::page(
        &db.pool,
        &bus,
        &request(org, from, vec![(users[0], false), (users[1], true)]),
    )
    .await
    .unwrap();

    assert_eq!(group.title, "Paging user0, user1");
}

#[tokio::test]
#[serial]
async fn test_manual_integration_is_reused_across_pages() {
    let db = TestDb::new().await;
    let org = fixtures::create_org(&db.pool).await;
    let users = seed_users(&db.pool, org, 1).await;
    let from = fixtures::create_user(&db.pool, org, "pager").await;
    let bus = EventBus::default();

    let group1 = DirectPagingService::page(&db.pool, &bus, &request(org, from, vec![(users[0], false)]))
        .await
        .unwrap();
    let group2 = DirectPagingService::page(&db.pool, &bus, &request(org, from, vec![(users[0], false)]))
        .await
        .unwrap();

    assert_ne!(group1.id, group2.id, "every page is its own group");
    assert_eq!(group1.integration_id, group2.integration_id);

    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM integrations WHERE kind = 'direct_paging'")
            .fetch_one(&db.pool)
            .await
            .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
#[serial]
async fn test_paging_resolved_group_is_rejected() {
    let db = TestDb::new().await;
    let org = fixtures::create_org(&db.pool).await;
    let users = seed_users(&db.pool, org, 1).await;
    let from = fixtures::create_user(&db.pool, org, "pager").await;
    let config = EngineConfig::default();
    let bus = EventBus::default();

    let group = DirectPagingService::page(&db.pool, &bus, &request(org, from, vec![(users[0], false)]))
        .await
        .unwrap();
    AlertGroupService::resolve(&db.pool, &config, &bus, group.id, Some(from))
        .await
        .unwrap();

    let mut retry = request(org, from, vec![(users[0], false)]);
    retry.existing_group_id = Some(group.id);
    let err = DirectPagingService::page(&db.pool, &bus, &retry).await.unwrap_err();
    assert!(matches!(err, EngineError::AlertGroupResolved));
}

#[tokio::test]
#[serial]
async fn test_unpage_stops_pending_notifications_and_is_idempotent() {
    let db = TestDb::new().await;
    let org = fixtures::create_org(&db.pool).await;
    let from = fixtures::create_user(&db.pool, org, "pager").await;
    // Policy: wait 300s, then notify. The unpage lands inside the wait.
    let user = fixtures::create_user(&db.pool, org, "user0").await;
    fixtures::add_notification_wait(&db.pool, user, "default", 0, 300).await;
    sqlx::query(
        "INSERT INTO notification_policies (user_id, tier, position, step, channel) VALUES ($1, 'default', 1, 'notify', 'webhook')",
    )
    .bind(user)
    .execute(&db.pool)
    .await
    .unwrap();

    let config = EngineConfig {
        bundle_window: std::time::Duration::ZERO,
        ..EngineConfig::default()
    };
    let engine = TestEngine::new(db.pool.clone(), config);

    let group = DirectPagingService::page(
        &db.pool,
        &engine.bus,
        &request(org, from, vec![(user, false)]),
    )
    .await
    .unwrap();

    // Run the wait step; the notify task is now queued 300s out
    engine.pump().await;
    assert_eq!(engine.notifier.sent_count(), 0);

    DirectPagingService::unpage_user(&db.pool, group.id, user, Some(from))
        .await
        .unwrap();

    let (pointers,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM active_notification_pointers WHERE user_id = $1",
    )
    .bind(user)
    .fetch_one(&db.pool)
    .await
    .unwrap();
    assert_eq!(pointers, 0);

    // The already-queued notify task fires but must not deliver or
    // resurrect the pointer
    engine.drain().await;
    assert_eq!(engine.notifier.sent_count(), 0);
    let (pointers,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM active_notification_pointers WHERE user_id = $1",
    )
    .bind(user)
    .fetch_one(&db.pool)
    .await
    .unwrap();
    assert_eq!(pointers, 0);

    // Second unpage: nothing pending, no extra record
    DirectPagingService::unpage_user(&db.pool, group.id, user, Some(from))
        .await
        .unwrap();
    let records = LogRecordService::list_for_group(&db.pool, group.id)
        .await
        .unwrap();
    let unpages = records
        .iter()
        .filter(|r| r.record_type == LogRecordType::UnpageUser)
        .count();
    assert_eq!(unpages, 1);
}
