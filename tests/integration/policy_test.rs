//! Integration tests for personal notification policy management

use escalade::error::EngineError;
use escalade::models::PolicyTier;
use escalade::services::policy::NotificationPolicyService;
use serial_test::serial;

use crate::common::db::TestDb;
use crate::common::fixtures;

#[tokio::test]
#[serial]
async fn test_delete_step_compacts_positions() {
    let db = TestDb::new().await;
    let org = fixtures::create_org(&db.pool).await;
    let user = fixtures::create_user(&db.pool, org, "dave").await;

    fixtures::add_notification_policy(&db.pool, user, "default").await;
    let wait = fixtures::add_notification_wait(&db.pool, user, "default", 1, 300).await;
    sqlx::query(
        "INSERT INTO notification_policies (user_id, tier, position, step, channel) VALUES ($1, 'default', 2, 'notify', 'webhook')",
    )
    .bind(user)
    .execute(&db.pool)
    .await
    .unwrap();

    NotificationPolicyService::delete_step(&db.pool, user, wait)
        .await
        .unwrap();

    let steps = NotificationPolicyService::list(&db.pool, user, PolicyTier::Default)
        .await
        .unwrap();
    let positions: Vec<i32> = steps.iter().map(|s| s.position).collect();
    assert_eq!(positions, vec![0, 1]);
}

#[tokio::test]
#[serial]
async fn test_last_step_of_a_tier_cannot_be_deleted() {
    let db = TestDb::new().await;
    let org = fixtures::create_org(&db.pool).await;
    let user = fixtures::create_user(&db.pool, org, "dave").await;

    let only = fixtures::add_notification_policy(&db.pool, user, "default").await;
    // A step on the other tier does not count
    fixtures::add_notification_policy(&db.pool, user, "important").await;

    let err = NotificationPolicyService::delete_step(&db.pool, user, only)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LastPolicyStep));

    let steps = NotificationPolicyService::list(&db.pool, user, PolicyTier::Default)
        .await
        .unwrap();
    assert_eq!(steps.len(), 1);
}

#[tokio::test]
#[serial]
async fn test_deleting_another_users_step_is_not_found() {
    let db = TestDb::new().await;
    let org = fixtures::create_org(&db.pool).await;
    let owner = fixtures::create_user(&db.pool, org, "erin").await;
    let other = fixtures::create_user(&db.pool, org, "frank").await;

    let step = fixtures::add_notification_policy(&db.pool, owner, "default").await;

    let err = NotificationPolicyService::delete_step(&db.pool, other, step)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}
