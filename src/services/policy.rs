//! Personal notification policy management.

use sqlx::PgPool;

use crate::error::{EngineError, EngineResult};
use crate::models::{NotificationPolicyStep, PolicyTier};

pub struct NotificationPolicyService;

impl NotificationPolicyService {
    pub async fn list(
        pool: &PgPool,
        user_id: i32,
        tier: PolicyTier,
    ) -> EngineResult<Vec<NotificationPolicyStep>> {
        let steps = sqlx::query_as::<_, NotificationPolicyStep>(
            r#"
            SELECT * FROM notification_policies
            WHERE user_id = $1 AND tier = $2::text::varchar
            ORDER BY position
            "#,
        )
        .bind(user_id)
        .bind(tier.to_string())
        .fetch_all(pool)
        .await?;
        Ok(steps)
    }

    /// Deletes one step and compacts positions. A tier must keep at least
    /// one step so escalations to the user never become silent no-ops.
    pub async fn delete_step(pool: &PgPool, user_id: i32, step_id: i32) -> EngineResult<()> {
        let mut tx = pool.begin().await?;

        let step = sqlx::query_as::<_, NotificationPolicyStep>(
            "SELECT * FROM notification_policies WHERE id = $1 AND user_id = $2 FOR UPDATE",
        )
        .bind(step_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("Notification policy step {} not found", step_id)))?;

        let (remaining,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM notification_policies WHERE user_id = $1 AND tier = $2::text::varchar",
        )
        .bind(user_id)
        .bind(step.tier.to_string())
        .fetch_one(&mut *tx)
        .await?;

        if remaining <= 1 {
            return Err(EngineError::LastPolicyStep);
        }

        sqlx::query("DELETE FROM notification_policies WHERE id = $1")
            .bind(step_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            UPDATE notification_policies
            SET position = position - 1
            WHERE user_id = $1 AND tier = $2::text::varchar AND position > $3
            "#,
        )
        .bind(user_id)
        .bind(step.tier.to_string())
        .bind(step.position)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}
