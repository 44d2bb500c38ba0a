use sqlx::PgPool;
use uuid::Uuid;

use crate::error::EngineResult;
use crate::models::{LogRecord, LogRecordType};

pub struct LogRecordService;

impl LogRecordService {
    /// Appends one log record. Works inside or outside a transaction.
    pub async fn append<'e, E>(
        executor: E,
        alert_group_id: Uuid,
        record_type: LogRecordType,
        author_id: Option<i32>,
        escalation_policy_id: Option<i32>,
        step_info: serde_json::Value,
        error_code: Option<&str>,
    ) -> EngineResult<i64>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let id: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO alert_group_log_records
                (alert_group_id, record_type, author_id, escalation_policy_id, step_info, error_code)
            VALUES ($1, $2::text::varchar, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(alert_group_id)
        .bind(record_type.to_string())
        .bind(author_id)
        .bind(escalation_policy_id)
        .bind(step_info)
        .bind(error_code)
        .fetch_one(executor)
        .await?;

        Ok(id.0)
    }

    /// Lists a group's records oldest-first
    pub async fn list_for_group(pool: &PgPool, alert_group_id: Uuid) -> EngineResult<Vec<LogRecord>> {
        let records = sqlx::query_as::<_, LogRecord>(
            r#"
            SELECT * FROM alert_group_log_records
            WHERE alert_group_id = $1
            ORDER BY id
            "#,
        )
        .bind(alert_group_id)
        .fetch_all(pool)
        .await?;

        Ok(records)
    }

    /// Idempotency check for the notification stepper: has this user already
    /// been notified for this personal policy step on this group?
    pub async fn personal_notification_exists(
        pool: &PgPool,
        alert_group_id: Uuid,
        user_id: i32,
        policy_step_id: i32,
    ) -> EngineResult<bool> {
        let existing: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT id FROM alert_group_log_records
            WHERE alert_group_id = $1
              AND author_id = $2
              AND record_type = 'personal_notification_triggered'
              AND (step_info->>'policy_step_id')::int = $3
            LIMIT 1
            "#,
        )
        .bind(alert_group_id)
        .bind(user_id)
        .bind(policy_step_id)
        .fetch_optional(pool)
        .await?;

        Ok(existing.is_some())
    }
}
