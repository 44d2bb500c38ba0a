//! Postgres-backed delayed task queue.
//!
//! Tasks are rows with an ETA; stateless workers claim due rows with
//! `FOR UPDATE SKIP LOCKED` and retry failures with exponential backoff plus
//! jitter. Delivery is at-least-once: cancellation is never needed because
//! handlers re-validate group state and task identity before producing side
//! effects.

pub mod worker;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::models::{ScheduledTask, TaskKind};

pub use worker::Worker;

pub struct TaskQueue;

impl TaskQueue {
    /// Submits a task for execution at `eta`. Returns the task row id.
    pub async fn enqueue<'e, E, P>(
        executor: E,
        kind: TaskKind,
        payload: &P,
        eta: DateTime<Utc>,
    ) -> EngineResult<Uuid>
    where
        E: sqlx::PgExecutor<'e>,
        P: Serialize,
    {
        let id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO scheduled_tasks (kind, payload, eta)
            VALUES ($1::text::varchar, $2, $3)
            RETURNING id
            "#,
        )
        .bind(kind.to_string())
        .bind(serde_json::to_value(payload)?)
        .bind(eta)
        .fetch_one(executor)
        .await?;

        Ok(id.0)
    }

    /// Claims up to `batch` due tasks, marking them running. Concurrent
    /// workers skip each other's rows instead of blocking.
    pub async fn claim_due(pool: &PgPool, batch: i64) -> EngineResult<Vec<ScheduledTask>> {
        let tasks = sqlx::query_as::<_, ScheduledTask>(
            r#"
            UPDATE scheduled_tasks
            SET status = 'running', attempts = attempts + 1, updated_at = NOW()
            WHERE id IN (
                SELECT id FROM scheduled_tasks
                WHERE status = 'pending' AND eta <= NOW()
                ORDER BY eta
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(batch)
        .fetch_all(pool)
        .await?;

        Ok(tasks)
    }

    pub async fn complete(pool: &PgPool, id: Uuid) -> EngineResult<()> {
        sqlx::query("UPDATE scheduled_tasks SET status = 'done', updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Requeues a failed task with backoff, or marks it failed once the
    /// attempt budget is exhausted. Returns true if the task will run again.
    pub async fn retry_or_fail(
        pool: &PgPool,
        task: &ScheduledTask,
        error: &str,
        config: &EngineConfig,
    ) -> EngineResult<bool> {
        if task.attempts >= config.max_task_attempts {
            sqlx::query(
                r#"
                UPDATE scheduled_tasks
                SET status = 'failed', last_error = $2, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(task.id)
            .bind(error)
            .execute(pool)
            .await?;
            return Ok(false);
        }

        let delay = Self::backoff_delay(task.attempts, config.retry_base, config.retry_max);
        let next_eta = Utc::now()
            + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::seconds(60));

        sqlx::query(
            r#"
            UPDATE scheduled_tasks
            SET status = 'pending', eta = $2, last_error = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(task.id)
        .bind(next_eta)
        .bind(error)
        .execute(pool)
        .await?;

        Ok(true)
    }

    /// Exponential backoff capped at `max`, with 10% jitter
    pub fn backoff_delay(attempts: i32, base: Duration, max: Duration) -> Duration {
        let attempt = attempts.max(1) as u32;
        let exp = base
            .checked_mul(2u32.saturating_pow(attempt - 1))
            .unwrap_or(max);
        let capped = exp.min(max);
        let jitter = capped.mul_f64(0.1 * rand::random::<f64>());
        capped + jitter
    }

    /// Marks a task failed without retrying (non-retryable errors)
    pub async fn fail(pool: &PgPool, id: Uuid, error: &str) -> EngineResult<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_tasks
            SET status = 'failed', last_error = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(pool)
        .await?;
        Ok(())
    }
}
