//! Fixed-window ingestion quotas, tracked per organization and per
//! integration. When a window overflows, a `quota_exceeded_until` marker is
//! stamped so subsequent checks short-circuit without counting.

use chrono::{Duration, Utc};
use log::warn;
use sqlx::PgPool;

use crate::config::RateLimitConfig;
use crate::error::EngineResult;

pub struct RateLimitService;

impl RateLimitService {
    /// Returns true when the alert may be ingested.
    pub async fn check_quota(
        pool: &PgPool,
        organization_id: i32,
        integration_id: i32,
    ) -> EngineResult<bool> {
        let row: Option<(Option<chrono::DateTime<Utc>>, Option<chrono::DateTime<Utc>>)> =
            sqlx::query_as(
                r#"
                SELECT o.quota_exceeded_until, i.quota_exceeded_until
                FROM organizations o
                JOIN integrations i ON i.organization_id = o.id
                WHERE o.id = $1 AND i.id = $2
                "#,
            )
            .bind(organization_id)
            .bind(integration_id)
            .fetch_optional(pool)
            .await?;

        let now = Utc::now();
        match row {
            Some((org_until, int_until)) => {
                let org_blocked = org_until.map(|t| t > now).unwrap_or(false);
                let int_blocked = int_until.map(|t| t > now).unwrap_or(false);
                Ok(!org_blocked && !int_blocked)
            }
            None => Ok(false),
        }
    }

    /// Re-counts the current window after an ingest and stamps the exceeded
    /// markers when a limit was crossed.
    pub async fn update_quota_state(
        pool: &PgPool,
        config: &RateLimitConfig,
        organization_id: i32,
        integration_id: i32,
    ) -> EngineResult<()> {
        let window_start = Utc::now() - Duration::seconds(60);

        let (org_count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM alerts a
            JOIN integrations i ON i.id = a.integration_id
            WHERE i.organization_id = $1 AND a.created_at >= $2
            "#,
        )
        .bind(organization_id)
        .bind(window_start)
        .fetch_one(pool)
        .await?;

        if org_count >= config.max_alerts_per_org_per_minute {
            warn!(
                "Organization {} exceeded ingestion quota ({} alerts/min)",
                organization_id, org_count
            );
            sqlx::query(
                "UPDATE organizations SET quota_exceeded_until = NOW() + INTERVAL '1 minute' WHERE id = $1",
            )
            .bind(organization_id)
            .execute(pool)
            .await?;
        }

        let (int_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM alerts WHERE integration_id = $1 AND created_at >= $2",
        )
        .bind(integration_id)
        .bind(window_start)
        .fetch_one(pool)
        .await?;

        if int_count >= config.max_alerts_per_integration_per_minute {
            warn!(
                "Integration {} exceeded ingestion quota ({} alerts/min)",
                integration_id, int_count
            );
            sqlx::query(
                "UPDATE integrations SET quota_exceeded_until = NOW() + INTERVAL '1 minute' WHERE id = $1",
            )
            .bind(integration_id)
            .execute(pool)
            .await?;
        }

        Ok(())
    }
}
