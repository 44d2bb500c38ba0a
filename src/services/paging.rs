//! Direct paging: page specific users about a new or existing group without
//! going through an integration's escalation chain.

use chrono::Utc;
use log::{info, warn};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::models::{
    AlertGroup, Integration, LogRecordType, NotifyUserPayload, PolicyTier, TaskKind,
};
use crate::queue::TaskQueue;
use crate::services::log_records::LogRecordService;

pub struct PageRequest {
    pub organization_id: i32,
    pub team_id: Option<i32>,
    pub from_user_id: i32,
    pub title: Option<String>,
    pub message: String,
    /// (user_id, important)
    pub users: Vec<(i32, bool)>,
    /// Page about an existing group instead of creating one
    pub existing_group_id: Option<Uuid>,
}

pub struct DirectPagingService;

impl DirectPagingService {
    pub async fn page(
        pool: &PgPool,
        bus: &EventBus,
        request: &PageRequest,
    ) -> EngineResult<AlertGroup> {
        if request.team_id.is_none() && request.users.is_empty() {
            return Err(EngineError::UserOrTeamRequired);
        }

        let group = match request.existing_group_id {
            Some(group_id) => {
                let group = sqlx::query_as::<_, AlertGroup>(
                    "SELECT * FROM alert_groups WHERE id = $1 AND NOT archived",
                )
                .bind(group_id)
                .fetch_optional(pool)
                .await?
                .ok_or_else(|| {
                    EngineError::NotFound(format!("Alert group {} not found", group_id))
                })?;
                if group.resolved {
                    return Err(EngineError::AlertGroupResolved);
                }
                group
            }
            None => Self::create_paging_group(pool, request).await?,
        };

        // A team target pages its members, at the default tier unless the
        // same user is also listed explicitly
        let mut targets = request.users.clone();
        if let Some(team_id) = request.team_id {
            for user_id in Self::team_members(pool, team_id).await? {
                if !targets.iter().any(|(id, _)| *id == user_id) {
                    targets.push((user_id, false));
                }
            }
        }
        if targets.is_empty() {
            warn!(
                "Page on group {} resolved to no users (team {:?} has no members)",
                group.id, request.team_id
            );
        }

        for (user_id, important) in &targets {
            LogRecordService::append(
                pool,
                group.id,
                LogRecordType::DirectPaging,
                Some(request.from_user_id),
                None,
                serde_json::json!({ "paged_user_id": user_id, "important": important }),
                None,
            )
            .await?;

            // Paged users are notified even when someone already acknowledged
            TaskQueue::enqueue(
                pool,
                TaskKind::NotifyUser,
                &NotifyUserPayload {
                    alert_group_id: group.id,
                    user_id: *user_id,
                    tier: PolicyTier::from_important(*important),
                    position: 0,
                    bypass_acknowledged: true,
                },
                Utc::now(),
            )
            .await?;
        }

        if request.existing_group_id.is_none() {
            bus.publish(EngineEvent::GroupCreated {
                alert_group_id: group.id,
            });
        } else {
            bus.publish(EngineEvent::GroupRefresh {
                alert_group_id: group.id,
            });
        }

        info!(
            "User {} paged {} user(s) on group {}",
            request.from_user_id,
            targets.len(),
            group.id
        );
        Ok(group)
    }

    /// Stops notifying one user about a group. Idempotent: unpaging a user
    /// with nothing pending is a no-op.
    pub async fn unpage_user(
        pool: &PgPool,
        alert_group_id: Uuid,
        user_id: i32,
        by: Option<i32>,
    ) -> EngineResult<()> {
        let mut tx = pool.begin().await?;

        let deleted = sqlx::query(
            "DELETE FROM active_notification_pointers WHERE user_id = $1 AND alert_group_id = $2",
        )
        .bind(user_id)
        .bind(alert_group_id)
        .execute(&mut *tx)
        .await?;

        if deleted.rows_affected() == 0 {
            return Ok(());
        }

        LogRecordService::append(
            &mut *tx,
            alert_group_id,
            LogRecordType::UnpageUser,
            by,
            None,
            serde_json::json!({ "unpaged_user_id": user_id }),
            None,
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn create_paging_group(
        pool: &PgPool,
        request: &PageRequest,
    ) -> EngineResult<AlertGroup> {
        let integration =
            Self::ensure_manual_integration(pool, request.organization_id, request.team_id).await?;

        let title = match &request.title {
            Some(title) => title.clone(),
            None => Self::compose_title(pool, request).await?,
        };
        let grouping_key = format!("direct-paging-{}", Uuid::new_v4());
        let key_hash = crate::services::grouping::GroupingService::hash_grouping_key(&grouping_key);

        let mut tx = pool.begin().await?;
        let group = sqlx::query_as::<_, AlertGroup>(
            r#"
            INSERT INTO alert_groups
                (id, integration_id, title, grouping_key, grouping_key_hash, started_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(integration.id)
        .bind(&title)
        .bind(&grouping_key)
        .bind(&key_hash)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO alerts (id, alert_group_id, integration_id, payload, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(group.id)
        .bind(integration.id)
        .bind(serde_json::json!({
            "title": title,
            "message": request.message,
            "paged_by": request.from_user_id,
        }))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(group)
    }

    async fn team_members(pool: &PgPool, team_id: i32) -> EngineResult<Vec<i32>> {
        let rows: Vec<(i32,)> = sqlx::query_as(
            "SELECT user_id FROM team_members WHERE team_id = $1 ORDER BY user_id",
        )
        .bind(team_id)
        .fetch_all(pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Default title names who is being paged: "Paging team Platform" or
    /// "Paging alice, bob"
    async fn compose_title(pool: &PgPool, request: &PageRequest) -> EngineResult<String> {
        let mut parts = Vec::new();

        if let Some(team_id) = request.team_id {
            let team: Option<(String,)> = sqlx::query_as("SELECT name FROM teams WHERE id = $1")
                .bind(team_id)
                .fetch_optional(pool)
                .await?;
            if let Some((name,)) = team {
                parts.push(format!("team {}", name));
            }
        }

        if !request.users.is_empty() {
            let ids: Vec<i32> = request.users.iter().map(|(id, _)| *id).collect();
            let names: Vec<(String,)> = sqlx::query_as(
                "SELECT username FROM users WHERE id = ANY($1) ORDER BY username",
            )
            .bind(&ids)
            .fetch_all(pool)
            .await?;
            parts.extend(names.into_iter().map(|(name,)| name));
        }

        if parts.is_empty() {
            return Ok(request.message.chars().take(120).collect());
        }
        Ok(format!("Paging {}", parts.join(", ")))
    }

    /// One hidden direct-paging integration per (organization, team),
    /// provisioned on first use. Concurrent first pages race on the partial
    /// unique index and both end up reading the same row.
    async fn ensure_manual_integration(
        pool: &PgPool,
        organization_id: i32,
        team_id: Option<i32>,
    ) -> EngineResult<Integration> {
        sqlx::query(
            r#"
            INSERT INTO integrations (organization_id, team_id, name, kind)
            VALUES ($1, $2, 'Direct paging', 'direct_paging')
            ON CONFLICT (organization_id, COALESCE(team_id, 0)) WHERE kind = 'direct_paging'
            DO NOTHING
            "#,
        )
        .bind(organization_id)
        .bind(team_id)
        .execute(pool)
        .await?;

        let integration = sqlx::query_as::<_, Integration>(
            r#"
            SELECT * FROM integrations
            WHERE organization_id = $1
              AND team_id IS NOT DISTINCT FROM $2
              AND kind = 'direct_paging'
            "#,
        )
        .bind(organization_id)
        .bind(team_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| {
            EngineError::Internal("direct paging integration provisioning failed".into())
        })?;

        Ok(integration)
    }
}
