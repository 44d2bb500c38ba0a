//! Alert ingestion and grouping.
//!
//! Concurrent alerts with the same grouping key must land in one group. The
//! decision goes through a versioned counter row: readers take no lock, and
//! the creator's counter update carries the version it read. A lost race
//! shows up as zero affected rows, rolls the creation back, and the ingest
//! retries with jitter.

use chrono::Utc;
use log::{debug, info, warn};
use rand::Rng;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::{EngineConfig, RateLimitConfig};
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::models::{Alert, AlertGroup, ChannelFilter, Integration};
use crate::services::escalation::{EscalationService, OnCallResolver};
use crate::services::rate_limit::RateLimitService;
use crate::services::snapshot::SnapshotService;

pub struct GroupingService;

impl GroupingService {
    /// SHA-256 over the raw grouping key, hex-encoded. The hash is the
    /// counter's key so arbitrarily long keys stay indexable.
    pub fn hash_grouping_key(key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Grouping key for a payload: explicit hint first, then stable payload
    /// fields, then the title.
    pub fn derive_grouping_key(payload: &serde_json::Value) -> String {
        if let Some(hint) = payload.get("grouping_key").and_then(|v| v.as_str()) {
            return hint.to_string();
        }
        if let Some(fingerprint) = payload.get("fingerprint").and_then(|v| v.as_str()) {
            return fingerprint.to_string();
        }
        Self::derive_title(payload)
    }

    pub fn derive_title(payload: &serde_json::Value) -> String {
        payload
            .get("title")
            .or_else(|| payload.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("Alert")
            .to_string()
    }

    /// Ingestion entry point. Returns `None` when the alert was dropped by
    /// the rate limiter.
    pub async fn ingest(
        pool: &PgPool,
        engine: &EngineConfig,
        rate_limit: &RateLimitConfig,
        resolver: &dyn OnCallResolver,
        bus: &EventBus,
        integration_id: i32,
        payload: serde_json::Value,
    ) -> EngineResult<Option<(AlertGroup, Alert)>> {
        let integration = sqlx::query_as::<_, Integration>(
            "SELECT * FROM integrations WHERE id = $1",
        )
        .bind(integration_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("Integration {} not found", integration_id)))?;

        if !RateLimitService::check_quota(pool, integration.organization_id, integration.id).await? {
            warn!(
                "Alert for integration {} dropped: ingestion quota exceeded",
                integration.id
            );
            return Ok(None);
        }

        let grouping_key = Self::derive_grouping_key(&payload);
        let title = Self::derive_title(&payload);
        let label_severity = payload
            .get("severity")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let mut attempt = 0u32;
        let (group, alert, created) = loop {
            match Self::resolve_group(
                pool,
                &integration,
                &grouping_key,
                &title,
                label_severity.as_deref(),
                &payload,
            )
            .await
            {
                Ok(result) => break result,
                Err(EngineError::ConcurrentUpdate) if attempt < engine.max_grouping_retries => {
                    attempt += 1;
                    let jitter_ms = rand::rng().random_range(1..=10) * 10;
                    debug!(
                        "Grouping counter contended for key '{}' (attempt {}), backing off {}ms",
                        grouping_key, attempt, jitter_ms
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(jitter_ms)).await;
                }
                Err(err) => return Err(err),
            }
        };

        RateLimitService::update_quota_state(
            pool,
            rate_limit,
            integration.organization_id,
            integration.id,
        )
        .await?;

        if created {
            info!(
                "Created alert group {} for integration {} (key '{}')",
                group.id, integration.id, grouping_key
            );
            Self::start_escalation(pool, resolver, &group).await?;
            bus.publish(EngineEvent::GroupCreated {
                alert_group_id: group.id,
            });
        } else {
            bus.publish(EngineEvent::GroupRefresh {
                alert_group_id: group.id,
            });
        }

        Ok(Some((group, alert)))
    }

    /// One attach-or-create attempt. `Err(ConcurrentUpdate)` means another
    /// writer moved the counter between our read and our update.
    pub async fn resolve_group(
        pool: &PgPool,
        integration: &Integration,
        grouping_key: &str,
        title: &str,
        label_severity: Option<&str>,
        payload: &serde_json::Value,
    ) -> EngineResult<(AlertGroup, Alert, bool)> {
        let key_hash = Self::hash_grouping_key(grouping_key);
        let mut tx = pool.begin().await?;

        let counter: Option<(i64, Option<Uuid>)> = sqlx::query_as(
            r#"
            SELECT version, alert_group_id FROM grouping_counters
            WHERE integration_id = $1 AND grouping_key_hash = $2
            "#,
        )
        .bind(integration.id)
        .bind(&key_hash)
        .fetch_optional(&mut *tx)
        .await?;

        let expected_version = counter.as_ref().map(|(v, _)| *v).unwrap_or(0);

        if let Some((_, Some(group_id))) = &counter {
            let existing = sqlx::query_as::<_, AlertGroup>(
                "SELECT * FROM alert_groups WHERE id = $1",
            )
            .bind(group_id)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(group) = existing.filter(|g| g.is_open()) {
                let alert = Self::insert_alert(&mut tx, &group, integration.id, payload).await?;
                tx.commit().await?;
                return Ok((group, alert, false));
            }
        }

        // Create path: the counter update only lands if the version we read
        // is still current.
        let channel_filter_id = Self::default_channel_filter(&mut tx, integration.id).await?;
        let group = sqlx::query_as::<_, AlertGroup>(
            r#"
            INSERT INTO alert_groups
                (id, integration_id, channel_filter_id, title, grouping_key,
                 grouping_key_hash, label_severity, started_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(integration.id)
        .bind(channel_filter_id)
        .bind(title)
        .bind(grouping_key)
        .bind(&key_hash)
        .bind(label_severity)
        .fetch_one(&mut *tx)
        .await?;

        let alert = Self::insert_alert(&mut tx, &group, integration.id, payload).await?;

        let result = sqlx::query(
            r#"
            INSERT INTO grouping_counters (integration_id, grouping_key_hash, version, alert_group_id)
            VALUES ($1, $2, 1, $3)
            ON CONFLICT (integration_id, grouping_key_hash) DO UPDATE
            SET version = grouping_counters.version + 1,
                alert_group_id = EXCLUDED.alert_group_id
            WHERE grouping_counters.version = $4
            "#,
        )
        .bind(integration.id)
        .bind(&key_hash)
        .bind(group.id)
        .bind(expected_version)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(EngineError::ConcurrentUpdate);
        }

        tx.commit().await?;
        Ok((group, alert, true))
    }

    async fn insert_alert(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        group: &AlertGroup,
        integration_id: i32,
        payload: &serde_json::Value,
    ) -> EngineResult<Alert> {
        let alert = sqlx::query_as::<_, Alert>(
            r#"
            INSERT INTO alerts (id, alert_group_id, integration_id, payload, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(group.id)
        .bind(integration_id)
        .bind(payload)
        .fetch_one(&mut **tx)
        .await?;
        Ok(alert)
    }

    async fn default_channel_filter(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        integration_id: i32,
    ) -> EngineResult<Option<i32>> {
        let row: Option<(i32,)> = sqlx::query_as(
            r#"
            SELECT id FROM channel_filters
            WHERE integration_id = $1 AND is_default
            "#,
        )
        .bind(integration_id)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    /// Snapshots the group's escalation chain (through its channel filter)
    /// and schedules step 0. Groups without a chain never escalate.
    async fn start_escalation(
        pool: &PgPool,
        resolver: &dyn OnCallResolver,
        group: &AlertGroup,
    ) -> EngineResult<()> {
        let chain_id = match group.channel_filter_id {
            Some(filter_id) => {
                sqlx::query_as::<_, ChannelFilter>("SELECT * FROM channel_filters WHERE id = $1")
                    .bind(filter_id)
                    .fetch_optional(pool)
                    .await?
                    .and_then(|f| f.escalation_chain_id)
            }
            None => None,
        };

        let chain_id = match chain_id {
            Some(id) => id,
            None => {
                debug!("Group {} has no escalation chain", group.id);
                return Ok(());
            }
        };

        let snapshot = SnapshotService::build(pool, resolver, chain_id).await?;
        let snapshot_json = serde_json::to_value(&snapshot)?;

        let mut tx = pool.begin().await?;
        sqlx::query("UPDATE alert_groups SET escalation_snapshot = $2 WHERE id = $1")
            .bind(group.id)
            .bind(&snapshot_json)
            .execute(&mut *tx)
            .await?;
        EscalationService::schedule_run(&mut tx, group.id, 0, 0, Utc::now()).await?;
        tx.commit().await?;
        Ok(())
    }
}
