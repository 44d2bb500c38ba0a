//! Per-user notification stepper.
//!
//! Each user escalated to walks their personal policy one step per task.
//! Idempotency comes from the log: a notify step that already has a
//! triggered record for (group, user, policy step) is skipped, so redelivered
//! tasks never double-page. Low-priority sends go through short-lived
//! bundles that merge bursts into one delivery per user and channel.

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    AlertGroup, ChannelKind, FlushBundlePayload, LogRecordType, NotificationPolicyStep,
    NotifyUserPayload, PolicyStepKind, PolicyTier, TaskKind, User,
};
use crate::queue::TaskQueue;
use crate::services::log_records::LogRecordService;
use crate::services::notification::{NotificationMessage, NotifierRegistry};

pub struct NotificationStepperService;

impl NotificationStepperService {
    /// Executes one step of a user's personal notification policy for one
    /// group, then schedules the next.
    pub async fn run(
        pool: &PgPool,
        config: &EngineConfig,
        notifiers: &NotifierRegistry,
        payload: &NotifyUserPayload,
    ) -> EngineResult<()> {
        let group = match sqlx::query_as::<_, AlertGroup>(
            "SELECT * FROM alert_groups WHERE id = $1",
        )
        .bind(payload.alert_group_id)
        .fetch_optional(pool)
        .await?
        {
            Some(g) => g,
            None => return Ok(()),
        };

        if group.resolved || group.archived || group.silenced {
            debug!(
                "Notification step for group {} skipped (status {:?})",
                group.id,
                group.status()
            );
            Self::clear_pointer(pool, payload).await?;
            return Ok(());
        }
        if group.acknowledged && !payload.bypass_acknowledged {
            debug!(
                "Notification step for acknowledged group {} skipped",
                group.id
            );
            Self::clear_pointer(pool, payload).await?;
            return Ok(());
        }

        // Past the first step the pointer is authoritative: unpage deletes
        // it, which must also kill tasks already sitting in the queue.
        if payload.position > 0 {
            let pointer: Option<(i32,)> = sqlx::query_as(
                r#"
                SELECT next_position FROM active_notification_pointers
                WHERE user_id = $1 AND alert_group_id = $2 AND tier = $3::text::varchar
                "#,
            )
            .bind(payload.user_id)
            .bind(payload.alert_group_id)
            .bind(payload.tier.to_string())
            .fetch_optional(pool)
            .await?;

            match pointer {
                None => {
                    debug!(
                        "Notification step for user {} group {} dropped (no active plan)",
                        payload.user_id, payload.alert_group_id
                    );
                    return Ok(());
                }
                Some((next,)) if next != payload.position => {
                    debug!(
                        "Stale notification task for user {} group {} (position {}, pointer at {})",
                        payload.user_id, payload.alert_group_id, payload.position, next
                    );
                    return Ok(());
                }
                Some(_) => {}
            }
        }

        let user = match sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(payload.user_id)
            .fetch_optional(pool)
            .await?
        {
            Some(u) => u,
            None => {
                warn!("Notification step for missing user {}", payload.user_id);
                return Ok(());
            }
        };

        let steps = Self::policy_steps(pool, payload.user_id, payload.tier).await?;
        if steps.is_empty() {
            warn!(
                "User {} has no {} notification policy",
                payload.user_id, payload.tier
            );
            return Ok(());
        }

        let position = payload.position as usize;
        if position >= steps.len() {
            Self::clear_pointer(pool, payload).await?;
            return Ok(());
        }
        let step = &steps[position];

        match step.step {
            PolicyStepKind::Wait => {
                let delay = step.wait_delay_secs.unwrap_or(0);
                Self::advance(pool, payload, payload.position + 1, delay).await?;
            }
            PolicyStepKind::Notify => {
                Self::run_notify_step(pool, config, notifiers, payload, &group, &user, step)
                    .await?;
            }
        }

        Ok(())
    }

    async fn run_notify_step(
        pool: &PgPool,
        config: &EngineConfig,
        notifiers: &NotifierRegistry,
        payload: &NotifyUserPayload,
        group: &AlertGroup,
        user: &User,
        step: &NotificationPolicyStep,
    ) -> EngineResult<()> {
        // Redelivered task or re-entered step: already notified, move on
        if LogRecordService::personal_notification_exists(pool, group.id, user.id, step.id).await? {
            debug!(
                "User {} already notified for group {} step {}, skipping",
                user.id, group.id, step.id
            );
            return Self::advance(pool, payload, payload.position + 1, 0).await;
        }

        let channel = match step.channel {
            Some(c) => c,
            None => {
                Self::record_failure(pool, group, user, step, "channel_missing").await?;
                return Self::advance(pool, payload, payload.position + 1, 0).await;
            }
        };

        let bundle_window = Duration::from_std(config.bundle_window)
            .unwrap_or_else(|_| Duration::seconds(0));
        let bundlable = payload.tier == PolicyTier::Default
            && !payload.bypass_acknowledged
            && bundle_window > Duration::zero();

        if bundlable {
            Self::bundle_notification(pool, bundle_window, payload, group, user, step, channel)
                .await?;
            return Self::advance(pool, payload, payload.position + 1, 0).await;
        }

        let message = NotificationMessage::for_group(
            group.id,
            group.title.clone(),
            format!("Alert group \"{}\" needs attention", group.title),
            payload.tier == PolicyTier::Important,
        );

        match notifiers.send(channel, user, &message).await {
            Ok(()) => {
                info!(
                    "Notified user {} for group {} via {}",
                    user.id, group.id, channel
                );
                Self::record_triggered(pool, group, user, step, None).await?;
                Self::advance(pool, payload, payload.position + 1, 0).await
            }
            Err(err) if err.is_transient() => {
                warn!(
                    "Transient delivery failure for user {} group {} via {}: {}",
                    user.id, group.id, channel, err
                );
                Self::record_failure(pool, group, user, step, err.code()).await?;
                Err(EngineError::Delivery(err))
            }
            Err(err) => {
                warn!(
                    "Delivery failed for user {} group {} via {}: {}",
                    user.id, group.id, channel, err
                );
                Self::record_failure(pool, group, user, step, err.code()).await?;
                Self::advance(pool, payload, payload.position + 1, 0).await
            }
        }
    }

    /// Joins an open bundle for (user, channel) or opens a new one with its
    /// flush task. The triggered record is written at bundling time: the
    /// notification is committed to happen, the flush just performs it.
    async fn bundle_notification(
        pool: &PgPool,
        window: Duration,
        payload: &NotifyUserPayload,
        group: &AlertGroup,
        user: &User,
        step: &NotificationPolicyStep,
        channel: ChannelKind,
    ) -> EngineResult<()> {
        let mut tx = pool.begin().await?;

        let open: Option<(Uuid, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT id, fire_at FROM notification_bundles
            WHERE user_id = $1 AND channel = $2::text::varchar AND NOT fired AND fire_at > NOW()
            ORDER BY fire_at
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(user.id)
        .bind(channel.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        let (bundle_id, fire_at) = match open {
            Some(found) => found,
            None => {
                let fire_at = Utc::now() + window;
                let (id,): (Uuid,) = sqlx::query_as(
                    r#"
                    INSERT INTO notification_bundles (user_id, channel, fire_at)
                    VALUES ($1, $2::text::varchar, $3)
                    RETURNING id
                    "#,
                )
                .bind(user.id)
                .bind(channel.to_string())
                .bind(fire_at)
                .fetch_one(&mut *tx)
                .await?;
                TaskQueue::enqueue(
                    &mut *tx,
                    TaskKind::FlushBundle,
                    &FlushBundlePayload { bundle_id: id },
                    fire_at,
                )
                .await?;
                (id, fire_at)
            }
        };

        sqlx::query(
            r#"
            INSERT INTO notification_bundle_items (bundle_id, alert_group_id, notification_policy_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (bundle_id, alert_group_id) DO NOTHING
            "#,
        )
        .bind(bundle_id)
        .bind(group.id)
        .bind(step.id)
        .execute(&mut *tx)
        .await?;

        LogRecordService::append(
            &mut *tx,
            group.id,
            LogRecordType::PersonalNotificationTriggered,
            Some(user.id),
            None,
            serde_json::json!({
                "policy_step_id": step.id,
                "channel": channel,
                "bundled": true,
                "bundle_id": bundle_id,
                "fire_at": fire_at,
            }),
            None,
        )
        .await?;

        tx.commit().await?;
        debug!(
            "Bundled notification for user {} group {} into {}",
            user.id, group.id, bundle_id
        );
        Ok(())
    }

    /// Delivers a due bundle as one merged message. `fired` flips before the
    /// send and never back, so a crash between send and `delivered` can at
    /// most redeliver, never re-open the bundle for new items.
    pub async fn flush_bundle(
        pool: &PgPool,
        notifiers: &NotifierRegistry,
        payload: &FlushBundlePayload,
    ) -> EngineResult<()> {
        let mut tx = pool.begin().await?;

        let bundle: Option<(i32, String, bool, bool)> = sqlx::query_as(
            r#"
            SELECT user_id, channel, fired, delivered FROM notification_bundles
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(payload.bundle_id)
        .fetch_optional(&mut *tx)
        .await?;

        let (user_id, channel_raw, _fired, delivered) = match bundle {
            Some(b) => b,
            None => return Ok(()),
        };
        if delivered {
            return Ok(());
        }

        let items: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT alert_group_id FROM notification_bundle_items WHERE bundle_id = $1",
        )
        .bind(payload.bundle_id)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query("UPDATE notification_bundles SET fired = TRUE WHERE id = $1")
            .bind(payload.bundle_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        // Only still-open groups make it into the delivery
        let mut titles = Vec::new();
        let mut group_ids = Vec::new();
        for (group_id,) in &items {
            if let Some(g) = sqlx::query_as::<_, AlertGroup>(
                "SELECT * FROM alert_groups WHERE id = $1",
            )
            .bind(group_id)
            .fetch_optional(pool)
            .await?
            {
                if g.is_open() && !g.acknowledged && !g.silenced {
                    titles.push(g.title);
                    group_ids.push(g.id);
                }
            }
        }

        if group_ids.is_empty() {
            sqlx::query("UPDATE notification_bundles SET delivered = TRUE WHERE id = $1")
                .bind(payload.bundle_id)
                .execute(pool)
                .await?;
            return Ok(());
        }

        let user = match sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(pool)
            .await?
        {
            Some(u) => u,
            None => return Ok(()),
        };

        let channel: ChannelKind = serde_json::from_value(serde_json::Value::String(channel_raw))?;
        let message = NotificationMessage {
            alert_group_ids: group_ids.clone(),
            title: format!("{} alert groups need attention", group_ids.len()),
            body: titles.join("\n"),
            important: false,
        };

        match notifiers.send(channel, &user, &message).await {
            Ok(()) => {
                sqlx::query("UPDATE notification_bundles SET delivered = TRUE WHERE id = $1")
                    .bind(payload.bundle_id)
                    .execute(pool)
                    .await?;
                info!(
                    "Delivered bundle {} ({} groups) to user {}",
                    payload.bundle_id,
                    group_ids.len(),
                    user.id
                );
                Ok(())
            }
            Err(err) if err.is_transient() => Err(EngineError::Delivery(err)),
            Err(err) => {
                warn!("Bundle {} delivery failed: {}", payload.bundle_id, err);
                sqlx::query("UPDATE notification_bundles SET delivered = TRUE WHERE id = $1")
                    .bind(payload.bundle_id)
                    .execute(pool)
                    .await?;
                Ok(())
            }
        }
    }

    /// The remaining plan for (user, group, tier), for introspection
    pub async fn pending_plan(
        pool: &PgPool,
        user_id: i32,
        alert_group_id: Uuid,
        tier: PolicyTier,
    ) -> EngineResult<Vec<NotificationPolicyStep>> {
        let pointer: Option<(i32,)> = sqlx::query_as(
            r#"
            SELECT next_position FROM active_notification_pointers
            WHERE user_id = $1 AND alert_group_id = $2 AND tier = $3::text::varchar
            "#,
        )
        .bind(user_id)
        .bind(alert_group_id)
        .bind(tier.to_string())
        .fetch_optional(pool)
        .await?;

        let next = pointer.map(|(p,)| p).unwrap_or(0);
        let steps = Self::policy_steps(pool, user_id, tier).await?;
        Ok(steps
            .into_iter()
            .filter(|s| s.position >= next)
            .collect())
    }

    async fn policy_steps(
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

    /// Records progress and enqueues the next step after `delay_secs`
    async fn advance(
        pool: &PgPool,
        payload: &NotifyUserPayload,
        next_position: i32,
        delay_secs: i64,
    ) -> EngineResult<()> {
        let mut tx = pool.begin().await?;
        Self::upsert_pointer(&mut tx, payload, next_position).await?;
        TaskQueue::enqueue(
            &mut *tx,
            TaskKind::NotifyUser,
            &NotifyUserPayload {
                position: next_position,
                ..payload.clone()
            },
            Utc::now() + Duration::seconds(delay_secs),
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_pointer(
        tx: &mut Transaction<'_, Postgres>,
        payload: &NotifyUserPayload,
        next_position: i32,
    ) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO active_notification_pointers (user_id, alert_group_id, tier, next_position)
            VALUES ($1, $2, $3::text::varchar, $4)
            ON CONFLICT (user_id, alert_group_id, tier) DO UPDATE
            SET next_position = EXCLUDED.next_position, updated_at = NOW()
            "#,
        )
        .bind(payload.user_id)
        .bind(payload.alert_group_id)
        .bind(payload.tier.to_string())
        .bind(next_position)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn clear_pointer(pool: &PgPool, payload: &NotifyUserPayload) -> EngineResult<()> {
        sqlx::query(
            r#"
            DELETE FROM active_notification_pointers
            WHERE user_id = $1 AND alert_group_id = $2 AND tier = $3::text::varchar
            "#,
        )
        .bind(payload.user_id)
        .bind(payload.alert_group_id)
        .bind(payload.tier.to_string())
        .execute(pool)
        .await?;
        Ok(())
    }

    async fn record_triggered(
        pool: &PgPool,
        group: &AlertGroup,
        user: &User,
        step: &NotificationPolicyStep,
        bundle_id: Option<Uuid>,
    ) -> EngineResult<()> {
        LogRecordService::append(
            pool,
            group.id,
            LogRecordType::PersonalNotificationTriggered,
            Some(user.id),
            None,
            serde_json::json!({
                "policy_step_id": step.id,
                "channel": step.channel,
                "bundled": bundle_id.is_some(),
                "bundle_id": bundle_id,
            }),
            None,
        )
        .await?;
        Ok(())
    }

    async fn record_failure(
        pool: &PgPool,
        group: &AlertGroup,
        user: &User,
        step: &NotificationPolicyStep,
        code: &str,
    ) -> EngineResult<()> {
        LogRecordService::append(
            pool,
            group.id,
            LogRecordType::PersonalNotificationFailed,
            Some(user.id),
            None,
            serde_json::json!({
                "policy_step_id": step.id,
                "channel": step.channel,
            }),
            Some(code),
        )
        .await?;
        Ok(())
    }
}
