//! Escalation scheduler: executes one snapshot step per task, then
//! re-enqueues the next one. Every task carries the run identity it was
//! scheduled under; a mismatch with the group's current identity means the
//! run was stopped or restarted since, and the task degrades to a no-op.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::models::{
    AlertGroup, DeclareIncidentPayload, EscalateStepPayload, EscalationSnapshot, LogRecordType,
    NotifyUserPayload, PolicyTier, SnapshotStep, TaskKind, TriggerWebhookPayload,
};
use crate::queue::TaskQueue;
use crate::services::log_records::LogRecordService;

// =============================================================================
// On-call resolution
// =============================================================================

/// Resolves who is on call for a schedule right now. Live resolution at
/// step-execution time, never the snapshot copy, decides who gets paged.
#[async_trait]
pub trait OnCallResolver: Send + Sync {
    async fn users_on_call(&self, schedule_id: i32) -> EngineResult<Vec<i32>>;
}

pub struct DbOnCallResolver {
    pool: PgPool,
}

impl DbOnCallResolver {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OnCallResolver for DbOnCallResolver {
    async fn users_on_call(&self, schedule_id: i32) -> EngineResult<Vec<i32>> {
        let rows: Vec<(i32,)> = sqlx::query_as(
            "SELECT user_id FROM schedule_on_call WHERE schedule_id = $1 ORDER BY user_id",
        )
        .bind(schedule_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

// =============================================================================
// Service
// =============================================================================

pub struct EscalationService;

impl EscalationService {
    /// Starts (or restarts) an escalation run: mints a fresh run identity,
    /// stamps it on the group, and enqueues the step task. Must run inside
    /// the transaction that decides the transition.
    pub async fn schedule_run(
        tx: &mut Transaction<'_, Postgres>,
        alert_group_id: Uuid,
        step_index: usize,
        loop_iteration: i32,
        eta: DateTime<Utc>,
    ) -> EngineResult<Uuid> {
        let run_id = Uuid::new_v4();
        sqlx::query(
            "UPDATE alert_groups SET active_escalation_task_id = $2, last_step_index = NULL WHERE id = $1",
        )
        .bind(alert_group_id)
        .bind(run_id)
        .execute(&mut **tx)
        .await?;

        TaskQueue::enqueue(
            &mut **tx,
            TaskKind::EscalateStep,
            &EscalateStepPayload {
                alert_group_id,
                step_index,
                run_id,
                loop_iteration,
            },
            eta,
        )
        .await?;

        Ok(run_id)
    }

    /// Executes one escalation step. Returns without side effects when the
    /// group no longer wants this run.
    pub async fn continue_escalation(
        pool: &PgPool,
        config: &EngineConfig,
        resolver: &dyn OnCallResolver,
        bus: &EventBus,
        payload: &EscalateStepPayload,
    ) -> EngineResult<()> {
        let group = match sqlx::query_as::<_, AlertGroup>(
            "SELECT * FROM alert_groups WHERE id = $1",
        )
        .bind(payload.alert_group_id)
        .fetch_optional(pool)
        .await?
        {
            Some(g) => g,
            None => {
                debug!("Escalation step for missing group {}", payload.alert_group_id);
                return Ok(());
            }
        };

        if group.archived || group.resolved || group.silenced {
            debug!(
                "Escalation step for group {} skipped (status {:?})",
                group.id,
                group.status()
            );
            return Ok(());
        }
        if group.acknowledged && config.pause_on_acknowledge {
            debug!("Escalation step for acknowledged group {} skipped", group.id);
            return Ok(());
        }
        if group.active_escalation_task_id != Some(payload.run_id) {
            debug!(
                "Stale escalation task for group {} (run {})",
                group.id, payload.run_id
            );
            return Ok(());
        }

        let snapshot: EscalationSnapshot = match &group.escalation_snapshot {
            Some(raw) => serde_json::from_value(raw.clone())?,
            None => return Ok(()),
        };

        if payload.step_index >= snapshot.len() {
            return Self::finish_run(pool, bus, &group, payload.run_id).await;
        }

        let step = match snapshot.step(payload.step_index) {
            Some(s) => s.clone(),
            None => return Self::finish_run(pool, bus, &group, payload.run_id).await,
        };

        let mut next_eta = Utc::now();

        match &step {
            SnapshotStep::Wait { delay_secs, .. } => {
                next_eta = next_eta + Duration::seconds(*delay_secs);
            }

            SnapshotStep::NotifyPersons {
                policy_id,
                user_ids,
                important,
            } => {
                Self::notify_users(pool, &group, *policy_id, user_ids, *important).await?;
            }

            SnapshotStep::NotifyOnCallFromSchedule {
                policy_id,
                schedule_id,
                important,
                ..
            } => {
                let user_ids = match schedule_id {
                    Some(sid) => resolver.users_on_call(*sid).await?,
                    None => Vec::new(),
                };
                Self::notify_users(pool, &group, *policy_id, &user_ids, *important).await?;
            }

            SnapshotStep::NotifyUserGroup {
                policy_id,
                user_group_id,
                important,
                ..
            } => {
                let user_ids = match user_group_id {
                    Some(gid) => Self::group_members(pool, *gid).await?,
                    None => Vec::new(),
                };
                Self::notify_users(pool, &group, *policy_id, &user_ids, *important).await?;
            }

            SnapshotStep::TriggerWebhook { policy_id, url } => match url {
                Some(url) => {
                    TaskQueue::enqueue(
                        pool,
                        TaskKind::TriggerWebhook,
                        &TriggerWebhookPayload {
                            alert_group_id: group.id,
                            escalation_policy_id: *policy_id,
                            url: url.clone(),
                        },
                        Utc::now(),
                    )
                    .await?;
                }
                None => {
                    LogRecordService::append(
                        pool,
                        group.id,
                        LogRecordType::EscalationFailed,
                        None,
                        Some(*policy_id),
                        serde_json::json!({ "reason": "webhook step has no url" }),
                        Some("webhook_url_missing"),
                    )
                    .await?;
                }
            },

            SnapshotStep::DeclareIncident {
                policy_id,
                severity,
            } => {
                TaskQueue::enqueue(
                    pool,
                    TaskKind::DeclareIncident,
                    &DeclareIncidentPayload {
                        alert_group_id: group.id,
                        escalation_policy_id: *policy_id,
                        severity: severity.clone(),
                    },
                    Utc::now(),
                )
                .await?;
            }

            SnapshotStep::RepeatEscalation { policy_id } => {
                // Only legal as the final step; looping mid-chain would
                // silently skip the rest of the chain
                if payload.step_index + 1 < snapshot.len() {
                    warn!(
                        "Group {} repeat step {} is not the last step, skipping it",
                        group.id, policy_id
                    );
                    LogRecordService::append(
                        pool,
                        group.id,
                        LogRecordType::EscalationFailed,
                        None,
                        Some(*policy_id),
                        serde_json::json!({ "reason": "repeat step is not the final step" }),
                        Some("repeat_not_final"),
                    )
                    .await?;
                } else if payload.loop_iteration < snapshot.repeat_limit {
                    info!(
                        "Group {} repeating escalation (iteration {})",
                        group.id,
                        payload.loop_iteration + 1
                    );
                    Self::mark_step_done(pool, &group, payload).await?;
                    Self::enqueue_step(
                        pool,
                        &group,
                        payload.run_id,
                        0,
                        payload.loop_iteration + 1,
                        Utc::now(),
                    )
                    .await?;
                    return Ok(());
                } else {
                    return Self::finish_run(pool, bus, &group, payload.run_id).await;
                }
            }
        }

        Self::mark_step_done(pool, &group, payload).await?;

        let next_index = payload.step_index + 1;
        if next_index >= snapshot.len() && !matches!(step, SnapshotStep::Wait { .. }) {
            return Self::finish_run(pool, bus, &group, payload.run_id).await;
        }
        // A trailing Wait delays the finish; the out-of-range task finishes
        // the run on arrival.
        Self::enqueue_step(
            pool,
            &group,
            payload.run_id,
            next_index,
            payload.loop_iteration,
            next_eta,
        )
        .await?;

        Ok(())
    }

    async fn notify_users(
        pool: &PgPool,
        group: &AlertGroup,
        policy_id: i32,
        user_ids: &[i32],
        important: bool,
    ) -> EngineResult<()> {
        if user_ids.is_empty() {
            warn!(
                "Group {} escalation step {} resolved to no recipients",
                group.id, policy_id
            );
            LogRecordService::append(
                pool,
                group.id,
                LogRecordType::EscalationFailed,
                None,
                Some(policy_id),
                serde_json::json!({ "reason": "no recipients" }),
                Some("no_recipients"),
            )
            .await?;
            return Ok(());
        }

        LogRecordService::append(
            pool,
            group.id,
            LogRecordType::EscalationTriggered,
            None,
            Some(policy_id),
            serde_json::json!({ "user_ids": user_ids, "important": important }),
            None,
        )
        .await?;

        let tier = PolicyTier::from_important(important);
        for user_id in user_ids {
            TaskQueue::enqueue(
                pool,
                TaskKind::NotifyUser,
                &NotifyUserPayload {
                    alert_group_id: group.id,
                    user_id: *user_id,
                    tier,
                    position: 0,
                    bypass_acknowledged: false,
                },
                Utc::now(),
            )
            .await?;
        }
        Ok(())
    }

    async fn group_members(pool: &PgPool, user_group_id: i32) -> EngineResult<Vec<i32>> {
        let rows: Vec<(i32,)> = sqlx::query_as(
            "SELECT user_id FROM user_group_members WHERE user_group_id = $1 ORDER BY user_id",
        )
        .bind(user_group_id)
        .fetch_all(pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Records progress so a later Resume picks up after this step. Guarded
    /// by run identity so a restarted run is never clobbered.
    async fn mark_step_done(
        pool: &PgPool,
        group: &AlertGroup,
        payload: &EscalateStepPayload,
    ) -> EngineResult<()> {
        sqlx::query(
            r#"
            UPDATE alert_groups SET last_step_index = $2
            WHERE id = $1 AND active_escalation_task_id = $3
            "#,
        )
        .bind(group.id)
        .bind(payload.step_index as i32)
        .bind(payload.run_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    async fn enqueue_step(
        pool: &PgPool,
        group: &AlertGroup,
        run_id: Uuid,
        step_index: usize,
        loop_iteration: i32,
        eta: DateTime<Utc>,
    ) -> EngineResult<()> {
        TaskQueue::enqueue(
            pool,
            TaskKind::EscalateStep,
            &EscalateStepPayload {
                alert_group_id: group.id,
                step_index,
                run_id,
                loop_iteration,
            },
            eta,
        )
        .await?;
        Ok(())
    }

    async fn finish_run(
        pool: &PgPool,
        bus: &EventBus,
        group: &AlertGroup,
        run_id: Uuid,
    ) -> EngineResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE alert_groups SET active_escalation_task_id = NULL
            WHERE id = $1 AND active_escalation_task_id = $2
            "#,
        )
        .bind(group.id)
        .bind(run_id)
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            info!("Group {} escalation finished", group.id);
            LogRecordService::append(
                pool,
                group.id,
                LogRecordType::EscalationFinished,
                None,
                None,
                serde_json::json!({}),
                None,
            )
            .await?;
            bus.publish(EngineEvent::LogRecordAdded {
                alert_group_id: group.id,
                record_type: LogRecordType::EscalationFinished,
            });
        }
        Ok(())
    }

    /// Webhook escalation step handler. Transient delivery failures bubble
    /// up so the queue retries; terminal ones get a failure record.
    pub async fn run_trigger_webhook(
        pool: &PgPool,
        sender: &crate::services::notification::WebhookSender,
        payload: &TriggerWebhookPayload,
    ) -> EngineResult<()> {
        let group = match sqlx::query_as::<_, AlertGroup>(
            "SELECT * FROM alert_groups WHERE id = $1",
        )
        .bind(payload.alert_group_id)
        .fetch_optional(pool)
        .await?
        {
            Some(g) if g.is_open() => g,
            _ => return Ok(()),
        };

        let body = serde_json::json!({
            "alert_group_id": group.id,
            "title": group.title,
            "status": group.status(),
            "started_at": group.started_at,
        });

        match sender.post(&payload.url, &body).await {
            Ok(()) => {
                LogRecordService::append(
                    pool,
                    group.id,
                    LogRecordType::WebhookTriggered,
                    None,
                    Some(payload.escalation_policy_id),
                    serde_json::json!({ "url": payload.url }),
                    None,
                )
                .await?;
                Ok(())
            }
            Err(err) if err.is_transient() => Err(EngineError::Delivery(err)),
            Err(err) => {
                LogRecordService::append(
                    pool,
                    group.id,
                    LogRecordType::WebhookFailed,
                    None,
                    Some(payload.escalation_policy_id),
                    serde_json::json!({ "url": payload.url }),
                    Some(err.code()),
                )
                .await?;
                Ok(())
            }
        }
    }
}
