//! Alert-group state machine.
//!
//! The pure planner (`plan`) turns (current flags, action) into an ordered
//! list of log records, the resulting flags, and timer operations. The
//! service applies a plan inside a transaction under a row lock and is the
//! sole writer of group state fields.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::models::{AlertGroup, LogRecordType, TaskKind, UnsilencePayload};
use crate::queue::TaskQueue;
use crate::services::escalation::EscalationService;
use crate::services::log_records::LogRecordService;

// =============================================================================
// Actions and planning
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum GroupAction {
    Acknowledge {
        by: Option<i32>,
    },
    Unacknowledge {
        by: Option<i32>,
    },
    Resolve {
        by: Option<i32>,
    },
    Unresolve {
        by: Option<i32>,
    },
    /// `until: None` silences forever
    Silence {
        by: Option<i32>,
        until: Option<DateTime<Utc>>,
    },
    Unsilence {
        by: Option<i32>,
        source: UnsilenceSource,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsilenceSource {
    Manual,
    Timer,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("alert group is already resolved")]
    AlreadyResolved,

    #[error("alert group is already acknowledged")]
    AlreadyAcknowledged,

    #[error("alert group is not acknowledged")]
    NotAcknowledged,

    #[error("alert group is not resolved")]
    NotResolved,

    #[error("alert group is not silenced")]
    NotSilenced,
}

/// The orthogonal state flags the planner reasons about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupFlags {
    pub acknowledged: bool,
    pub resolved: bool,
    pub silenced: bool,
}

impl From<&AlertGroup> for GroupFlags {
    fn from(group: &AlertGroup) -> Self {
        Self {
            acknowledged: group.acknowledged,
            resolved: group.resolved,
            silenced: group.silenced,
        }
    }
}

/// What the escalation run should do after the transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationDirective {
    /// Leave the current run (and its pending timer) alone
    Keep,
    /// Invalidate the current run identity; pending timers die on arrival
    Stop,
    /// New run from step 0 (used by unresolve)
    RestartFromZero,
    /// New run from the step after the last executed one
    Resume,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimerOps {
    /// Clear the pending unsilence timer identity
    pub cancel_unsilence: bool,
    /// Schedule a new unsilence timer; inner `None` means silenced forever
    /// (no timer)
    pub schedule_unsilence: Option<Option<DateTime<Utc>>>,
    pub escalation: EscalationDirective,
}

/// Ordered log records (primary last), resulting flags, timer operations
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionPlan {
    pub records: Vec<LogRecordType>,
    pub flags: GroupFlags,
    pub timers: TimerOps,
}

/// Plans a transition. Implicit transitions (un-silence before ack,
/// un-ack before resolve) get their own records so history stays
/// reconstructable.
pub fn plan(
    flags: GroupFlags,
    action: &GroupAction,
    pause_on_acknowledge: bool,
) -> Result<TransitionPlan, TransitionError> {
    match action {
        GroupAction::Acknowledge { .. } => {
            if flags.resolved {
                return Err(TransitionError::AlreadyResolved);
            }
            if flags.acknowledged {
                return Err(TransitionError::AlreadyAcknowledged);
            }
            let mut records = Vec::new();
            if flags.silenced {
                records.push(LogRecordType::UnSilence);
            }
            records.push(LogRecordType::Ack);
            Ok(TransitionPlan {
                records,
                flags: GroupFlags {
                    acknowledged: true,
                    resolved: false,
                    silenced: false,
                },
                timers: TimerOps {
                    cancel_unsilence: flags.silenced,
                    schedule_unsilence: None,
                    escalation: if pause_on_acknowledge {
                        EscalationDirective::Stop
                    } else {
                        EscalationDirective::Keep
                    },
                },
            })
        }

        GroupAction::Unacknowledge { .. } => {
            if flags.resolved {
                return Err(TransitionError::AlreadyResolved);
            }
            if !flags.acknowledged {
                return Err(TransitionError::NotAcknowledged);
            }
            Ok(TransitionPlan {
                records: vec![LogRecordType::UnAck],
                flags: GroupFlags {
                    acknowledged: false,
                    ..flags
                },
                timers: TimerOps {
                    cancel_unsilence: false,
                    schedule_unsilence: None,
                    escalation: if pause_on_acknowledge {
                        EscalationDirective::Resume
                    } else {
                        EscalationDirective::Keep
                    },
                },
            })
        }

        GroupAction::Resolve { .. } => {
            if flags.resolved {
                return Err(TransitionError::AlreadyResolved);
            }
            let mut records = Vec::new();
            if flags.silenced {
                records.push(LogRecordType::UnSilence);
            }
            if flags.acknowledged {
                records.push(LogRecordType::UnAck);
            }
            records.push(LogRecordType::Resolved);
            Ok(TransitionPlan {
                records,
                flags: GroupFlags {
                    acknowledged: false,
                    resolved: true,
                    silenced: false,
                },
                timers: TimerOps {
                    cancel_unsilence: flags.silenced,
                    schedule_unsilence: None,
                    escalation: EscalationDirective::Stop,
                },
            })
        }

        GroupAction::Unresolve { .. } => {
            if !flags.resolved {
                return Err(TransitionError::NotResolved);
            }
            Ok(TransitionPlan {
                records: vec![LogRecordType::UnResolved],
                flags: GroupFlags::default(),
                timers: TimerOps {
                    cancel_unsilence: false,
                    schedule_unsilence: None,
                    escalation: EscalationDirective::RestartFromZero,
                },
            })
        }

        GroupAction::Silence { until, .. } => {
            if flags.resolved {
                return Err(TransitionError::AlreadyResolved);
            }
            let mut records = Vec::new();
            if flags.acknowledged {
                records.push(LogRecordType::UnAck);
            }
            if flags.silenced {
                // Re-silence replaces the pending unsilence timer
                records.push(LogRecordType::UnSilence);
            }
            records.push(LogRecordType::Silence);
            Ok(TransitionPlan {
                records,
                flags: GroupFlags {
                    acknowledged: false,
                    resolved: false,
                    silenced: true,
                },
                timers: TimerOps {
                    cancel_unsilence: flags.silenced,
                    schedule_unsilence: Some(*until),
                    escalation: EscalationDirective::Stop,
                },
            })
        }

        GroupAction::Unsilence { .. } => {
            if flags.resolved {
                return Err(TransitionError::AlreadyResolved);
            }
            if !flags.silenced {
                return Err(TransitionError::NotSilenced);
            }
            Ok(TransitionPlan {
                records: vec![LogRecordType::UnSilence],
                flags: GroupFlags {
                    silenced: false,
                    ..flags
                },
                timers: TimerOps {
                    cancel_unsilence: true,
                    schedule_unsilence: None,
                    escalation: EscalationDirective::Resume,
                },
            })
        }
    }
}

// =============================================================================
// Service
// =============================================================================

pub struct AlertGroupService;

impl AlertGroupService {
    pub async fn get(pool: &PgPool, id: Uuid) -> EngineResult<AlertGroup> {
        sqlx::query_as::<_, AlertGroup>("SELECT * FROM alert_groups WHERE id = $1 AND NOT archived")
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Alert group {} not found", id)))
    }

    pub async fn acknowledge(
        pool: &PgPool,
        config: &EngineConfig,
        bus: &EventBus,
        id: Uuid,
        by: Option<i32>,
    ) -> EngineResult<AlertGroup> {
        Self::apply(pool, config, bus, id, GroupAction::Acknowledge { by }).await
    }

    pub async fn unacknowledge(
        pool: &PgPool,
        config: &EngineConfig,
        bus: &EventBus,
        id: Uuid,
        by: Option<i32>,
    ) -> EngineResult<AlertGroup> {
        Self::apply(pool, config, bus, id, GroupAction::Unacknowledge { by }).await
    }

    pub async fn resolve(
        pool: &PgPool,
        config: &EngineConfig,
        bus: &EventBus,
        id: Uuid,
        by: Option<i32>,
    ) -> EngineResult<AlertGroup> {
        Self::apply(pool, config, bus, id, GroupAction::Resolve { by }).await
    }

    pub async fn unresolve(
        pool: &PgPool,
        config: &EngineConfig,
        bus: &EventBus,
        id: Uuid,
        by: Option<i32>,
    ) -> EngineResult<AlertGroup> {
        Self::apply(pool, config, bus, id, GroupAction::Unresolve { by }).await
    }

    pub async fn silence(
        pool: &PgPool,
        config: &EngineConfig,
        bus: &EventBus,
        id: Uuid,
        by: Option<i32>,
        until: Option<DateTime<Utc>>,
    ) -> EngineResult<AlertGroup> {
        Self::apply(pool, config, bus, id, GroupAction::Silence { by, until }).await
    }

    pub async fn unsilence(
        pool: &PgPool,
        config: &EngineConfig,
        bus: &EventBus,
        id: Uuid,
        by: Option<i32>,
        source: UnsilenceSource,
    ) -> EngineResult<AlertGroup> {
        Self::apply(pool, config, bus, id, GroupAction::Unsilence { by, source }).await
    }

    /// Applies a transition under a row lock. Every transition bumps or
    /// clears the escalation run identity as planned, so late timers from
    /// before the transition degrade to no-ops.
    pub async fn apply(
        pool: &PgPool,
        config: &EngineConfig,
        bus: &EventBus,
        id: Uuid,
        action: GroupAction,
    ) -> EngineResult<AlertGroup> {
        let mut tx = pool.begin().await?;

        let group = sqlx::query_as::<_, AlertGroup>(
            "SELECT * FROM alert_groups WHERE id = $1 AND NOT archived FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("Alert group {} not found", id)))?;

        let plan = plan(GroupFlags::from(&group), &action, config.pause_on_acknowledge)?;

        let author = Self::author_of(&action);
        let now = Utc::now();

        Self::write_flags(&mut tx, &group, &plan, &action, author, now).await?;
        let unsilence_info = Self::apply_timers(&mut tx, &group, &plan, now).await?;

        for record_type in &plan.records {
            let step_info = Self::step_info(*record_type, &action, &unsilence_info);
            LogRecordService::append(
                &mut *tx,
                group.id,
                *record_type,
                author,
                None,
                step_info,
                None,
            )
            .await?;
        }

        let updated = sqlx::query_as::<_, AlertGroup>("SELECT * FROM alert_groups WHERE id = $1")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        for record_type in &plan.records {
            bus.publish(EngineEvent::LogRecordAdded {
                alert_group_id: id,
                record_type: *record_type,
            });
        }
        if let Some(primary) = plan.records.last() {
            bus.publish(EngineEvent::GroupStateChanged {
                alert_group_id: id,
                record_type: *primary,
            });
        }

        Ok(updated)
    }

    fn author_of(action: &GroupAction) -> Option<i32> {
        match action {
            GroupAction::Acknowledge { by }
            | GroupAction::Unacknowledge { by }
            | GroupAction::Resolve { by }
            | GroupAction::Unresolve { by }
            | GroupAction::Silence { by, .. }
            | GroupAction::Unsilence { by, .. } => *by,
        }
    }

    fn step_info(
        record_type: LogRecordType,
        action: &GroupAction,
        unsilence_info: &Option<Uuid>,
    ) -> serde_json::Value {
        match (record_type, action) {
            (LogRecordType::Silence, GroupAction::Silence { until, .. }) => serde_json::json!({
                "silenced_until": until,
                "unsilence_task_id": unsilence_info,
            }),
            (LogRecordType::UnSilence, GroupAction::Unsilence { source, .. }) => {
                serde_json::json!({
                    "source": match source {
                        UnsilenceSource::Manual => "manual",
                        UnsilenceSource::Timer => "timer",
                    }
                })
            }
            _ => serde_json::json!({}),
        }
    }

    async fn write_flags(
        tx: &mut Transaction<'_, Postgres>,
        group: &AlertGroup,
        plan: &TransitionPlan,
        action: &GroupAction,
        author: Option<i32>,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        // Actor/timestamp columns follow the primary action; flags cleared by
        // implicit transitions keep their historical actor columns.
        let (ack_at, ack_by) = match action {
            GroupAction::Acknowledge { .. } => (Some(now), author),
            _ => (group.acknowledged_at, group.acknowledged_by),
        };
        let (res_at, res_by) = match action {
            GroupAction::Resolve { .. } => (Some(now), author),
            _ => (group.resolved_at, group.resolved_by),
        };
        let (sil_at, sil_by, sil_until) = match action {
            GroupAction::Silence { until, .. } => (Some(now), author, *until),
            _ if plan.flags.silenced => (group.silenced_at, group.silenced_by, group.silenced_until),
            _ => (None, None, None),
        };

        sqlx::query(
            r#"
            UPDATE alert_groups
            SET acknowledged = $2, acknowledged_at = $3, acknowledged_by = $4,
                resolved = $5, resolved_at = $6, resolved_by = $7,
                silenced = $8, silenced_at = $9, silenced_by = $10, silenced_until = $11
            WHERE id = $1
            "#,
        )
        .bind(group.id)
        .bind(plan.flags.acknowledged)
        .bind(ack_at)
        .bind(ack_by)
        .bind(plan.flags.resolved)
        .bind(res_at)
        .bind(res_by)
        .bind(plan.flags.silenced)
        .bind(sil_at)
        .bind(sil_by)
        .bind(sil_until)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Applies timer operations; returns the new unsilence timer id, if one
    /// was scheduled.
    async fn apply_timers(
        tx: &mut Transaction<'_, Postgres>,
        group: &AlertGroup,
        plan: &TransitionPlan,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<Uuid>> {
        if plan.timers.cancel_unsilence {
            sqlx::query("UPDATE alert_groups SET unsilence_task_id = NULL WHERE id = $1")
                .bind(group.id)
                .execute(&mut **tx)
                .await?;
        }

        let mut scheduled = None;
        if let Some(until) = &plan.timers.schedule_unsilence {
            match until {
                Some(until_ts) => {
                    let timer_id = Uuid::new_v4();
                    TaskQueue::enqueue(
                        &mut **tx,
                        TaskKind::Unsilence,
                        &UnsilencePayload {
                            alert_group_id: group.id,
                            timer_id,
                        },
                        *until_ts,
                    )
                    .await?;
                    sqlx::query("UPDATE alert_groups SET unsilence_task_id = $2 WHERE id = $1")
                        .bind(group.id)
                        .bind(timer_id)
                        .execute(&mut **tx)
                        .await?;
                    scheduled = Some(timer_id);
                }
                // Silenced forever: no timer
                None => {
                    sqlx::query("UPDATE alert_groups SET unsilence_task_id = NULL WHERE id = $1")
                        .bind(group.id)
                        .execute(&mut **tx)
                        .await?;
                }
            }
        }

        match plan.timers.escalation {
            EscalationDirective::Keep => {}
            EscalationDirective::Stop => {
                sqlx::query(
                    "UPDATE alert_groups SET active_escalation_task_id = NULL WHERE id = $1",
                )
                .bind(group.id)
                .execute(&mut **tx)
                .await?;
            }
            EscalationDirective::RestartFromZero => {
                if group.escalation_snapshot.is_some() {
                    EscalationService::schedule_run(tx, group.id, 0, 0, now).await?;
                }
            }
            EscalationDirective::Resume => {
                if group.escalation_snapshot.is_some() {
                    let next = group.last_step_index.map(|i| i + 1).unwrap_or(0) as usize;
                    EscalationService::schedule_run(tx, group.id, next, 0, now).await?;
                }
            }
        }

        Ok(scheduled)
    }
}
