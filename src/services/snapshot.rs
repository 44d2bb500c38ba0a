//! Builds the immutable escalation snapshot stored on a group at creation.
//! Member lists recorded for schedule/user-group steps are an audit trail;
//! execution resolves membership live.

use chrono::Utc;
use log::warn;
use sqlx::PgPool;

use crate::error::{EngineError, EngineResult};
use crate::models::{
    EscalationChain, EscalationPolicy, EscalationSnapshot, EscalationStepKind, SnapshotStep,
};
use crate::services::escalation::OnCallResolver;
use crate::services::notification::WebhookSender;

pub struct SnapshotService;

impl SnapshotService {
    pub async fn build(
        pool: &PgPool,
        resolver: &dyn OnCallResolver,
        chain_id: i32,
    ) -> EngineResult<EscalationSnapshot> {
        let chain = sqlx::query_as::<_, EscalationChain>(
            "SELECT * FROM escalation_chains WHERE id = $1",
        )
        .bind(chain_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("Escalation chain {} not found", chain_id)))?;

        let policies = sqlx::query_as::<_, EscalationPolicy>(
            "SELECT * FROM escalation_policies WHERE escalation_chain_id = $1 ORDER BY position",
        )
        .bind(chain_id)
        .fetch_all(pool)
        .await?;

        let mut steps = Vec::with_capacity(policies.len());
        for policy in &policies {
            steps.push(Self::snapshot_step(pool, resolver, policy).await?);
        }

        Ok(EscalationSnapshot {
            chain_id: chain.id,
            chain_name: chain.name,
            repeat_limit: chain.repeat_limit,
            taken_at: Utc::now(),
            steps,
        })
    }

    async fn snapshot_step(
        pool: &PgPool,
        resolver: &dyn OnCallResolver,
        policy: &EscalationPolicy,
    ) -> EngineResult<SnapshotStep> {
        let step = match policy.step {
            EscalationStepKind::Wait => SnapshotStep::Wait {
                policy_id: policy.id,
                delay_secs: policy.wait_delay_secs.unwrap_or(0),
            },
            EscalationStepKind::NotifyPersons => SnapshotStep::NotifyPersons {
                policy_id: policy.id,
                user_ids: Self::policy_users(pool, policy.id).await?,
                important: policy.important,
            },
            EscalationStepKind::NotifyOnCallFromSchedule => {
                let snapshot_user_ids = match policy.schedule_id {
                    Some(sid) => resolver.users_on_call(sid).await?,
                    None => Vec::new(),
                };
                SnapshotStep::NotifyOnCallFromSchedule {
                    policy_id: policy.id,
                    schedule_id: policy.schedule_id,
                    snapshot_user_ids,
                    important: policy.important,
                }
            }
            EscalationStepKind::NotifyUserGroup => {
                let snapshot_user_ids = match policy.user_group_id {
                    Some(gid) => {
                        let rows: Vec<(i32,)> = sqlx::query_as(
                            "SELECT user_id FROM user_group_members WHERE user_group_id = $1 ORDER BY user_id",
                        )
                        .bind(gid)
                        .fetch_all(pool)
                        .await?;
                        rows.into_iter().map(|(id,)| id).collect()
                    }
                    None => Vec::new(),
                };
                SnapshotStep::NotifyUserGroup {
                    policy_id: policy.id,
                    user_group_id: policy.user_group_id,
                    snapshot_user_ids,
                    important: policy.important,
                }
            }
            EscalationStepKind::TriggerWebhook => {
                // Unparseable URLs snapshot as absent; the run records the
                // failure instead of posting to garbage
                let url = policy.webhook_url.clone().filter(|u| {
                    if let Err(err) = WebhookSender::validate_url(u) {
                        warn!("Dropping webhook URL on policy {}: {}", policy.id, err);
                        return false;
                    }
                    true
                });
                SnapshotStep::TriggerWebhook {
                    policy_id: policy.id,
                    url,
                }
            }
            EscalationStepKind::DeclareIncident => SnapshotStep::DeclareIncident {
                policy_id: policy.id,
                severity: policy.severity.clone(),
            },
            EscalationStepKind::RepeatEscalation => SnapshotStep::RepeatEscalation {
                policy_id: policy.id,
            },
        };
        Ok(step)
    }

    async fn policy_users(pool: &PgPool, policy_id: i32) -> EngineResult<Vec<i32>> {
        let rows: Vec<(i32,)> = sqlx::query_as(
            "SELECT user_id FROM escalation_policy_users WHERE escalation_policy_id = $1 ORDER BY user_id",
        )
        .bind(policy_id)
        .fetch_all(pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
