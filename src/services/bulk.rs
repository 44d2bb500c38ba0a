//! Bulk actions over sets of alert groups. Per-group semantics are exactly
//! the single-group transitions; groups already in the target state are
//! skipped so re-running a bulk action is harmless.

use chrono::{DateTime, Utc};
use log::{debug, info};
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::models::AlertGroup;
use crate::services::escalation::EscalationService;
use crate::services::state_machine::AlertGroupService;

#[derive(Debug, Clone)]
pub enum BulkAction {
    /// Re-run escalation from the top; unresolves resolved groups first
    Restart,
    Acknowledge,
    Resolve,
    Silence { until: Option<DateTime<Utc>> },
}

#[derive(Debug, Default)]
pub struct BulkOutcome {
    pub applied: usize,
    pub skipped: usize,
}

pub struct BulkActionService;

impl BulkActionService {
    pub async fn apply(
        pool: &PgPool,
        config: &EngineConfig,
        bus: &EventBus,
        action: &BulkAction,
        group_ids: &[Uuid],
        by: Option<i32>,
    ) -> EngineResult<BulkOutcome> {
        let mut outcome = BulkOutcome::default();

        for group_id in group_ids {
            let result = match action {
                BulkAction::Acknowledge => {
                    AlertGroupService::acknowledge(pool, config, bus, *group_id, by)
                        .await
                        .map(|_| ())
                }
                BulkAction::Resolve => {
                    AlertGroupService::resolve(pool, config, bus, *group_id, by)
                        .await
                        .map(|_| ())
                }
                BulkAction::Silence { until } => {
                    AlertGroupService::silence(pool, config, bus, *group_id, by, *until)
                        .await
                        .map(|_| ())
                }
                BulkAction::Restart => Self::restart(pool, config, bus, *group_id, by).await,
            };

            match result {
                Ok(()) => {
                    outcome.applied += 1;
                    bus.publish(EngineEvent::GroupRefresh {
                        alert_group_id: *group_id,
                    });
                }
                // Already in the target state, or gone: skip, don't abort
                Err(EngineError::Transition(err)) => {
                    debug!("Bulk action skipped group {}: {}", group_id, err);
                    outcome.skipped += 1;
                }
                Err(EngineError::NotFound(_)) => {
                    debug!("Bulk action skipped missing group {}", group_id);
                    outcome.skipped += 1;
                }
                Err(err) => return Err(err),
            }
        }

        info!(
            "Bulk {:?}: {} applied, {} skipped of {} group(s)",
            action,
            outcome.applied,
            outcome.skipped,
            group_ids.len()
        );
        Ok(outcome)
    }

    /// Resolved groups go through unresolve (which restarts escalation);
    /// open groups get a fresh run from step 0 directly.
    async fn restart(
        pool: &PgPool,
        config: &EngineConfig,
        bus: &EventBus,
        group_id: Uuid,
        by: Option<i32>,
    ) -> EngineResult<()> {
        let group = AlertGroupService::get(pool, group_id).await?;
        if group.resolved {
            AlertGroupService::unresolve(pool, config, bus, group_id, by).await?;
            return Ok(());
        }

        if group.escalation_snapshot.is_some() {
            let mut tx = pool.begin().await?;
            EscalationService::schedule_run(&mut tx, group_id, 0, 0, Utc::now()).await?;
            tx.commit().await?;
        }
        Ok(())
    }
}
