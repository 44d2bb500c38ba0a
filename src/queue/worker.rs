//! Task worker: claims due tasks, dispatches to the right handler, and
//! applies the retry policy. Handlers are responsible for their own
//! idempotency; the worker only decides retry vs. terminal failure.

use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use sqlx::PgPool;
use tokio::sync::watch;

use crate::config::{EngineConfig, IncidentConfig};
use crate::error::{EngineError, EngineResult};
use crate::events::EventBus;
use crate::models::{
    AlertGroup, DeclareIncidentPayload, EscalateStepPayload, FlushBundlePayload, LogRecordType,
    NotifyUserPayload, ScheduledTask, TaskKind, TriggerWebhookPayload, UnsilencePayload,
};
use crate::queue::TaskQueue;
use crate::services::escalation::{EscalationService, OnCallResolver};
use crate::services::incident::{IncidentApi, IncidentConnectorService};
use crate::services::log_records::LogRecordService;
use crate::services::notification::{NotifierRegistry, WebhookSender};
use crate::services::state_machine::{AlertGroupService, UnsilenceSource};
use crate::services::stepper::NotificationStepperService;

const CLAIM_BATCH: i64 = 32;

pub struct Worker {
    pool: PgPool,
    config: EngineConfig,
    incident_config: IncidentConfig,
    notifiers: Arc<NotifierRegistry>,
    incident_api: Arc<dyn IncidentApi>,
    resolver: Arc<dyn OnCallResolver>,
    webhook_sender: WebhookSender,
    bus: EventBus,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        config: EngineConfig,
        incident_config: IncidentConfig,
        notifiers: Arc<NotifierRegistry>,
        incident_api: Arc<dyn IncidentApi>,
        resolver: Arc<dyn OnCallResolver>,
        webhook_sender: WebhookSender,
        bus: EventBus,
    ) -> Self {
        Self {
            pool,
            config,
            incident_config,
            notifiers,
            incident_api,
            resolver,
            webhook_sender,
            bus,
        }
    }

    /// Poll loop; exits when the shutdown signal flips
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Task worker started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Task worker shutting down");
                        return;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    match self.run_once().await {
                        Ok(0) => {}
                        Ok(n) => debug!("Processed {} task(s)", n),
                        Err(e) => error!("Worker pass failed: {}", e),
                    }
                }
            }
        }
    }

    /// Claims and processes one batch of due tasks. Exposed separately so
    /// tests can pump the queue deterministically.
    pub async fn run_once(&self) -> EngineResult<usize> {
        let tasks = TaskQueue::claim_due(&self.pool, CLAIM_BATCH).await?;
        let count = tasks.len();

        for task in tasks {
            match self.handle(&task).await {
                Ok(()) => TaskQueue::complete(&self.pool, task.id).await?,
                Err(err) if err.is_retryable() => {
                    warn!(
                        "Task {} ({}) attempt {} failed: {}",
                        task.id, task.kind, task.attempts, err
                    );
                    let will_retry =
                        TaskQueue::retry_or_fail(&self.pool, &task, &err.to_string(), &self.config)
                            .await?;
                    if !will_retry {
                        error!("Task {} ({}) exhausted retries", task.id, task.kind);
                        self.on_exhausted(&task).await?;
                    }
                }
                Err(err) => {
                    error!("Task {} ({}) failed terminally: {}", task.id, task.kind, err);
                    TaskQueue::fail(&self.pool, task.id, &err.to_string()).await?;
                    self.on_exhausted(&task).await?;
                }
            }
        }

        Ok(count)
    }

    async fn handle(&self, task: &ScheduledTask) -> EngineResult<()> {
        match task.kind {
            TaskKind::EscalateStep => {
                let payload: EscalateStepPayload = Self::payload(task)?;
                EscalationService::continue_escalation(
                    &self.pool,
                    &self.config,
                    self.resolver.as_ref(),
                    &self.bus,
                    &payload,
                )
                .await
            }
            TaskKind::NotifyUser => {
                let payload: NotifyUserPayload = Self::payload(task)?;
                NotificationStepperService::run(&self.pool, &self.config, &self.notifiers, &payload)
                    .await
            }
            TaskKind::FlushBundle => {
                let payload: FlushBundlePayload = Self::payload(task)?;
                NotificationStepperService::flush_bundle(&self.pool, &self.notifiers, &payload)
                    .await
            }
            TaskKind::Unsilence => {
                let payload: UnsilencePayload = Self::payload(task)?;
                self.run_unsilence(&payload).await
            }
            TaskKind::TriggerWebhook => {
                let payload: TriggerWebhookPayload = Self::payload(task)?;
                EscalationService::run_trigger_webhook(&self.pool, &self.webhook_sender, &payload)
                    .await
            }
            TaskKind::DeclareIncident => {
                let payload: DeclareIncidentPayload = Self::payload(task)?;
                IncidentConnectorService::declare(
                    &self.pool,
                    &self.incident_config,
                    self.incident_api.as_ref(),
                    &payload,
                )
                .await
            }
        }
    }

    /// The timer fires only if it is still the group's current unsilence
    /// timer; anything else (manual unsilence, re-silence, resolve) already
    /// replaced or cleared the identity.
    async fn run_unsilence(&self, payload: &UnsilencePayload) -> EngineResult<()> {
        let group = match sqlx::query_as::<_, AlertGroup>(
            "SELECT * FROM alert_groups WHERE id = $1",
        )
        .bind(payload.alert_group_id)
        .fetch_optional(&self.pool)
        .await?
        {
            Some(g) => g,
            None => return Ok(()),
        };

        if group.unsilence_task_id != Some(payload.timer_id) {
            debug!(
                "Stale unsilence timer {} for group {}",
                payload.timer_id, group.id
            );
            return Ok(());
        }

        match AlertGroupService::unsilence(
            &self.pool,
            &self.config,
            &self.bus,
            group.id,
            None,
            UnsilenceSource::Timer,
        )
        .await
        {
            Ok(_) => Ok(()),
            // Lost a race with a manual transition; nothing left to do
            Err(EngineError::Transition(err)) => {
                debug!("Unsilence timer for group {} obsolete: {}", group.id, err);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn payload<P: DeserializeOwned>(task: &ScheduledTask) -> EngineResult<P> {
        Ok(serde_json::from_value(task.payload.clone())?)
    }

    /// Terminal failure records so the group's history shows what never
    /// happened.
    async fn on_exhausted(&self, task: &ScheduledTask) -> EngineResult<()> {
        let result = match task.kind {
            TaskKind::NotifyUser => {
                let payload: NotifyUserPayload = Self::payload(task)?;
                LogRecordService::append(
                    &self.pool,
                    payload.alert_group_id,
                    LogRecordType::PersonalNotificationFailed,
                    Some(payload.user_id),
                    None,
                    serde_json::json!({ "exhausted": true }),
                    Some("retries_exhausted"),
                )
                .await
                .map(|_| ())
            }
            TaskKind::TriggerWebhook => {
                let payload: TriggerWebhookPayload = Self::payload(task)?;
                LogRecordService::append(
                    &self.pool,
                    payload.alert_group_id,
                    LogRecordType::WebhookFailed,
                    None,
                    Some(payload.escalation_policy_id),
                    serde_json::json!({ "url": payload.url, "exhausted": true }),
                    Some("retries_exhausted"),
                )
                .await
                .map(|_| ())
            }
            TaskKind::DeclareIncident => {
                let payload: DeclareIncidentPayload = Self::payload(task)?;
                LogRecordService::append(
                    &self.pool,
                    payload.alert_group_id,
                    LogRecordType::IncidentDeclareFailed,
                    None,
                    Some(payload.escalation_policy_id),
                    serde_json::json!({ "exhausted": true }),
                    Some("retries_exhausted"),
                )
                .await
                .map(|_| ())
            }
            TaskKind::EscalateStep | TaskKind::FlushBundle | TaskKind::Unsilence => Ok(()),
        };

        if let Err(err) = result {
            // History write failed after the task already failed; log and
            // move on rather than looping on a dead task.
            error!("Failed to record terminal failure for task {}: {}", task.id, err);
        }
        Ok(())
    }
}
