//! Scheduled task rows and their payload envelopes.
//!
//! Handlers must tolerate arbitrary redelivery: the queue guarantees
//! at-least-once, and stale timers are rejected by identity comparison in
//! the handlers rather than revoked from the queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::user::PolicyTier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    EscalateStep,
    NotifyUser,
    FlushBundle,
    Unsilence,
    TriggerWebhook,
    DeclareIncident,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskKind::EscalateStep => "escalate_step",
            TaskKind::NotifyUser => "notify_user",
            TaskKind::FlushBundle => "flush_bundle",
            TaskKind::Unsilence => "unsilence",
            TaskKind::TriggerWebhook => "trigger_webhook",
            TaskKind::DeclareIncident => "declare_incident",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone, FromRow)]
pub struct ScheduledTask {
    pub id: Uuid,
    pub kind: TaskKind,
    pub payload: serde_json::Value,
    pub eta: DateTime<Utc>,
    pub status: TaskStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Envelope for one escalation step firing. `run_id` is the escalation-run
/// identity the step was issued against; it must still match the group's
/// `active_escalation_task_id` at execution time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalateStepPayload {
    pub alert_group_id: Uuid,
    pub step_index: usize,
    pub run_id: Uuid,
    #[serde(default)]
    pub loop_iteration: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyUserPayload {
    pub alert_group_id: Uuid,
    pub user_id: i32,
    pub tier: PolicyTier,
    /// Position in the user's policy step list
    #[serde(default)]
    pub position: i32,
    /// Direct paging sets this so a paged user is notified even when the
    /// group is already acknowledged by someone else
    #[serde(default)]
    pub bypass_acknowledged: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushBundlePayload {
    pub bundle_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsilencePayload {
    pub alert_group_id: Uuid,
    /// Must still match the group's `unsilence_task_id` at execution time
    pub timer_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerWebhookPayload {
    pub alert_group_id: Uuid,
    pub escalation_policy_id: i32,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclareIncidentPayload {
    pub alert_group_id: Uuid,
    pub escalation_policy_id: i32,
    pub severity: Option<String>,
}
