//! Append-only log records.
//!
//! One row per transition or delivery attempt. Besides audit, these rows are
//! the idempotency boundary for the notification stepper: a duplicate
//! trigger check consults them before re-sending.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LogRecordType {
    Ack,
    UnAck,
    Resolved,
    UnResolved,
    Silence,
    UnSilence,
    EscalationTriggered,
    EscalationFinished,
    EscalationFailed,
    PersonalNotificationTriggered,
    PersonalNotificationFailed,
    DirectPaging,
    UnpageUser,
    WebhookTriggered,
    WebhookFailed,
    IncidentDeclared,
    IncidentDeclareFailed,
}

impl std::fmt::Display for LogRecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogRecordType::Ack => "ack",
            LogRecordType::UnAck => "un_ack",
            LogRecordType::Resolved => "resolved",
            LogRecordType::UnResolved => "un_resolved",
            LogRecordType::Silence => "silence",
            LogRecordType::UnSilence => "un_silence",
            LogRecordType::EscalationTriggered => "escalation_triggered",
            LogRecordType::EscalationFinished => "escalation_finished",
            LogRecordType::EscalationFailed => "escalation_failed",
            LogRecordType::PersonalNotificationTriggered => "personal_notification_triggered",
            LogRecordType::PersonalNotificationFailed => "personal_notification_failed",
            LogRecordType::DirectPaging => "direct_paging",
            LogRecordType::UnpageUser => "unpage_user",
            LogRecordType::WebhookTriggered => "webhook_triggered",
            LogRecordType::WebhookFailed => "webhook_failed",
            LogRecordType::IncidentDeclared => "incident_declared",
            LogRecordType::IncidentDeclareFailed => "incident_declare_failed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct LogRecord {
    pub id: i64,
    pub alert_group_id: Uuid,
    pub record_type: LogRecordType,
    pub author_id: Option<i32>,
    pub escalation_policy_id: Option<i32>,
    pub step_info: serde_json::Value,
    pub error_code: Option<String>,
    pub created_at: DateTime<Utc>,
}
