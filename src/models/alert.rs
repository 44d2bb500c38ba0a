//! Alert and alert-group entities.
//!
//! An AlertGroup is the deduplicated incident unit that escalation,
//! acknowledgement, and resolution apply to. State flags are orthogonal
//! (acknowledged / silenced / resolved each have independent "un-" actions);
//! the single-enum effective status exists only for external reporting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One raw inbound event; immutable, belongs to exactly one group
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Alert {
    pub id: Uuid,
    pub alert_group_id: Uuid,
    pub integration_id: i32,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Derived status precedence for display: Resolved > Silenced > Acknowledged
/// > Firing. Flags stay orthogonal in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    Firing,
    Acknowledged,
    Silenced,
    Resolved,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AlertGroup {
    pub id: Uuid,
    pub integration_id: i32,
    pub channel_filter_id: Option<i32>,
    pub title: String,
    pub grouping_key: String,
    pub grouping_key_hash: String,
    /// Severity carried on the first alert's labels, if any; one input to
    /// incident severity resolution.
    pub label_severity: Option<String>,
    pub started_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<i32>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<i32>,
    pub silenced: bool,
    pub silenced_at: Option<DateTime<Utc>>,
    pub silenced_by: Option<i32>,
    /// None while silenced means "silenced forever"
    pub silenced_until: Option<DateTime<Utc>>,
    /// Immutable copy of the escalation chain taken at group creation
    pub escalation_snapshot: Option<serde_json::Value>,
    /// Identity of the current escalation run; stale timers carry an old
    /// value and die on arrival.
    pub active_escalation_task_id: Option<Uuid>,
    pub unsilence_task_id: Option<Uuid>,
    /// Index of the last executed snapshot step, for resume-after-pause
    pub last_step_index: Option<i32>,
    pub archived: bool,
}

impl AlertGroup {
    pub fn status(&self) -> GroupStatus {
        if self.resolved {
            GroupStatus::Resolved
        } else if self.silenced {
            GroupStatus::Silenced
        } else if self.acknowledged {
            GroupStatus::Acknowledged
        } else {
            GroupStatus::Firing
        }
    }

    /// A group accepts new alerts and pages only while it is not resolved
    /// and not archived.
    pub fn is_open(&self) -> bool {
        !self.resolved && !self.archived
    }
}

/// Versioned counter row deciding attach-vs-create under concurrent writers
#[derive(Debug, Clone, FromRow)]
pub struct GroupingCounter {
    pub integration_id: i32,
    pub grouping_key_hash: String,
    pub version: i64,
    pub alert_group_id: Option<Uuid>,
}
