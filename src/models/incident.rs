use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle of a local incident mirror
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Open,
    Resolved,
    /// Remote side no longer knows the incident (404); local record is dead
    Deactivated,
}

impl std::fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IncidentStatus::Open => write!(f, "open"),
            IncidentStatus::Resolved => write!(f, "resolved"),
            IncidentStatus::Deactivated => write!(f, "deactivated"),
        }
    }
}

/// Local mirror of a remote incident; at most one open per
/// (organization, channel filter)
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct IncidentRecord {
    pub id: Uuid,
    pub organization_id: i32,
    pub channel_filter_id: i32,
    pub remote_id: String,
    pub status: IncidentStatus,
    pub severity: String,
    pub attached_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Remote incident as returned by the external system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteIncident {
    pub id: String,
    pub title: String,
    pub status: String,
}

impl RemoteIncident {
    pub fn is_open(&self) -> bool {
        self.status != "resolved" && self.status != "closed"
    }
}
