use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Kind of alert source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum IntegrationKind {
    Standard,
    /// Auto-provisioned per (org, team) for manual paging
    DirectPaging,
}

impl std::fmt::Display for IntegrationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrationKind::Standard => write!(f, "standard"),
            IntegrationKind::DirectPaging => write!(f, "direct_paging"),
        }
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Organization {
    pub id: i32,
    pub name: String,
    pub default_incident_severity: String,
    pub quota_exceeded_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Team {
    pub id: i32,
    pub organization_id: i32,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Alert source; owns channel filters
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Integration {
    pub id: i32,
    pub organization_id: i32,
    pub team_id: Option<i32>,
    pub name: String,
    pub kind: IntegrationKind,
    pub quota_exceeded_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Routes an integration to an escalation chain. The default filter's
/// routing pattern is immutable.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ChannelFilter {
    pub id: i32,
    pub integration_id: i32,
    pub escalation_chain_id: Option<i32>,
    pub routing_pattern: String,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
}
