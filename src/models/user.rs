use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct User {
    pub id: i32,
    pub organization_id: i32,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Schedule {
    pub id: i32,
    pub organization_id: i32,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct UserGroup {
    pub id: i32,
    pub organization_id: i32,
    pub name: String,
}

/// Which of the user's two policy lists a notification runs through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PolicyTier {
    Default,
    Important,
}

impl PolicyTier {
    pub fn from_important(important: bool) -> Self {
        if important {
            PolicyTier::Important
        } else {
            PolicyTier::Default
        }
    }
}

impl std::fmt::Display for PolicyTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyTier::Default => write!(f, "default"),
            PolicyTier::Important => write!(f, "important"),
        }
    }
}

/// Step kind inside a personal notification policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PolicyStepKind {
    Notify,
    Wait,
}

/// Delivery channel for a notify step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Webhook,
    Email,
    Sms,
    Phone,
    MobilePush,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Webhook => write!(f, "webhook"),
            ChannelKind::Email => write!(f, "email"),
            ChannelKind::Sms => write!(f, "sms"),
            ChannelKind::Phone => write!(f, "phone"),
            ChannelKind::MobilePush => write!(f, "mobile_push"),
        }
    }
}

/// One ordered step of a user's personal notification policy
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct NotificationPolicyStep {
    pub id: i32,
    pub user_id: i32,
    pub tier: PolicyTier,
    pub position: i32,
    pub step: PolicyStepKind,
    pub channel: Option<ChannelKind>,
    pub wait_delay_secs: Option<i64>,
}
