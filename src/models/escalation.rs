//! Escalation chains, their steps, and the per-group snapshot.
//!
//! Step kinds are a closed enum so adding one is an exhaustive-match change,
//! not a stringly-typed branch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct EscalationChain {
    pub id: i32,
    pub organization_id: i32,
    pub name: String,
    /// How many times a trailing repeat step may loop back to step 0
    pub repeat_limit: i32,
    pub created_at: DateTime<Utc>,
}

/// Raw step kind as stored on escalation_policies rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EscalationStepKind {
    Wait,
    NotifyPersons,
    NotifyOnCallFromSchedule,
    NotifyUserGroup,
    TriggerWebhook,
    DeclareIncident,
    RepeatEscalation,
}

/// One ordered step of an escalation chain, as edited by users
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct EscalationPolicy {
    pub id: i32,
    pub escalation_chain_id: i32,
    pub position: i32,
    pub step: EscalationStepKind,
    pub wait_delay_secs: Option<i64>,
    pub important: bool,
    pub schedule_id: Option<i32>,
    pub user_group_id: Option<i32>,
    pub webhook_url: Option<String>,
    pub severity: Option<String>,
}

/// A snapshot step with references resolved enough to execute without the
/// original chain. Schedule/group members recorded here are for audit;
/// execution re-resolves them live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SnapshotStep {
    Wait {
        policy_id: i32,
        delay_secs: i64,
    },
    NotifyPersons {
        policy_id: i32,
        user_ids: Vec<i32>,
        important: bool,
    },
    NotifyOnCallFromSchedule {
        policy_id: i32,
        schedule_id: Option<i32>,
        /// Members on call at snapshot time, kept for audit only
        snapshot_user_ids: Vec<i32>,
        important: bool,
    },
    NotifyUserGroup {
        policy_id: i32,
        user_group_id: Option<i32>,
        snapshot_user_ids: Vec<i32>,
        important: bool,
    },
    TriggerWebhook {
        policy_id: i32,
        url: Option<String>,
    },
    DeclareIncident {
        policy_id: i32,
        severity: Option<String>,
    },
    RepeatEscalation {
        policy_id: i32,
    },
}

impl SnapshotStep {
    pub fn policy_id(&self) -> i32 {
        match self {
            SnapshotStep::Wait { policy_id, .. }
            | SnapshotStep::NotifyPersons { policy_id, .. }
            | SnapshotStep::NotifyOnCallFromSchedule { policy_id, .. }
            | SnapshotStep::NotifyUserGroup { policy_id, .. }
            | SnapshotStep::TriggerWebhook { policy_id, .. }
            | SnapshotStep::DeclareIncident { policy_id, .. }
            | SnapshotStep::RepeatEscalation { policy_id } => *policy_id,
        }
    }
}

/// Immutable per-group copy of the escalation chain, stored as JSON on the
/// group at creation time. Concurrent edits to the chain never affect
/// groups already snapshotted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationSnapshot {
    pub chain_id: i32,
    pub chain_name: String,
    pub repeat_limit: i32,
    pub taken_at: DateTime<Utc>,
    pub steps: Vec<SnapshotStep>,
}

impl EscalationSnapshot {
    pub fn step(&self, index: usize) -> Option<&SnapshotStep> {
        self.steps.get(index)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
