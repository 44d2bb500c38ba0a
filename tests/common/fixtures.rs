//! Seed data builders and fake collaborators for integration tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use escalade::config::{EngineConfig, IncidentConfig};
use escalade::error::EngineResult;
use escalade::events::EventBus;
use escalade::models::{ChannelKind, RemoteIncident, User};
use escalade::queue::Worker;
use escalade::services::escalation::OnCallResolver;
use escalade::services::incident::{IncidentApi, IncidentApiError};
use escalade::services::notification::{
    NotificationMessage, Notifier, NotifierRegistry, NotifyError, WebhookSender,
};

// =============================================================================
// Seed data
// =============================================================================

pub async fn create_org(pool: &PgPool) -> i32 {
    let (id,): (i32,) =
        sqlx::query_as("INSERT INTO organizations (name) VALUES ('Test Org') RETURNING id")
            .fetch_one(pool)
            .await
            .expect("Failed to create organization");
    id
}

pub async fn create_user(pool: &PgPool, org_id: i32, username: &str) -> i32 {
    let (id,): (i32,) = sqlx::query_as(
        "INSERT INTO users (organization_id, username) VALUES ($1, $2) RETURNING id",
    )
    .bind(org_id)
    .bind(username)
    .fetch_one(pool)
    .await
    .expect("Failed to create user");
    id
}

pub async fn create_team(pool: &PgPool, org_id: i32, name: &str) -> i32 {
    let (id,): (i32,) = sqlx::query_as(
        "INSERT INTO teams (organization_id, name) VALUES ($1, $2) RETURNING id",
    )
    .bind(org_id)
    .bind(name)
    .fetch_one(pool)
    .await
    .expect("Failed to create team");
    id
}

pub async fn add_team_member(pool: &PgPool, team_id: i32, user_id: i32) {
    sqlx::query("INSERT INTO team_members (team_id, user_id) VALUES ($1, $2)")
        .bind(team_id)
        .bind(user_id)
        .execute(pool)
        .await
        .expect("Failed to add team member");
}

pub async fn create_integration(pool: &PgPool, org_id: i32) -> i32 {
    let (id,): (i32,) = sqlx::query_as(
        "INSERT INTO integrations (organization_id, name, kind) VALUES ($1, 'Test Integration', 'standard') RETURNING id",
    )
    .bind(org_id)
    .fetch_one(pool)
    .await
    .expect("Failed to create integration");
    id
}

pub async fn create_chain(pool: &PgPool, org_id: i32, repeat_limit: i32) -> i32 {
    let (id,): (i32,) = sqlx::query_as(
        "INSERT INTO escalation_chains (organization_id, name, repeat_limit) VALUES ($1, 'Test Chain', $2) RETURNING id",
    )
    .bind(org_id)
    .bind(repeat_limit)
    .fetch_one(pool)
    .await
    .expect("Failed to create escalation chain");
    id
}

pub async fn create_default_filter(pool: &PgPool, integration_id: i32, chain_id: Option<i32>) -> i32 {
    let (id,): (i32,) = sqlx::query_as(
        "INSERT INTO channel_filters (integration_id, escalation_chain_id, is_default) VALUES ($1, $2, TRUE) RETURNING id",
    )
    .bind(integration_id)
    .bind(chain_id)
    .fetch_one(pool)
    .await
    .expect("Failed to create channel filter");
    id
}

pub async fn add_notify_persons_step(
    pool: &PgPool,
    chain_id: i32,
    position: i32,
    user_ids: &[i32],
    important: bool,
) -> i32 {
    let (id,): (i32,) = sqlx::query_as(
        "INSERT INTO escalation_policies (escalation_chain_id, position, step, important) VALUES ($1, $2, 'notify_persons', $3) RETURNING id",
    )
    .bind(chain_id)
    .bind(position)
    .bind(important)
    .fetch_one(pool)
    .await
    .expect("Failed to create escalation policy");
    for user_id in user_ids {
        sqlx::query(
            "INSERT INTO escalation_policy_users (escalation_policy_id, user_id) VALUES ($1, $2)",
        )
        .bind(id)
        .bind(user_id)
        .execute(pool)
        .await
        .expect("Failed to link policy user");
    }
    id
}

pub async fn add_wait_step(pool: &PgPool, chain_id: i32, position: i32, delay_secs: i64) -> i32 {
    let (id,): (i32,) = sqlx::query_as(
        "INSERT INTO escalation_policies (escalation_chain_id, position, step, wait_delay_secs) VALUES ($1, $2, 'wait', $3) RETURNING id",
    )
    .bind(chain_id)
    .bind(position)
    .bind(delay_secs)
    .fetch_one(pool)
    .await
    .expect("Failed to create wait step");
    id
}

pub async fn add_declare_incident_step(
    pool: &PgPool,
    chain_id: i32,
    position: i32,
    severity: Option<&str>,
) -> i32 {
    let (id,): (i32,) = sqlx::query_as(
        "INSERT INTO escalation_policies (escalation_chain_id, position, step, severity) VALUES ($1, $2, 'declare_incident', $3) RETURNING id",
    )
    .bind(chain_id)
    .bind(position)
    .bind(severity)
    .fetch_one(pool)
    .await
    .expect("Failed to create declare_incident step");
    id
}

pub async fn add_webhook_step(pool: &PgPool, chain_id: i32, position: i32, url: &str) -> i32 {
    let (id,): (i32,) = sqlx::query_as(
        "INSERT INTO escalation_policies (escalation_chain_id, position, step, webhook_url) VALUES ($1, $2, 'trigger_webhook', $3) RETURNING id",
    )
    .bind(chain_id)
    .bind(position)
    .bind(url)
    .fetch_one(pool)
    .await
    .expect("Failed to create webhook step")
    ;
    id
}

/// Gives the user a one-step webhook policy on the given tier
pub async fn add_notification_policy(pool: &PgPool, user_id: i32, tier: &str) -> i32 {
    let (id,): (i32,) = sqlx::query_as(
        "INSERT INTO notification_policies (user_id, tier, position, step, channel) VALUES ($1, $2, 0, 'notify', 'webhook') RETURNING id",
    )
    .bind(user_id)
    .bind(tier)
    .fetch_one(pool)
    .await
    .expect("Failed to create notification policy");
    id
}

pub async fn add_notification_wait(pool: &PgPool, user_id: i32, tier: &str, position: i32, delay_secs: i64) -> i32 {
    let (id,): (i32,) = sqlx::query_as(
        "INSERT INTO notification_policies (user_id, tier, position, step, wait_delay_secs) VALUES ($1, $2, $3, 'wait', $4) RETURNING id",
    )
    .bind(user_id)
    .bind(tier)
    .bind(position)
    .bind(delay_secs)
    .fetch_one(pool)
    .await
    .expect("Failed to create wait policy step");
    id
}

// =============================================================================
// Fake collaborators
// =============================================================================

/// Captures every delivery instead of sending it anywhere
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(i32, NotificationMessage)>>,
    pub fail_with: Mutex<Option<NotifyError>>,
}

impl RecordingNotifier {
    pub fn sent_user_ids(&self) -> Vec<i32> {
        self.sent.lock().unwrap().iter().map(|(u, _)| *u).collect()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn channel(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    async fn send(&self, user: &User, message: &NotificationMessage) -> Result<(), NotifyError> {
        if let Some(err) = self.fail_with.lock().unwrap().clone() {
            return Err(err);
        }
        self.sent.lock().unwrap().push((user.id, message.clone()));
        Ok(())
    }
}

/// On-call resolver with a fixed answer
pub struct StaticOnCallResolver {
    pub user_ids: Vec<i32>,
}

#[async_trait]
impl OnCallResolver for StaticOnCallResolver {
    async fn users_on_call(&self, _schedule_id: i32) -> EngineResult<Vec<i32>> {
        Ok(self.user_ids.clone())
    }
}

#[derive(Debug, Clone)]
pub struct FakeRemoteIncident {
    pub id: String,
    pub title: String,
    pub status: String,
    pub activity: Vec<String>,
}

/// In-memory incident system
#[derive(Default)]
pub struct FakeIncidentApi {
    pub incidents: Mutex<Vec<FakeRemoteIncident>>,
    /// Next create call fails with this status/message
    pub reject_create: Mutex<Option<(u16, String)>>,
}

impl FakeIncidentApi {
    pub fn created_count(&self) -> usize {
        self.incidents.lock().unwrap().len()
    }

    pub fn resolve_remote(&self, remote_id: &str) {
        let mut incidents = self.incidents.lock().unwrap();
        if let Some(incident) = incidents.iter_mut().find(|i| i.id == remote_id) {
            incident.status = "resolved".to_string();
        }
    }

    pub fn activity_count(&self, remote_id: &str) -> usize {
        self.incidents
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.id == remote_id)
            .map(|i| i.activity.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl IncidentApi for FakeIncidentApi {
    async fn create_incident(
        &self,
        title: &str,
        severity: &str,
        _caption: &str,
    ) -> Result<RemoteIncident, IncidentApiError> {
        if let Some((status, message)) = self.reject_create.lock().unwrap().take() {
            return Err(IncidentApiError { status, message });
        }
        let id = format!("INC-{}", Uuid::new_v4());
        let incident = FakeRemoteIncident {
            id: id.clone(),
            title: format!("{} [{}]", title, severity),
            status: "firing".to_string(),
            activity: Vec::new(),
        };
        self.incidents.lock().unwrap().push(incident.clone());
        Ok(RemoteIncident {
            id,
            title: incident.title,
            status: incident.status,
        })
    }

    async fn get_incident(&self, remote_id: &str) -> Result<RemoteIncident, IncidentApiError> {
        self.incidents
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.id == remote_id)
            .map(|i| RemoteIncident {
                id: i.id.clone(),
                title: i.title.clone(),
                status: i.status.clone(),
            })
            .ok_or_else(|| IncidentApiError {
                status: 404,
                message: "not found".to_string(),
            })
    }

    async fn add_activity(&self, remote_id: &str, note: &str) -> Result<(), IncidentApiError> {
        let mut incidents = self.incidents.lock().unwrap();
        match incidents.iter_mut().find(|i| i.id == remote_id) {
            Some(incident) => {
                incident.activity.push(note.to_string());
                Ok(())
            }
            None => Err(IncidentApiError {
                status: 404,
                message: "not found".to_string(),
            }),
        }
    }
}

// =============================================================================
// Worker harness
// =============================================================================

pub struct TestEngine {
    pub worker: Worker,
    pub notifier: Arc<RecordingNotifier>,
    pub incident_api: Arc<FakeIncidentApi>,
    pub bus: EventBus,
    pub config: EngineConfig,
    pool: PgPool,
}

impl TestEngine {
    pub fn new(pool: PgPool, config: EngineConfig) -> Self {
        Self::with_incident_config(pool, config, IncidentConfig::from_env())
    }

    pub fn with_incident_config(
        pool: PgPool,
        config: EngineConfig,
        incident_config: IncidentConfig,
    ) -> Self {
        let notifier = Arc::new(RecordingNotifier::default());
        let incident_api = Arc::new(FakeIncidentApi::default());
        let bus = EventBus::default();

        let mut registry = NotifierRegistry::new();
        registry.register(notifier.clone());

        let worker = Worker::new(
            pool.clone(),
            config.clone(),
            incident_config,
            Arc::new(registry),
            incident_api.clone(),
            Arc::new(StaticOnCallResolver { user_ids: vec![] }),
            WebhookSender::new(None),
            bus.clone(),
        );

        Self {
            worker,
            notifier,
            incident_api,
            bus,
            config,
            pool,
        }
    }

    /// Pulls every pending task's ETA into the past so waits fire now
    pub async fn make_all_due(&self) {
        sqlx::query(
            "UPDATE scheduled_tasks SET eta = NOW() - INTERVAL '1 second' WHERE status = 'pending'",
        )
        .execute(&self.pool)
        .await
        .expect("Failed to reschedule tasks");
    }

    /// Processes due tasks until the queue settles (newly spawned due tasks
    /// included). Future-dated tasks are left alone.
    pub async fn pump(&self) {
        for _ in 0..50 {
            let processed = self.worker.run_once().await.expect("Worker pass failed");
            if processed == 0 {
                return;
            }
        }
        panic!("Queue did not settle after 50 passes");
    }

    /// make_all_due + pump, repeated until nothing is pending
    pub async fn drain(&self) {
        for _ in 0..20 {
            self.make_all_due().await;
            let processed = self.worker.run_once().await.expect("Worker pass failed");
            if processed == 0 {
                return;
            }
        }
        panic!("Queue did not drain after 20 rounds");
    }
}
