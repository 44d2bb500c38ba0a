//! Incident connector: mirrors escalation "declare incident" steps into an
//! external incident management system, idempotently per route. Repeated
//! declarations for the same (organization, channel filter) attach to the
//! already-open incident instead of opening another one.

use async_trait::async_trait;
use log::{debug, info, warn};
use sqlx::PgPool;

use crate::config::IncidentConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    AlertGroup, DeclareIncidentPayload, IncidentRecord, IncidentStatus, LogRecordType,
    Organization, RemoteIncident,
};
use crate::services::log_records::LogRecordService;

// =============================================================================
// Remote API
// =============================================================================

#[derive(Debug, Clone, thiserror::Error)]
#[error("incident API error {status}: {message}")]
pub struct IncidentApiError {
    pub status: u16,
    pub message: String,
}

/// Client seam for the external incident system; swapped for a fake in tests.
#[async_trait]
pub trait IncidentApi: Send + Sync {
    async fn create_incident(
        &self,
        title: &str,
        severity: &str,
        caption: &str,
    ) -> Result<RemoteIncident, IncidentApiError>;

    async fn get_incident(&self, remote_id: &str) -> Result<RemoteIncident, IncidentApiError>;

    async fn add_activity(&self, remote_id: &str, note: &str) -> Result<(), IncidentApiError>;
}

pub struct HttpIncidentApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpIncidentApi {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("Failed to create HTTP client"),
            base_url,
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, IncidentApiError> {
        let status = response.status().as_u16();
        if !response.status().is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(IncidentApiError { status, message });
        }
        response.json().await.map_err(|e| IncidentApiError {
            status,
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl IncidentApi for HttpIncidentApi {
    async fn create_incident(
        &self,
        title: &str,
        severity: &str,
        caption: &str,
    ) -> Result<RemoteIncident, IncidentApiError> {
        let response = self
            .client
            .post(format!("{}/incidents", self.base_url))
            .json(&serde_json::json!({
                "title": title,
                "severity": severity,
                "caption": caption,
            }))
            .send()
            .await
            .map_err(|e| IncidentApiError {
                status: 0,
                message: e.to_string(),
            })?;
        Self::decode(response).await
    }

    async fn get_incident(&self, remote_id: &str) -> Result<RemoteIncident, IncidentApiError> {
        let response = self
            .client
            .get(format!("{}/incidents/{}", self.base_url, remote_id))
            .send()
            .await
            .map_err(|e| IncidentApiError {
                status: 0,
                message: e.to_string(),
            })?;
        Self::decode(response).await
    }

    async fn add_activity(&self, remote_id: &str, note: &str) -> Result<(), IncidentApiError> {
        let response = self
            .client
            .post(format!("{}/incidents/{}/activity", self.base_url, remote_id))
            .json(&serde_json::json!({ "note": note }))
            .send()
            .await
            .map_err(|e| IncidentApiError {
                status: 0,
                message: e.to_string(),
            })?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(IncidentApiError { status, message });
        }
        Ok(())
    }
}

// =============================================================================
// Severity resolution
// =============================================================================

/// Requested severity first, then the severity labeled on the group's
/// alerts, then the organization default.
pub fn resolve_severity(
    requested: Option<&str>,
    label_severity: Option<&str>,
    org_default: &str,
) -> String {
    requested
        .or(label_severity)
        .unwrap_or(org_default)
        .to_string()
}

// =============================================================================
// Service
// =============================================================================

pub struct IncidentConnectorService;

impl IncidentConnectorService {
    /// Handles a declare-incident escalation step. Transport and 5xx errors
    /// bubble up so the queue retries with backoff.
    pub async fn declare(
        pool: &PgPool,
        config: &IncidentConfig,
        api: &dyn IncidentApi,
        payload: &DeclareIncidentPayload,
    ) -> EngineResult<()> {
        let group = match sqlx::query_as::<_, AlertGroup>(
            "SELECT * FROM alert_groups WHERE id = $1",
        )
        .bind(payload.alert_group_id)
        .fetch_optional(pool)
        .await?
        {
            Some(g) if g.is_open() => g,
            _ => return Ok(()),
        };

        let channel_filter_id = match group.channel_filter_id {
            Some(id) => id,
            None => {
                debug!("Group {} has no channel filter, incident step skipped", group.id);
                return Ok(());
            }
        };

        let org = Self::organization_of(pool, group.integration_id).await?;

        if let Some(existing) = Self::open_incident(pool, org.id, channel_filter_id).await? {
            match api.get_incident(&existing.remote_id).await {
                Ok(remote) if remote.is_open() => {
                    return Self::attach(pool, config, api, &existing, &group, payload).await;
                }
                Ok(_) => {
                    // Closed remotely; record it and open a fresh incident
                    Self::set_status(pool, &existing, IncidentStatus::Resolved).await?;
                }
                Err(err) if err.status == 404 => {
                    warn!(
                        "Remote incident {} vanished, deactivating local record",
                        existing.remote_id
                    );
                    Self::set_status(pool, &existing, IncidentStatus::Deactivated).await?;
                }
                Err(err) => {
                    return Err(EngineError::RemoteIncident {
                        status: err.status,
                        message: err.message,
                    });
                }
            }
        }

        Self::create(pool, api, &org, channel_filter_id, &group, payload).await
    }

    async fn create(
        pool: &PgPool,
        api: &dyn IncidentApi,
        org: &Organization,
        channel_filter_id: i32,
        group: &AlertGroup,
        payload: &DeclareIncidentPayload,
    ) -> EngineResult<()> {
        let mut severity = resolve_severity(
            payload.severity.as_deref(),
            group.label_severity.as_deref(),
            &org.default_incident_severity,
        );
        let caption = format!("Declared from alert group \"{}\"", group.title);

        let remote = match api.create_incident(&group.title, &severity, &caption).await {
            Ok(remote) => remote,
            // The remote rejected the severity value; retry once with the
            // organization default before giving up.
            Err(err)
                if err.status == 400
                    && err.message.to_lowercase().contains("severity")
                    && severity != org.default_incident_severity =>
            {
                warn!(
                    "Severity '{}' rejected by incident API, retrying with org default '{}'",
                    severity, org.default_incident_severity
                );
                severity = org.default_incident_severity.clone();
                match api.create_incident(&group.title, &severity, &caption).await {
                    Ok(remote) => remote,
                    Err(err) => return Self::create_failed(pool, group, payload, err).await,
                }
            }
            Err(err) if err.status == 0 || err.status >= 500 => {
                return Err(EngineError::RemoteIncident {
                    status: err.status,
                    message: err.message,
                });
            }
            Err(err) => return Self::create_failed(pool, group, payload, err).await,
        };

        let mut tx = pool.begin().await?;
        let incident = sqlx::query_as::<_, IncidentRecord>(
            r#"
            INSERT INTO incident_records
                (organization_id, channel_filter_id, remote_id, severity, attached_count)
            VALUES ($1, $2, $3, $4::text::varchar, 1)
            RETURNING *
            "#,
        )
        .bind(org.id)
        .bind(channel_filter_id)
        .bind(&remote.id)
        .bind(&severity)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO incident_attachments (incident_id, alert_group_id, posted_remote)
            VALUES ($1, $2, TRUE)
            ON CONFLICT (incident_id, alert_group_id) DO NOTHING
            "#,
        )
        .bind(incident.id)
        .bind(group.id)
        .execute(&mut *tx)
        .await?;

        LogRecordService::append(
            &mut *tx,
            group.id,
            LogRecordType::IncidentDeclared,
            None,
            Some(payload.escalation_policy_id),
            serde_json::json!({
                "remote_id": remote.id,
                "severity": severity,
                "attached": false,
            }),
            None,
        )
        .await?;
        tx.commit().await?;

        info!(
            "Declared incident {} (severity {}) for group {}",
            remote.id, severity, group.id
        );
        Ok(())
    }

    /// Attaches a group to the already-open incident for its route. Beyond
    /// the attachment cap the link is local only; the remote incident is not
    /// spammed with activity.
    async fn attach(
        pool: &PgPool,
        config: &IncidentConfig,
        api: &dyn IncidentApi,
        incident: &IncidentRecord,
        group: &AlertGroup,
        payload: &DeclareIncidentPayload,
    ) -> EngineResult<()> {
        let mut tx = pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO incident_attachments (incident_id, alert_group_id, posted_remote)
            VALUES ($1, $2, FALSE)
            ON CONFLICT (incident_id, alert_group_id) DO NOTHING
            "#,
        )
        .bind(incident.id)
        .bind(group.id)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            // Already attached; redelivered task
            return Ok(());
        }

        let (attached_count,): (i32,) = sqlx::query_as(
            r#"
            UPDATE incident_records SET attached_count = attached_count + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING attached_count
            "#,
        )
        .bind(incident.id)
        .fetch_one(&mut *tx)
        .await?;

        let post_remote = attached_count <= config.max_attached;
        if post_remote {
            sqlx::query(
                r#"
                UPDATE incident_attachments SET posted_remote = TRUE
                WHERE incident_id = $1 AND alert_group_id = $2
                "#,
            )
            .bind(incident.id)
            .bind(group.id)
            .execute(&mut *tx)
            .await?;
        }

        LogRecordService::append(
            &mut *tx,
            group.id,
            LogRecordType::IncidentDeclared,
            None,
            Some(payload.escalation_policy_id),
            serde_json::json!({
                "remote_id": incident.remote_id,
                "severity": incident.severity,
                "attached": true,
                "posted_remote": post_remote,
            }),
            None,
        )
        .await?;
        tx.commit().await?;

        if post_remote {
            let note = format!("Alert group \"{}\" attached to this incident", group.title);
            if let Err(err) = api.add_activity(&incident.remote_id, &note).await {
                // Attachment is already durable; a lost activity note is
                // not worth failing the task over.
                warn!(
                    "Failed to post activity to incident {}: {}",
                    incident.remote_id, err
                );
            }
        } else {
            debug!(
                "Incident {} at attachment cap, group {} attached locally only",
                incident.remote_id, group.id
            );
        }

        info!("Attached group {} to incident {}", group.id, incident.remote_id);
        Ok(())
    }

    async fn create_failed(
        pool: &PgPool,
        group: &AlertGroup,
        payload: &DeclareIncidentPayload,
        err: IncidentApiError,
    ) -> EngineResult<()> {
        warn!("Incident creation failed for group {}: {}", group.id, err);
        LogRecordService::append(
            pool,
            group.id,
            LogRecordType::IncidentDeclareFailed,
            None,
            Some(payload.escalation_policy_id),
            serde_json::json!({ "status": err.status, "message": err.message }),
            Some("incident_create_rejected"),
        )
        .await?;
        Ok(())
    }

    async fn open_incident(
        pool: &PgPool,
        organization_id: i32,
        channel_filter_id: i32,
    ) -> EngineResult<Option<IncidentRecord>> {
        let incident = sqlx::query_as::<_, IncidentRecord>(
            r#"
            SELECT * FROM incident_records
            WHERE organization_id = $1 AND channel_filter_id = $2 AND status = 'open'
            "#,
        )
        .bind(organization_id)
        .bind(channel_filter_id)
        .fetch_optional(pool)
        .await?;
        Ok(incident)
    }

    async fn set_status(
        pool: &PgPool,
        incident: &IncidentRecord,
        status: IncidentStatus,
    ) -> EngineResult<()> {
        sqlx::query(
            r#"
            UPDATE incident_records SET status = $2::text::varchar, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(incident.id)
        .bind(status.to_string())
        .execute(pool)
        .await?;
        Ok(())
    }

    async fn organization_of(pool: &PgPool, integration_id: i32) -> EngineResult<Organization> {
        sqlx::query_as::<_, Organization>(
            r#"
            SELECT o.* FROM organizations o
            JOIN integrations i ON i.organization_id = o.id
            WHERE i.id = $1
            "#,
        )
        .bind(integration_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| {
            EngineError::NotFound(format!(
                "Organization for integration {} not found",
                integration_id
            ))
        })
    }
}
