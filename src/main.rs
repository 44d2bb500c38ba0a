use std::sync::Arc;

use log::{error, info};
use tokio::sync::watch;

use escalade::config::Config;
use escalade::db;
use escalade::events::EventBus;
use escalade::queue::Worker;
use escalade::services::escalation::DbOnCallResolver;
use escalade::services::incident::{HttpIncidentApi, IncidentApi, IncidentApiError};
use escalade::services::notification::{NotifierRegistry, WebhookNotifier, WebhookSender};
use escalade::models::RemoteIncident;

/// Stand-in used when no incident system is configured; declare-incident
/// steps fail terminally instead of retrying forever.
struct DisabledIncidentApi;

#[async_trait::async_trait]
impl IncidentApi for DisabledIncidentApi {
    async fn create_incident(
        &self,
        _title: &str,
        _severity: &str,
        _caption: &str,
    ) -> Result<RemoteIncident, IncidentApiError> {
        Err(IncidentApiError {
            status: 400,
            message: "incident connector is not configured".to_string(),
        })
    }

    async fn get_incident(&self, _remote_id: &str) -> Result<RemoteIncident, IncidentApiError> {
        Err(IncidentApiError {
            status: 404,
            message: "incident connector is not configured".to_string(),
        })
    }

    async fn add_activity(&self, _remote_id: &str, _note: &str) -> Result<(), IncidentApiError> {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env()?;

    info!("Connecting to database...");
    let pool = db::create_pool(&config.database).await?;
    db::ping(&pool).await?;

    info!("Running migrations...");
    db::run_migrations(&pool).await?;

    let webhook_secret = std::env::var("WEBHOOK_SECRET").ok();
    let webhook_sender = WebhookSender::new(webhook_secret.clone());

    let mut notifiers = NotifierRegistry::new();
    notifiers.register(Arc::new(WebhookNotifier::new(
        std::env::var("WEBHOOK_NOTIFIER_URL").ok(),
        webhook_secret,
    )));
    let notifiers = Arc::new(notifiers);

    let incident_api: Arc<dyn IncidentApi> = match &config.incident.api_url {
        Some(url) => {
            info!("Incident connector enabled ({})", url);
            Arc::new(HttpIncidentApi::new(url.clone()))
        }
        None => {
            info!("Incident connector disabled (INCIDENT_API_URL not set)");
            Arc::new(DisabledIncidentApi)
        }
    };

    let resolver = Arc::new(DbOnCallResolver::new(pool.clone()));
    let bus = EventBus::default();

    let worker = Worker::new(
        pool.clone(),
        config.engine.clone(),
        config.incident.clone(),
        notifiers,
        incident_api,
        resolver,
        webhook_sender,
        bus,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    shutdown_signal().await;
    info!("Shutdown signal received");
    if shutdown_tx.send(true).is_err() {
        error!("Worker already gone");
    }
    let _ = worker_handle.await;

    pool.close().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
