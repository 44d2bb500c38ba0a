use std::env;
use std::time::Duration;

/// Engine configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
    pub rate_limit: RateLimitConfig,
    pub incident: IncidentConfig,
}

/// Database connection pool configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

/// Policy knobs for escalation, notification, and the task queue
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Whether acknowledging a group pauses its escalation. Silencing always
    /// pauses; the acknowledge behavior is deliberately configurable.
    pub pause_on_acknowledge: bool,
    /// Window within which low-priority notifications to one user are merged
    /// into a single delivery. Zero disables bundling.
    pub bundle_window: Duration,
    /// How often worker loops poll for due tasks.
    pub poll_interval: Duration,
    /// Max task attempts before a task is marked failed.
    pub max_task_attempts: i32,
    /// Base delay for task retry backoff.
    pub retry_base: Duration,
    /// Cap for task retry backoff.
    pub retry_max: Duration,
    /// Max ingestion retries when the grouping counter is contended.
    pub max_grouping_retries: u32,
}

/// Rate limiting configuration for alert ingestion
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Per-organization max alerts per minute
    pub max_alerts_per_org_per_minute: i64,
    /// Per-integration max alerts per minute
    pub max_alerts_per_integration_per_minute: i64,
}

/// Incident connector configuration
#[derive(Debug, Clone)]
pub struct IncidentConfig {
    /// Base URL of the external incident system
    pub api_url: Option<String>,
    /// Groups attached to a remote incident beyond this cap are associated
    /// locally but not posted into the remote incident.
    pub max_attached: i32,
}

#[derive(Debug)]
pub enum ConfigError {
    MissingDatabaseUrl,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingDatabaseUrl => {
                write!(f, "DATABASE_URL environment variable is required")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

fn env_i64(name: &str, default: i64) -> i64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(name: &str, default: u64) -> Duration {
    Duration::from_secs(
        env::var(name)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default),
    )
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database: DatabaseConfig::from_env()?,
            engine: EngineConfig::from_env(),
            rate_limit: RateLimitConfig::from_env(),
            incident: IncidentConfig::from_env(),
        })
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            pause_on_acknowledge: env::var("ESCALATION_PAUSE_ON_ACK")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            bundle_window: env_secs("NOTIFICATION_BUNDLE_WINDOW_SECS", 120),
            poll_interval: Duration::from_millis(
                env::var("TASK_POLL_INTERVAL_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(500),
            ),
            max_task_attempts: env_i64("TASK_MAX_ATTEMPTS", 5) as i32,
            retry_base: env_secs("TASK_RETRY_BASE_SECS", 60),
            retry_max: env_secs("TASK_RETRY_MAX_SECS", 3600),
            max_grouping_retries: env_i64("GROUPING_MAX_RETRIES", 10) as u32,
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        Self {
            max_alerts_per_org_per_minute: env_i64("MAX_ALERTS_PER_ORG_PER_MINUTE", 1000),
            max_alerts_per_integration_per_minute: env_i64(
                "MAX_ALERTS_PER_INTEGRATION_PER_MINUTE",
                300,
            ),
        }
    }
}

impl IncidentConfig {
    pub fn from_env() -> Self {
        Self {
            api_url: env::var("INCIDENT_API_URL").ok(),
            max_attached: env_i64("INCIDENT_MAX_ATTACHED", 5) as i32,
        }
    }
}

impl DatabaseConfig {
    /// Load database configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let url = env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)?;

        Ok(Self {
            url,
            max_connections: env_i64("DATABASE_MAX_CONNECTIONS", 10) as u32,
            min_connections: env_i64("DATABASE_MIN_CONNECTIONS", 1) as u32,
            acquire_timeout: env_secs("DATABASE_ACQUIRE_TIMEOUT_SECS", 5),
            idle_timeout: env_secs("DATABASE_IDLE_TIMEOUT_SECS", 600),
            max_lifetime: env_secs("DATABASE_MAX_LIFETIME_SECS", 1800),
        })
    }
}

impl Default for EngineConfig {
    /// Defaults used by tests; production loads from the environment.
    fn default() -> Self {
        Self {
            pause_on_acknowledge: false,
            bundle_window: Duration::from_secs(120),
            poll_interval: Duration::from_millis(500),
            max_task_attempts: 5,
            retry_base: Duration::from_secs(60),
            retry_max: Duration::from_secs(3600),
            max_grouping_retries: 10,
        }
    }
}
