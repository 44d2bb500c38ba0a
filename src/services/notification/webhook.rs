//! Outbound webhook notifier.
//!
//! Posts notification payloads as JSON with HMAC-SHA256 signature headers.
//! Also used by escalation `trigger_webhook` steps via [`WebhookSender`].

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::{NotificationMessage, Notifier, NotifyError};
use crate::error::{EngineError, EngineResult};
use crate::models::{ChannelKind, User};

type HmacSha256 = Hmac<Sha256>;

/// HTTP sender shared by the webhook notifier and escalation webhook steps
#[derive(Clone)]
pub struct WebhookSender {
    client: reqwest::Client,
    secret: Option<String>,
}

impl WebhookSender {
    pub fn new(secret: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self { client, secret }
    }

    /// Generates HMAC-SHA256 signature for a webhook payload
    fn generate_signature(secret: &str, timestamp: &str, payload: &[u8]) -> String {
        let signature_payload = format!("{}.{}", timestamp, String::from_utf8_lossy(payload));
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
        mac.update(signature_payload.as_bytes());
        let result = mac.finalize();
        hex::encode(result.into_bytes())
    }

    /// Posts `payload` to `url`, classifying failures into [`NotifyError`]
    pub async fn post(&self, url: &str, payload: &serde_json::Value) -> Result<(), NotifyError> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| NotifyError::Unsupported(format!("unserializable payload: {}", e)))?;

        let timestamp = Utc::now().timestamp().to_string();

        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("X-Escalade-Timestamp", &timestamp);

        if let Some(ref secret) = self.secret {
            let signature = Self::generate_signature(secret, &timestamp, &body);
            request = request.header("X-Escalade-Signature", format!("sha256={}", signature));
        }

        match request.body(body).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    Ok(())
                } else if status.as_u16() == 429 {
                    Err(NotifyError::QuotaExceeded)
                } else if status.as_u16() == 401 || status.as_u16() == 403 {
                    Err(NotifyError::NotVerified)
                } else if status.is_server_error() {
                    Err(NotifyError::Transient(format!("HTTP {}", status.as_u16())))
                } else {
                    Err(NotifyError::Unsupported(format!(
                        "HTTP {}",
                        status.as_u16()
                    )))
                }
            }
            Err(e) => {
                if e.is_timeout() {
                    Err(NotifyError::Transient("request timed out".to_string()))
                } else if e.is_connect() {
                    Err(NotifyError::Transient("connection failed".to_string()))
                } else {
                    Err(NotifyError::Transient(format!("request failed: {}", e)))
                }
            }
        }
    }

    /// Validates a webhook URL (http/https only)
    pub fn validate_url(raw: &str) -> EngineResult<()> {
        if raw.is_empty() {
            return Err(EngineError::Validation(
                "Webhook URL is required".to_string(),
            ));
        }

        let parsed = url::Url::parse(raw)
            .map_err(|_| EngineError::Validation("Invalid webhook URL format".to_string()))?;

        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(EngineError::Validation(
                "Webhook URL must use HTTP or HTTPS".to_string(),
            ));
        }

        Ok(())
    }
}

/// Personal-notification channel backed by a fixed gateway URL
pub struct WebhookNotifier {
    sender: WebhookSender,
    url: Option<String>,
}

impl WebhookNotifier {
    /// `url` is the paging gateway endpoint; without one, sends fail as
    /// `Unsupported` and the stepper moves to the next step.
    pub fn new(url: Option<String>, secret: Option<String>) -> Self {
        Self {
            sender: WebhookSender::new(secret),
            url,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn channel(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    async fn send(&self, user: &User, message: &NotificationMessage) -> Result<(), NotifyError> {
        let url = self.url.as_deref().ok_or_else(|| {
            NotifyError::Unsupported("webhook notifier has no gateway URL".to_string())
        })?;

        let payload = serde_json::json!({
            "user_id": user.id,
            "username": user.username,
            "title": message.title,
            "body": message.body,
            "important": message.important,
            "alert_group_ids": message.alert_group_ids,
        });

        self.sender.post(url, &payload).await
    }
}
