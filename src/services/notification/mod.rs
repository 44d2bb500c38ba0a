//! Notifier plugin system using the Strategy pattern.
//!
//! Concrete channels (chat, SMS, voice, push) live behind the [`Notifier`]
//! trait; the engine ships an outbound-webhook notifier as the reference
//! implementation. Failures are classified into a closed set so the stepper
//! can decide retry vs. move-on without knowing the channel.

pub mod webhook;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{ChannelKind, User};

pub use webhook::{WebhookNotifier, WebhookSender};

// =============================================================================
// Delivery errors
// =============================================================================

/// Typed delivery failure. Only `Transient` goes back through the queue's
/// backoff machinery; the other classes are terminal for the step.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NotifyError {
    #[error("recipient is not verified for this channel")]
    NotVerified,

    #[error("provider quota exceeded")]
    QuotaExceeded,

    #[error("transient provider failure: {0}")]
    Transient(String),

    #[error("unsupported by provider: {0}")]
    Unsupported(String),
}

impl NotifyError {
    pub fn is_transient(&self) -> bool {
        matches!(self, NotifyError::Transient(_))
    }

    /// Stable error code recorded on failure log records
    pub fn code(&self) -> &'static str {
        match self {
            NotifyError::NotVerified => "not_verified",
            NotifyError::QuotaExceeded => "quota_exceeded",
            NotifyError::Transient(_) => "transient_failure",
            NotifyError::Unsupported(_) => "unsupported",
        }
    }
}

// =============================================================================
// Notification message
// =============================================================================

/// What a notifier delivers. For bundled deliveries `alert_group_ids` holds
/// every group merged into the single send.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationMessage {
    pub alert_group_ids: Vec<Uuid>,
    pub title: String,
    pub body: String,
    pub important: bool,
}

impl NotificationMessage {
    pub fn for_group(alert_group_id: Uuid, title: String, body: String, important: bool) -> Self {
        Self {
            alert_group_ids: vec![alert_group_id],
            title,
            body,
            important,
        }
    }
}

// =============================================================================
// Notifier trait
// =============================================================================

/// Contract for channel plugins
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Which channel this notifier serves
    fn channel(&self) -> ChannelKind;

    /// Deliver a notification to the user
    async fn send(&self, user: &User, message: &NotificationMessage) -> Result<(), NotifyError>;
}

// =============================================================================
// Registry
// =============================================================================

/// Maps channel kinds to their notifier. Channels without a registered
/// notifier fail with `Unsupported`, which the stepper treats as terminal
/// for the step.
#[derive(Default)]
pub struct NotifierRegistry {
    notifiers: HashMap<ChannelKind, Arc<dyn Notifier>>,
}

impl NotifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, notifier: Arc<dyn Notifier>) {
        self.notifiers.insert(notifier.channel(), notifier);
    }

    pub async fn send(
        &self,
        channel: ChannelKind,
        user: &User,
        message: &NotificationMessage,
    ) -> Result<(), NotifyError> {
        match self.notifiers.get(&channel) {
            Some(notifier) => notifier.send(user, message).await,
            None => Err(NotifyError::Unsupported(format!(
                "no notifier registered for channel '{}'",
                channel
            ))),
        }
    }
}
