//! Commit notifications
//!
//! Fired after every successful signed commit. Delivery is best effort: the
//! gate logs a failed notification and still reports success.

use crate::audit::AuditAction;
use crate::types::{EventId, SampleId, SampleStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Payload of a commit notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Sample concerned
    pub sample_id: SampleId,
    /// Audit event of the commit
    pub event_id: EventId,
    /// Committed action
    pub action: AuditAction,
    /// Sample status after the commit
    pub status: SampleStatus,
    /// A certificate of analysis may be issued
    pub certificate_eligible: bool,
    /// Analyses written by the commit
    pub committed_analyses: usize,
}

/// Notification delivery failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    /// Receiver rejected or dropped the notification
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Receives commit notifications
pub trait Notifier: Send + Sync {
    /// Deliver one notification
    ///
    /// # Errors
    /// [`NotifyError`] on delivery failure; never rolls back the commit.
    fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Discards every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _notification: &Notification) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Fans notifications out over a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    /// Channel buffering up to `capacity` notifications per receiver
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// New receiver; sees notifications sent after this call
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Notifier for BroadcastNotifier {
    fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        match self.tx.send(notification.clone()) {
            Ok(receivers) => {
                tracing::debug!(receivers, sample = %notification.sample_id, "notification sent");
                Ok(())
            }
            // no subscribers is not a failure
            Err(_) => {
                tracing::debug!(sample = %notification.sample_id, "no notification subscribers");
                Ok(())
            }
        }
    }
}
