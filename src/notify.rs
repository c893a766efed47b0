//! Notification dispatch
//!
//! The hub publishes `(kind, session_id)` events on an in-process broadcast
//! channel. Delivery transports (webhooks, push) subscribe from outside;
//! the server itself only attaches a logging subscriber.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A timer block ran to the end
    SessionCompleted,
    /// The daily counter was cleared
    CounterReset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub session_id: String,
    pub at: DateTime<Utc>,
}

/// Cheap to clone; all clones publish to the same channel
#[derive(Debug, Clone)]
pub struct Notifier {
    sender: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to current subscribers; a bus with no subscribers drops the event
    pub fn publish(&self, kind: NotificationKind, session_id: &str, at: DateTime<Utc>) {
        let _ = self.sender.send(Notification {
            kind,
            session_id: session_id.to_string(),
            at,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

/// Log every notification until the bus closes
pub fn start_log_subscriber(notifier: &Notifier) -> tokio::task::JoinHandle<()> {
    let mut rx = notifier.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(n) => {
                    tracing::info!(kind = ?n.kind, session_id = %n.session_id, at = %n.at, "Notification");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Notification subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let notifier = Notifier::new(8);
        let mut rx = notifier.subscribe();

        notifier.publish(NotificationKind::CounterReset, "acct", Utc::now());

        let n = rx.recv().await.unwrap();
        assert_eq!(n.kind, NotificationKind::CounterReset);
        assert_eq!(n.session_id, "acct");
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let notifier = Notifier::new(1);
        notifier.publish(NotificationKind::SessionCompleted, "acct", Utc::now());
    }
}
