//! Log channel.

use futures::future::BoxFuture;
use tracing::{error, info};

use crate::notify::{Notification, NotificationChannel, SendError};
use crate::types::AlertState;

/// A channel that writes each alert of a notification to the log.
#[derive(Debug, Clone)]
pub struct LogChannel {
    name: String,
}

impl LogChannel {
    /// Creates a new log channel.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for LogChannel {
    fn default() -> Self {
        Self::new("log")
    }
}

impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn send<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, std::result::Result<(), SendError>> {
        for alert in &notification.alerts {
            let name = alert.labels.get("alertname").map_or("", String::as_str);
            match alert.status {
                AlertState::Firing => {
                    error!(
                        channel = %self.name,
                        receiver = %notification.receiver,
                        alert = %name,
                        fingerprint = %alert.fingerprint,
                        labels = ?alert.labels,
                        "ALERT"
                    );
                }
                AlertState::Resolved => {
                    info!(
                        channel = %self.name,
                        receiver = %notification.receiver,
                        alert = %name,
                        fingerprint = %alert.fingerprint,
                        "RESOLVED"
                    );
                }
            }
        }
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_name() {
        assert_eq!(LogChannel::default().name(), "log");
    }

    #[tokio::test]
    async fn send_always_succeeds() {
        let notification: Notification = serde_json::from_value(serde_json::json!({
            "receiver": "ops",
            "status": "firing",
            "alerts": [{
                "status": "firing",
                "labels": {"alertname": "HighCPU"},
                "annotations": {},
                "startsAt": "2026-01-01T00:00:00Z",
                "endsAt": "2026-01-01T00:05:00Z",
                "generatorURL": "",
                "fingerprint": "00000000000000ab"
            }],
            "groupLabels": {},
            "commonLabels": {},
            "commonAnnotations": {},
            "externalURL": "",
            "groupKey": "{}:{}",
            "firingCount": 1,
            "resolvedCount": 0
        }))
        .unwrap();

        assert!(LogChannel::new("debug").send(&notification).await.is_ok());
    }
}
