//! Webhook channel.

use std::sync::Arc;

use futures::future::BoxFuture;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::{Settings, check_status};
use crate::error::{AlertError, Result};
use crate::notify::{Notification, NotificationChannel, SendError};
use crate::template::{DEFAULT_MESSAGE, DEFAULT_TITLE, Templates};

/// A webhook notification channel.
///
/// Sends notifications as JSON requests to a configured URL, in a format
/// compatible with Alertmanager webhook receivers.
#[derive(Debug, Clone)]
pub struct WebhookChannel {
    name: String,
    url: Url,
    method: Method,
    username: Option<String>,
    password: Option<String>,
    max_alerts: usize,
    templates: Arc<Templates>,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub(crate) fn from_settings(
        name: &str,
        settings: &Settings<'_>,
        templates: Arc<Templates>,
        client: reqwest::Client,
    ) -> Result<Self> {
        let url = settings.required_url("url")?;
        let method = match settings.str("httpMethod").unwrap_or("POST") {
            m if m.eq_ignore_ascii_case("POST") => Method::POST,
            m if m.eq_ignore_ascii_case("PUT") => Method::PUT,
            other => {
                return Err(AlertError::config(format!(
                    "integration {name:?}: unsupported HTTP method {other:?}"
                )));
            }
        };
        let max_alerts = settings
            .u64("maxAlerts")?
            .map_or(0, |n| usize::try_from(n).unwrap_or(usize::MAX));

        Ok(Self {
            name: name.to_string(),
            url,
            method,
            username: settings.str("username").map(str::to_string),
            password: settings.str("password").map(str::to_string),
            max_alerts,
            templates,
            client,
        })
    }

    /// Returns the webhook URL.
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    /// Builds the request body for a notification.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::Template`] if the title or message fails to
    /// render.
    pub fn payload(&self, notification: &Notification) -> Result<WebhookPayload> {
        let title = self.templates.render(DEFAULT_TITLE, notification)?;
        let message = self.templates.render(DEFAULT_MESSAGE, notification)?;

        let mut base = notification.clone();
        let mut truncated_alerts = 0;
        if self.max_alerts > 0 && base.alerts.len() > self.max_alerts {
            truncated_alerts = base.alerts.len() - self.max_alerts;
            base.alerts.truncate(self.max_alerts);
        }

        Ok(WebhookPayload {
            notification: base,
            version: "1".to_string(),
            truncated_alerts,
            title,
            message,
        })
    }
}

impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn send<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, std::result::Result<(), SendError>> {
        Box::pin(async move {
            let payload = self
                .payload(notification)
                .map_err(|e| SendError::permanent(e.to_string()))?;

            let mut request = self
                .client
                .request(self.method.clone(), self.url.clone())
                .json(&payload);
            if let Some(username) = &self.username {
                request = request.basic_auth(username, self.password.as_ref());
            }

            let response = request
                .send()
                .await
                .map_err(|e| SendError::retryable(format!("webhook request failed: {e}")))?;
            debug!(
                channel = %self.name,
                url = %self.url,
                status = %response.status(),
                alerts = payload.notification.alerts.len(),
                "webhook response"
            );
            check_status(response.status())
        })
    }
}

/// The payload format for webhook notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    /// The notification, with alerts possibly truncated.
    #[serde(flatten)]
    pub notification: Notification,
    /// The payload version.
    pub version: String,
    /// Number of alerts dropped because of `maxAlerts`.
    pub truncated_alerts: usize,
    /// Rendered title.
    pub title: String,
    /// Rendered message.
    pub message: String,
}
