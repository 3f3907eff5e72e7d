//! Slack channel.

use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::{Settings, check_status};
use crate::error::{AlertError, Result};
use crate::notify::{Notification, NotificationChannel, NotificationStatus, SendError};
use crate::template::{DEFAULT_MESSAGE, DEFAULT_TITLE, Templates};

const SLACK_API_URL: &str = "https://slack.com/api/chat.postMessage";
const COLOR_FIRING: &str = "#D63232";
const COLOR_RESOLVED: &str = "#36a64f";

/// Posts notifications to Slack.
///
/// Uses an incoming webhook when `url` is set, otherwise `chat.postMessage`
/// with a bot token and an explicit recipient.
#[derive(Debug, Clone)]
pub struct SlackChannel {
    name: String,
    url: Url,
    token: Option<String>,
    recipient: Option<String>,
    username: Option<String>,
    icon_emoji: Option<String>,
    icon_url: Option<String>,
    mention_users: Vec<String>,
    mention_channel: Option<String>,
    title: Option<String>,
    text: Option<String>,
    templates: Arc<Templates>,
    client: reqwest::Client,
}

impl SlackChannel {
    pub(crate) fn from_settings(
        name: &str,
        settings: &Settings<'_>,
        templates: Arc<Templates>,
        client: reqwest::Client,
    ) -> Result<Self> {
        let token = settings.str("token").map(str::to_string);
        let recipient = settings.str("recipient").map(str::to_string);
        let url = match (settings.str("url"), &token) {
            (Some(_), _) => settings.required_url("url")?,
            (None, Some(_)) => {
                if recipient.is_none() {
                    return Err(AlertError::config(format!(
                        "integration {name:?}: recipient must be specified when using the Slack chat API"
                    )));
                }
                Url::parse(SLACK_API_URL).map_err(|e| AlertError::config(e.to_string()))?
            }
            (None, None) => {
                return Err(AlertError::config(format!(
                    "integration {name:?}: token must be specified when using the Slack chat API"
                )));
            }
        };
        let mention_channel = match settings.str("mentionChannel") {
            None => None,
            Some(m @ ("here" | "channel")) => Some(m.to_string()),
            Some(other) => {
                return Err(AlertError::config(format!(
                    "integration {name:?}: invalid value for mentionChannel: {other:?}"
                )));
            }
        };

        Ok(Self {
            name: name.to_string(),
            url,
            token,
            recipient,
            username: settings.str("username").map(str::to_string),
            icon_emoji: settings.str("iconEmoji").map(str::to_string),
            icon_url: settings.str("iconUrl").map(str::to_string),
            mention_users: settings
                .str("mentionUsers")
                .map(|s| {
                    s.split(',')
                        .map(str::trim)
                        .filter(|u| !u.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            mention_channel,
            title: settings.str("title").map(str::to_string),
            text: settings.str("text").map(str::to_string),
            templates,
            client,
        })
    }

    /// True when posting through `chat.postMessage` rather than a webhook.
    #[must_use]
    pub fn uses_api(&self) -> bool {
        self.token.is_some() && self.url.as_str() == SLACK_API_URL
    }

    /// Builds the Slack message for a notification.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::Template`] if the title or text fails to render.
    pub fn message(&self, notification: &Notification) -> Result<SlackMessage> {
        let title = self
            .templates
            .render_or(self.title.as_deref(), DEFAULT_TITLE, notification)?;
        let text = self
            .templates
            .render_or(self.text.as_deref(), DEFAULT_MESSAGE, notification)?;

        let mut mentions: Vec<String> = self.mention_users.iter().map(|u| format!("<@{u}>")).collect();
        if let Some(channel) = &self.mention_channel {
            mentions.push(format!("<!{channel}|{channel}>"));
        }

        Ok(SlackMessage {
            channel: self.recipient.clone(),
            username: self.username.clone(),
            icon_emoji: self.icon_emoji.clone(),
            icon_url: self.icon_url.clone(),
            text: (!mentions.is_empty()).then(|| mentions.join(" ")),
            attachments: vec![SlackAttachment {
                title,
                title_link: notification.external_url.clone(),
                text,
                color: match notification.status {
                    NotificationStatus::Firing => COLOR_FIRING,
                    NotificationStatus::Resolved => COLOR_RESOLVED,
                }
                .to_string(),
                footer: "claw-alertmanager".to_string(),
                ts: Utc::now().timestamp(),
            }],
        })
    }
}

impl NotificationChannel for SlackChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn send<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, std::result::Result<(), SendError>> {
        Box::pin(async move {
            let message = self
                .message(notification)
                .map_err(|e| SendError::permanent(e.to_string()))?;

            let mut request = self.client.post(self.url.clone()).json(&message);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }
            let response = request
                .send()
                .await
                .map_err(|e| SendError::retryable(format!("slack request failed: {e}")))?;
            check_status(response.status())?;

            if self.uses_api() {
                let body: SlackResponse = response
                    .json()
                    .await
                    .map_err(|e| SendError::retryable(format!("invalid slack response: {e}")))?;
                if !body.ok {
                    return Err(SendError::permanent(format!(
                        "slack API error: {}",
                        body.error.unwrap_or_default()
                    )));
                }
            }
            debug!(channel = %self.name, "slack message posted");
            Ok(())
        })
    }
}

/// A Slack message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlackMessage {
    /// Target channel or user; unset for incoming webhooks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Bot display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Bot icon emoji.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_emoji: Option<String>,
    /// Bot icon URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    /// Mentions placed above the attachment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// The rendered alert group.
    pub attachments: Vec<SlackAttachment>,
}

/// A Slack message attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlackAttachment {
    /// Rendered title.
    pub title: String,
    /// Link behind the title.
    pub title_link: String,
    /// Rendered body.
    pub text: String,
    /// Sidebar color.
    pub color: String,
    /// Footer text.
    pub footer: String,
    /// Unix timestamp.
    pub ts: i64,
}

#[derive(Debug, Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}
