//! Email channel.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::info;

use super::Settings;
use crate::error::Result;
use crate::notify::{Notification, NotificationChannel, SendError};
use crate::template::{DEFAULT_MESSAGE, DEFAULT_TITLE, Templates};

/// Email notification channel.
///
/// Renders subject and body for every recipient and logs them. There is no
/// SMTP transport, so delivery always succeeds once rendering does.
#[derive(Debug, Clone)]
pub struct EmailChannel {
    name: String,
    addresses: Vec<String>,
    single_email: bool,
    subject: Option<String>,
    message: Option<String>,
    templates: Arc<Templates>,
}

impl EmailChannel {
    pub(crate) fn from_settings(name: &str, settings: &Settings<'_>, templates: Arc<Templates>) -> Result<Self> {
        let addresses = split_addresses(settings.required_str("addresses")?);
        Ok(Self {
            name: name.to_string(),
            addresses,
            single_email: settings.bool("singleEmail"),
            subject: settings.str("subject").map(str::to_string),
            message: settings.str("message").map(str::to_string),
            templates,
        })
    }

    /// Returns the recipient addresses.
    #[must_use]
    pub fn recipients(&self) -> &[String] {
        &self.addresses
    }

    /// Renders the subject and body of a notification.
    ///
    /// # Errors
    ///
    /// Returns a template error if either fails to render.
    pub fn render(&self, notification: &Notification) -> Result<(String, String)> {
        let subject = self
            .templates
            .render_or(self.subject.as_deref(), DEFAULT_TITLE, notification)?;
        let body = self
            .templates
            .render_or(self.message.as_deref(), DEFAULT_MESSAGE, notification)?;
        Ok((subject, body))
    }
}

/// Splits on `;`, `,` and newlines, dropping blanks.
fn split_addresses(raw: &str) -> Vec<String> {
    raw.split([';', ',', '\n'])
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect()
}

impl NotificationChannel for EmailChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn send<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, std::result::Result<(), SendError>> {
        let result = self
            .render(notification)
            .map_err(|e| SendError::permanent(e.to_string()))
            .map(|(subject, body)| {
                let batches: Vec<&[String]> = if self.single_email {
                    vec![self.addresses.as_slice()]
                } else {
                    self.addresses.chunks(1).collect()
                };
                for to in batches {
                    info!(
                        channel = %self.name,
                        to = ?to,
                        subject = %subject,
                        body_len = body.len(),
                        alerts = notification.alerts.len(),
                        status = %notification.status,
                        "would send email notification"
                    );
                }
            });
        Box::pin(async move { result })
    }
}
