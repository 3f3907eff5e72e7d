//! Notification channels for alert delivery.
//!
//! Channel types form a closed set, [`ChannelKind`]. The [`ChannelFactory`]
//! maps an integration's type tag to the matching constructor, and
//! [`available_notifiers`] describes every type for configuration UIs.

mod email;
mod log;
mod slack;
mod webhook;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

pub use email::EmailChannel;
pub use log::LogChannel;
pub use slack::{SlackAttachment, SlackChannel, SlackMessage};
pub use webhook::{WebhookChannel, WebhookPayload};

use crate::config::{IntegrationConfig, ReceiverConfig};
use crate::error::{AlertError, Result};
use crate::notify::{Integration, NotificationChannel, SendError};
use crate::template::Templates;

/// The closed set of channel types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Email (rendered and logged; no SMTP transport).
    Email,
    /// HTTP webhook.
    Webhook,
    /// Slack incoming webhook or `chat.postMessage`.
    Slack,
    /// Structured log output.
    Log,
}

impl ChannelKind {
    /// Every channel type.
    pub const ALL: [Self; 4] = [Self::Email, Self::Webhook, Self::Slack, Self::Log];

    /// Returns the type tag used in configuration.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Webhook => "webhook",
            Self::Slack => "slack",
            Self::Log => "log",
        }
    }

    /// Parses a type tag.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == tag)
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds a channel for an integration configuration.
pub trait NotifierFactory: Send + Sync + fmt::Debug {
    /// Constructs the channel described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::Config`] if the type is unknown or the settings
    /// are invalid.
    fn build(&self, config: &IntegrationConfig, templates: &Arc<Templates>) -> Result<Arc<dyn NotificationChannel>>;
}

/// The built-in factory covering every [`ChannelKind`].
#[derive(Debug, Clone, Default)]
pub struct ChannelFactory {
    client: reqwest::Client,
}

impl ChannelFactory {
    /// Creates a factory sharing one HTTP client across channels.
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl NotifierFactory for ChannelFactory {
    fn build(&self, config: &IntegrationConfig, templates: &Arc<Templates>) -> Result<Arc<dyn NotificationChannel>> {
        let kind = ChannelKind::from_tag(&config.kind).ok_or_else(|| {
            AlertError::config(format!(
                "integration {:?} has unsupported type {:?}",
                config.name, config.kind
            ))
        })?;
        let settings = config.merged_settings();
        let settings = Settings::new(&config.name, &settings);
        let templates = Arc::clone(templates);

        let channel: Arc<dyn NotificationChannel> = match kind {
            ChannelKind::Email => Arc::new(EmailChannel::from_settings(&config.name, &settings, templates)?),
            ChannelKind::Webhook => Arc::new(WebhookChannel::from_settings(
                &config.name,
                &settings,
                templates,
                self.client.clone(),
            )?),
            ChannelKind::Slack => Arc::new(SlackChannel::from_settings(
                &config.name,
                &settings,
                templates,
                self.client.clone(),
            )?),
            ChannelKind::Log => Arc::new(LogChannel::new(&config.name)),
        };
        debug!(integration = %config.name, kind = %kind, "built notification channel");
        Ok(channel)
    }
}

/// Builds the integrations of one receiver, in configuration order.
///
/// # Errors
///
/// Returns the first construction error; no partial list is returned.
pub fn build_integrations(
    receiver: &ReceiverConfig,
    factory: &dyn NotifierFactory,
    templates: &Arc<Templates>,
) -> Result<Vec<Integration>> {
    receiver
        .integrations
        .iter()
        .enumerate()
        .map(|(index, config)| {
            let channel = factory.build(config, templates).map_err(|e| {
                AlertError::config(format!("receiver {:?}: {e}", receiver.name))
            })?;
            let name = if config.name.is_empty() { &config.kind } else { &config.name };
            Ok(Integration::new(
                name.clone(),
                index,
                !config.disable_resolve_message,
                channel,
            ))
        })
        .collect()
}

/// Typed access to an integration's merged settings.
pub(crate) struct Settings<'a> {
    integration: &'a str,
    values: &'a Map<String, Value>,
}

impl<'a> Settings<'a> {
    pub(crate) const fn new(integration: &'a str, values: &'a Map<String, Value>) -> Self {
        Self {
            integration,
            values,
        }
    }

    /// A non-empty string setting.
    pub(crate) fn str(&self, key: &str) -> Option<&'a str> {
        self.values
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// A string setting that must be present.
    pub(crate) fn required_str(&self, key: &str) -> Result<&'a str> {
        self.str(key).ok_or_else(|| {
            AlertError::config(format!(
                "integration {:?}: could not find {key} in settings",
                self.integration
            ))
        })
    }

    /// A boolean setting, accepting `true` or `"true"`.
    pub(crate) fn bool(&self, key: &str) -> bool {
        match self.values.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    /// A non-negative integer setting, accepting numbers or numeric strings.
    pub(crate) fn u64(&self, key: &str) -> Result<Option<u64>> {
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n.as_u64().map(Some).ok_or_else(|| self.invalid(key)),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => s.trim().parse().map(Some).map_err(|_| self.invalid(key)),
            Some(_) => Err(self.invalid(key)),
        }
    }

    /// A URL setting that must be present and valid.
    pub(crate) fn required_url(&self, key: &str) -> Result<url::Url> {
        let raw = self.required_str(key)?;
        url::Url::parse(raw).map_err(|e| {
            AlertError::config(format!("integration {:?}: invalid {key}: {e}", self.integration))
        })
    }

    fn invalid(&self, key: &str) -> AlertError {
        AlertError::config(format!(
            "integration {:?}: {key} must be a non-negative integer",
            self.integration
        ))
    }
}

/// Maps an HTTP response status onto the retry contract.
///
/// 5xx and 429 are retryable; every other non-2xx status is permanent.
pub(crate) fn check_status(status: reqwest::StatusCode) -> std::result::Result<(), SendError> {
    if status.is_success() {
        Ok(())
    } else if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        Err(SendError::retryable(format!("unexpected status code {status}")))
    } else {
        Err(SendError::permanent(format!("unexpected status code {status}")))
    }
}

// ============================================================================
// Notifier metadata
// ============================================================================

/// The UI element used to edit an option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ElementType {
    /// Single-line input.
    Input,
    /// Drop-down.
    Select,
    /// Checkbox.
    Checkbox,
    /// Multi-line input.
    TextArea,
}

/// The input type of an [`ElementType::Input`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum InputType {
    /// Not an input element.
    None,
    /// Plain text.
    Text,
    /// Masked text.
    Password,
}

/// One choice of a select option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SelectOption {
    /// Stored value.
    pub value: &'static str,
    /// Displayed label.
    pub label: &'static str,
}

/// A configurable setting of a channel type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifierOption {
    /// Displayed label.
    pub label: &'static str,
    /// Help text.
    pub description: &'static str,
    /// Editing element.
    pub element: ElementType,
    /// Input type for inputs.
    pub input_type: InputType,
    /// Settings key.
    pub property_name: &'static str,
    /// Example value.
    pub placeholder: &'static str,
    /// Choices for selects.
    pub select_options: &'static [SelectOption],
    /// Must be set.
    pub required: bool,
    /// Stored in `secure_settings`.
    pub secure: bool,
}

impl NotifierOption {
    const fn text(label: &'static str, property_name: &'static str) -> Self {
        Self {
            label,
            description: "",
            element: ElementType::Input,
            input_type: InputType::Text,
            property_name,
            placeholder: "",
            select_options: &[],
            required: false,
            secure: false,
        }
    }

    const fn described(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    const fn placeholder(mut self, placeholder: &'static str) -> Self {
        self.placeholder = placeholder;
        self
    }

    const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    const fn secure(mut self) -> Self {
        self.secure = true;
        self
    }

    const fn element(mut self, element: ElementType) -> Self {
        self.element = element;
        if !matches!(element, ElementType::Input) {
            self.input_type = InputType::None;
        }
        self
    }

    const fn password(mut self) -> Self {
        self.input_type = InputType::Password;
        self
    }

    const fn select(mut self, options: &'static [SelectOption]) -> Self {
        self.element = ElementType::Select;
        self.input_type = InputType::None;
        self.select_options = options;
        self
    }
}

/// Description of a channel type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NotifierPlugin {
    /// Type tag.
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Display name.
    pub name: &'static str,
    /// What the channel does.
    pub description: &'static str,
    /// Settings section heading.
    pub heading: &'static str,
    /// Configurable settings.
    pub options: &'static [NotifierOption],
}

static EMAIL_OPTIONS: [NotifierOption; 4] = [
    NotifierOption::text("Single email", "singleEmail")
        .described("Send a single email to all recipients")
        .element(ElementType::Checkbox),
    NotifierOption::text("Addresses", "addresses")
        .described("You can enter multiple email addresses using a \";\" separator")
        .element(ElementType::TextArea)
        .required(),
    NotifierOption::text("Subject", "subject").placeholder("{{> default.title}}"),
    NotifierOption::text("Message", "message")
        .element(ElementType::TextArea)
        .placeholder("{{> default.message}}"),
];

static HTTP_METHODS: [SelectOption; 2] = [
    SelectOption {
        value: "POST",
        label: "POST",
    },
    SelectOption {
        value: "PUT",
        label: "PUT",
    },
];

static WEBHOOK_OPTIONS: [NotifierOption; 5] = [
    NotifierOption::text("Url", "url").required(),
    NotifierOption::text("Http Method", "httpMethod").select(&HTTP_METHODS),
    NotifierOption::text("Username", "username"),
    NotifierOption::text("Password", "password").password().secure(),
    NotifierOption::text("Max Alerts", "maxAlerts").described(
        "Max alerts to include in a notification. Remaining alerts in the same batch will be ignored above this number. 0 means no limit.",
    ),
];

static MENTION_CHANNEL: [SelectOption; 3] = [
    SelectOption {
        value: "",
        label: "Disabled",
    },
    SelectOption {
        value: "here",
        label: "Every active channel member",
    },
    SelectOption {
        value: "channel",
        label: "Every channel member",
    },
];

static SLACK_OPTIONS: [NotifierOption; 10] = [
    NotifierOption::text("Recipient", "recipient").described(
        "Specify channel or user, use #channel-name, @username or user/channel Slack ID - required unless you provide a webhook",
    ),
    NotifierOption::text("Token", "token")
        .described("Provide a Slack API token (starts with \"xoxb\") - required unless you provide a webhook")
        .secure(),
    NotifierOption::text("Username", "username").described("Set the username for the bot's message"),
    NotifierOption::text("Icon emoji", "iconEmoji")
        .described("Provide an emoji to use as the icon for the bot's message. Overrides the icon URL."),
    NotifierOption::text("Icon URL", "iconUrl")
        .described("Provide a URL to an image to use as the icon for the bot's message"),
    NotifierOption::text("Mention Users", "mentionUsers")
        .described("Mention one or more users (comma separated) when notifying in a channel, by ID"),
    NotifierOption::text("Mention Channel", "mentionChannel")
        .described("Mention whole channel or just active members when notifying")
        .select(&MENTION_CHANNEL),
    NotifierOption::text("Webhook URL", "url")
        .described("Optionally provide a Slack incoming webhook URL for sending messages, in this case the token isn't necessary")
        .placeholder("Slack incoming webhook URL")
        .secure(),
    NotifierOption::text("Title", "title")
        .described("Templated title of the slack message")
        .placeholder("{{> default.title}}"),
    NotifierOption::text("Text Body", "text")
        .described("Body of the slack message")
        .element(ElementType::TextArea)
        .placeholder("{{> default.message}}"),
];

static NOTIFIERS: [NotifierPlugin; 4] = [
    NotifierPlugin {
        kind: "email",
        name: "Email",
        description: "Renders notifications as email (no SMTP transport; logged)",
        heading: "Email settings",
        options: &EMAIL_OPTIONS,
    },
    NotifierPlugin {
        kind: "webhook",
        name: "webhook",
        description: "Sends HTTP POST request to a URL",
        heading: "Webhook settings",
        options: &WEBHOOK_OPTIONS,
    },
    NotifierPlugin {
        kind: "slack",
        name: "Slack",
        description: "Sends notifications to Slack",
        heading: "Slack settings",
        options: &SLACK_OPTIONS,
    },
    NotifierPlugin {
        kind: "log",
        name: "Log",
        description: "Writes notifications to the structured log",
        heading: "Log settings",
        options: &[],
    },
];

/// Returns the metadata of every supported channel type.
#[must_use]
pub fn available_notifiers() -> &'static [NotifierPlugin] {
    &NOTIFIERS
}
