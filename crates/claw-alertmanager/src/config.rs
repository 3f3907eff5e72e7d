//! Engine settings and the routing configuration document.
//!
//! Two kinds of configuration live here:
//! - [`AlertManagerConfig`]: process-level settings fixed at engine startup
//! - [`AlertingConfig`]: the hot-reloadable routing tree, receivers,
//!   inhibition rules and template files

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AlertError, Result};
use crate::matchers::Matchers;

/// Configuration document applied when nothing has been stored yet.
///
/// A single catch-all route delivering to one email receiver.
pub const DEFAULT_CONFIGURATION: &str = r#"{
    "alertmanager_config": {
        "route": {
            "receiver": "default-email"
        },
        "receivers": [{
            "name": "default-email",
            "integrations": [{
                "uid": "",
                "name": "email receiver",
                "type": "email",
                "settings": {
                    "addresses": "<example@email.com>"
                }
            }]
        }]
    }
}"#;

/// Group by every label instead of a subset.
pub const GROUP_BY_ALL: &str = "...";

/// Default group wait for the root route.
pub const DEFAULT_GROUP_WAIT: Duration = Duration::from_secs(30);
/// Default group interval for the root route.
pub const DEFAULT_GROUP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Default repeat interval for the root route.
pub const DEFAULT_REPEAT_INTERVAL: Duration = Duration::from_secs(4 * 60 * 60);

/// Process-level settings of the alert notification engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertManagerConfig {
    /// Root data directory; state lives in `<data_path>/alerting`.
    pub data_path: PathBuf,
    /// External URL handed to templates and payloads.
    pub app_url: String,
    /// How often `run` re-reads the configuration store (in seconds).
    pub poll_interval_secs: u64,
    /// How long notification log entries and expired silences are kept (in seconds).
    pub retention_secs: u64,
    /// How often snapshots are written and state is garbage collected (in seconds).
    pub maintenance_interval_secs: u64,
    /// Resolve timeout for alerts submitted without an end time (in seconds).
    pub default_resolve_timeout_secs: u64,
    /// How often resolved alerts are removed from the alert store (in seconds).
    pub alert_gc_interval_secs: u64,
    /// Grace period a resolved alert is kept before GC (in seconds).
    pub resolved_alert_retention_secs: u64,
    /// Delay before each integration starts a delivery (in milliseconds).
    pub notification_wait_ms: u64,
    /// Lower bound of the per-flush delivery deadline (in seconds).
    pub min_flush_timeout_secs: u64,
    /// First retry backoff (in milliseconds).
    pub retry_initial_backoff_ms: u64,
    /// Retry backoff ceiling (in milliseconds).
    pub retry_max_backoff_ms: u64,
    /// How often the dispatcher drops empty aggregation groups (in seconds).
    pub dispatcher_gc_interval_secs: u64,
}

impl Default for AlertManagerConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("./data"),
            app_url: "http://localhost:3000/".to_string(),
            poll_interval_secs: 60,
            retention_secs: 5 * 24 * 60 * 60,     // 5 days
            maintenance_interval_secs: 15 * 60, // 15 minutes
            default_resolve_timeout_secs: 5 * 60,
            alert_gc_interval_secs: 30 * 60,
            resolved_alert_retention_secs: 0,
            notification_wait_ms: 0,
            min_flush_timeout_secs: 10,
            retry_initial_backoff_ms: 500,
            retry_max_backoff_ms: 60_000,
            dispatcher_gc_interval_secs: 30,
        }
    }
}

impl AlertManagerConfig {
    /// Rejects settings the background tasks cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::Config`] if a periodic interval or the initial
    /// retry backoff is zero, or if the backoff ceiling is below the
    /// initial backoff.
    pub fn validate(&self) -> Result<()> {
        let periods = [
            ("poll_interval_secs", self.poll_interval_secs),
            ("maintenance_interval_secs", self.maintenance_interval_secs),
            ("alert_gc_interval_secs", self.alert_gc_interval_secs),
            ("dispatcher_gc_interval_secs", self.dispatcher_gc_interval_secs),
            ("retry_initial_backoff_ms", self.retry_initial_backoff_ms),
        ];
        if let Some((field, _)) = periods.iter().find(|(_, value)| *value == 0) {
            return Err(AlertError::config(format!("{field} must be greater than zero")));
        }
        if self.retry_max_backoff_ms < self.retry_initial_backoff_ms {
            return Err(AlertError::config(
                "retry_max_backoff_ms must not be below retry_initial_backoff_ms",
            ));
        }
        Ok(())
    }

    /// The directory holding snapshots and templates.
    #[must_use]
    pub fn working_dir(&self) -> PathBuf {
        self.data_path.join("alerting")
    }

    /// The directory templates are persisted to.
    #[must_use]
    pub fn templates_dir(&self) -> PathBuf {
        self.working_dir().join("templates")
    }

    /// Poll interval as a duration.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Retention as a duration.
    #[must_use]
    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// Maintenance interval as a duration.
    #[must_use]
    pub const fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    /// Default resolve timeout as a duration.
    #[must_use]
    pub const fn default_resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.default_resolve_timeout_secs)
    }

    /// Alert GC interval as a duration.
    #[must_use]
    pub const fn alert_gc_interval(&self) -> Duration {
        Duration::from_secs(self.alert_gc_interval_secs)
    }

    /// Resolved alert GC grace as a duration.
    #[must_use]
    pub const fn resolved_alert_retention(&self) -> Duration {
        Duration::from_secs(self.resolved_alert_retention_secs)
    }

    /// Wait stage delay as a duration.
    #[must_use]
    pub const fn notification_wait(&self) -> Duration {
        Duration::from_millis(self.notification_wait_ms)
    }

    /// Minimum flush timeout as a duration.
    #[must_use]
    pub const fn min_flush_timeout(&self) -> Duration {
        Duration::from_secs(self.min_flush_timeout_secs)
    }

    /// Initial retry backoff as a duration.
    #[must_use]
    pub const fn retry_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_initial_backoff_ms)
    }

    /// Maximum retry backoff as a duration.
    #[must_use]
    pub const fn retry_max_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_max_backoff_ms)
    }

    /// Dispatcher GC interval as a duration.
    #[must_use]
    pub const fn dispatcher_gc_interval(&self) -> Duration {
        Duration::from_secs(self.dispatcher_gc_interval_secs)
    }

    /// Deadline budget of one flush: `max(group_interval, min) + wait`.
    #[must_use]
    pub fn flush_timeout(&self, group_interval: Duration) -> Duration {
        crate::dispatch::DispatcherSettings::from(self).flush_timeout(group_interval)
    }
}

/// The hot-reloadable configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertingConfig {
    /// Named template sources, persisted to the templates directory.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub template_files: BTreeMap<String, String>,
    /// Routing tree, receivers and inhibition rules.
    pub alertmanager_config: RoutingConfig,
}

impl AlertingConfig {
    /// Parses and validates a raw configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::Config`] if the document is malformed or fails
    /// validation.
    pub fn load(raw: &[u8]) -> Result<Self> {
        let config: Self = serde_json::from_slice(raw)
            .map_err(|e| AlertError::config(format!("failed to parse configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Returns the built-in default configuration.
    ///
    /// # Errors
    ///
    /// Only fails if the built-in document is broken.
    pub fn default_config() -> Result<Self> {
        Self::load(DEFAULT_CONFIGURATION.as_bytes())
    }

    /// Checks the routing tree against the receivers.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        self.alertmanager_config.validate()
    }

    /// Hex blake3 hash of the canonical serialized document.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the document cannot be encoded.
    pub fn content_hash(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }
}

/// Routing tree, receivers and inhibition rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// The root route; it matches every alert.
    pub route: RouteConfig,
    /// All receivers routes may refer to.
    #[serde(default)]
    pub receivers: Vec<ReceiverConfig>,
    /// Inhibition rules.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inhibit_rules: Vec<InhibitRule>,
}

impl RoutingConfig {
    /// Checks the routing tree against the receivers.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for receiver in &self.receivers {
            if receiver.name.is_empty() {
                return Err(AlertError::config("receiver name must not be empty"));
            }
            if !names.insert(receiver.name.as_str()) {
                return Err(AlertError::config(format!(
                    "receiver {:?} is defined more than once",
                    receiver.name
                )));
            }
            for integration in &receiver.integrations {
                if integration.kind.is_empty() {
                    return Err(AlertError::config(format!(
                        "integration {:?} of receiver {:?} has no type",
                        integration.name, receiver.name
                    )));
                }
            }
        }

        let root = &self.route;
        if root.receiver.as_deref().unwrap_or("").is_empty() {
            return Err(AlertError::config("root route must specify a receiver"));
        }
        if !root.matchers.is_empty() {
            return Err(AlertError::config("root route must not have any matchers"));
        }
        if root.continue_matching {
            return Err(AlertError::config("cannot have continue in root route"));
        }
        validate_route(root, &names)
    }
}

fn validate_route(route: &RouteConfig, receivers: &HashSet<&str>) -> Result<()> {
    if let Some(receiver) = &route.receiver {
        if !receivers.contains(receiver.as_str()) {
            return Err(AlertError::config(format!(
                "undefined receiver {receiver:?} used in route"
            )));
        }
    }
    if let Some(group_by) = &route.group_by {
        let mut seen = HashSet::new();
        for label in group_by {
            if label == GROUP_BY_ALL && group_by.len() > 1 {
                return Err(AlertError::config(
                    "cannot have wildcard group_by (`...`) and other labels at the same time",
                ));
            }
            if label != GROUP_BY_ALL && !crate::types::is_valid_label_name(label) {
                return Err(AlertError::config(format!("invalid label name {label:?} in group_by")));
            }
            if !seen.insert(label) {
                return Err(AlertError::config(format!("duplicated label {label:?} in group_by")));
            }
        }
    }
    if route.group_interval.is_some_and(|d| d.is_zero()) {
        return Err(AlertError::config("group_interval cannot be zero"));
    }
    if route.repeat_interval.is_some_and(|d| d.is_zero()) {
        return Err(AlertError::config("repeat_interval cannot be zero"));
    }
    route
        .routes
        .iter()
        .try_for_each(|child| validate_route(child, receivers))
}

/// One node of the routing tree as written in configuration.
///
/// Unset fields are inherited from the parent route.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    /// Receiver for alerts ending at this route.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    /// Labels to group by; `["..."]` groups by all labels.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_by: Option<Vec<String>>,
    /// How long to buffer a new group before its first notification.
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub group_wait: Option<Duration>,
    /// Minimum time between notifications for a changed group.
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub group_interval: Option<Duration>,
    /// Minimum time before re-sending an unchanged group.
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub repeat_interval: Option<Duration>,
    /// Label predicate selecting alerts for this route.
    #[serde(skip_serializing_if = "Matchers::is_empty")]
    pub matchers: Matchers,
    /// Keep evaluating siblings after this route matched.
    #[serde(rename = "continue", skip_serializing_if = "std::ops::Not::not")]
    pub continue_matching: bool,
    /// Child routes, evaluated in order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteConfig>,
}

/// A named set of integrations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Receiver name referenced by routes.
    pub name: String,
    /// Integrations notified for every flush, in order.
    #[serde(default, alias = "grafana_managed_receiver_configs")]
    pub integrations: Vec<IntegrationConfig>,
}

/// Configuration of a single notification integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationConfig {
    /// Stable identifier of the integration.
    #[serde(default)]
    pub uid: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Channel type tag, e.g. `"webhook"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Do not notify when alerts resolve.
    #[serde(default)]
    pub disable_resolve_message: bool,
    /// Channel-specific settings.
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
    /// Secret settings; these override `settings` on key collision.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secure_settings: BTreeMap<String, String>,
}

impl IntegrationConfig {
    /// Returns `settings` with `secure_settings` laid over it.
    #[must_use]
    pub fn merged_settings(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut merged = self.settings.clone();
        for (key, value) in &self.secure_settings {
            merged.insert(key.clone(), serde_json::Value::String(value.clone()));
        }
        merged
    }
}

/// Mutes target alerts while a matching source alert fires.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InhibitRule {
    /// Matchers selecting the inhibiting alerts.
    pub source_matchers: Matchers,
    /// Matchers selecting the inhibited alerts.
    pub target_matchers: Matchers,
    /// Labels whose values must be equal in source and target.
    pub equal: Vec<String>,
}
