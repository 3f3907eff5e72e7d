//! Alert routing, grouping, silencing and notification delivery for Clawbernetes.
//!
//! `claw-alertmanager` is an Alertmanager-style notification engine. It
//! accepts firing and resolved alerts, groups them along a routing tree,
//! suppresses silenced and inhibited alerts, and delivers de-duplicated
//! notifications to receiver integrations with retry.
//!
//! # Features
//!
//! - **Routing tree**: label-matcher routes with inheritance and `continue`
//! - **Grouping**: `group_wait`, `group_interval` and `repeat_interval` timers
//!   per aggregation group
//! - **Silences and inhibition**: muting re-evaluated on every delivery
//! - **Dedup**: a persisted notification log per receiver integration
//! - **Channels**: email, webhook, Slack and log, with handlebars templates
//! - **Hot reconfiguration**: the dispatch graph is swapped atomically while
//!   alerts, silences and the notification log are kept
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use claw_alertmanager::{AlertManager, AlertManagerConfig, MemoryConfigStore, PostableAlert};
//!
//! # async fn example() -> claw_alertmanager::Result<()> {
//! let manager = AlertManager::new(
//!     AlertManagerConfig::default(),
//!     Arc::new(MemoryConfigStore::new()),
//! )?;
//!
//! // Applies the stored configuration, or the default one.
//! manager.sync_and_apply_config_from_store().await?;
//!
//! let alert = PostableAlert::default()
//!     .label("alertname", "HighCPU")
//!     .label("node", "node-1")
//!     .annotation("summary", "CPU usage is above 90%");
//! manager.put_alerts(&[alert])?;
//!
//! manager.stop_and_wait().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! The routing document is JSON. Durations use humantime notation:
//!
//! ```rust
//! use claw_alertmanager::AlertingConfig;
//!
//! let config = AlertingConfig::load(br#"{
//!     "alertmanager_config": {
//!         "route": {
//!             "receiver": "ops",
//!             "group_by": ["alertname"],
//!             "group_wait": "10s",
//!             "routes": [{
//!                 "receiver": "db",
//!                 "matchers": [["team", "=", "db"]]
//!             }]
//!         },
//!         "receivers": [
//!             {"name": "ops", "integrations": [{"name": "log", "type": "log"}]},
//!             {"name": "db", "integrations": [{"name": "log", "type": "log"}]}
//!         ]
//!     }
//! }"#).unwrap();
//! assert_eq!(config.alertmanager_config.receivers.len(), 2);
//! ```

#![forbid(unsafe_code)]
#![doc(html_root_url = "https://docs.rs/claw-alertmanager/0.1.0")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod channels;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod inhibit;
pub mod manager;
pub mod marker;
pub mod matchers;
pub mod nflog;
pub mod notify;
pub mod provider;
pub mod route;
pub mod silence;
pub mod snapshot;
pub mod store;
pub mod template;
pub mod types;

// Re-export main types at crate root
pub use channels::{
    ChannelFactory, ChannelKind, EmailChannel, LogChannel, NotifierFactory, NotifierPlugin,
    SlackChannel, WebhookChannel, available_notifiers,
};
pub use config::{
    AlertManagerConfig, AlertingConfig, InhibitRule, IntegrationConfig, ReceiverConfig,
    RouteConfig, RoutingConfig,
};
pub use dispatch::{AlertGroup, Dispatcher, DispatcherSettings};
pub use error::{AlertError, Result};
pub use inhibit::Inhibitor;
pub use manager::{AlertManager, ApplyOutcome};
pub use marker::{AlertMarker, AlertStatus, MarkerState};
pub use matchers::{MatchType, Matcher, Matchers};
pub use nflog::{LogEntry, NotificationLog, ReceiverKey};
pub use notify::{
    Integration, Notification, NotificationAlert, NotificationChannel, NotificationStatus,
    SendError,
};
pub use provider::AlertStore;
pub use route::{Route, RouteOpts};
pub use silence::{Silence, SilenceState, SilenceStore};
pub use store::{ConfigStore, FileConfigStore, MemoryConfigStore, StoredConfig};
pub use template::Templates;
pub use types::{
    Alert, AlertState, AlertValidationError, Fingerprint, InvalidAlert, LabelSet, PostableAlert,
    ValidationError,
};
