//! The notification pipeline.
//!
//! This module provides:
//! - [`NotificationChannel`]: the contract every integration sender fulfils
//! - [`Notification`]: the rendered view of a flushed group handed to channels
//! - [`ReceiverPipeline`]: the per-receiver fan-out over integrations
//! - [`RoutingStage`]: dispatches a flushed group to its receiver's pipeline
//!
//! Each integration runs its own chain independently:
//! wait, mute, dedup, deliver with retry, record.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, join_all};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::AlertManagerConfig;
use crate::error::{AlertError, Result};
use crate::nflog::{NotificationLog, ReceiverKey, needs_update};
use crate::types::{Alert, AlertState, Fingerprint, LabelSet};

/// Smallest delay between two delivery attempts.
const MIN_BACKOFF: Duration = Duration::from_millis(1);

// ============================================================================
// Channel contract
// ============================================================================

/// A failed delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct SendError {
    /// Whether trying again may succeed.
    pub retryable: bool,
    /// What went wrong.
    pub reason: String,
}

impl SendError {
    /// A failure worth retrying, such as a timeout or a 5xx response.
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self {
            retryable: true,
            reason: reason.into(),
        }
    }

    /// A failure that will not go away by retrying.
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self {
            retryable: false,
            reason: reason.into(),
        }
    }
}

/// Trait for notification channels.
///
/// A channel receives a fully prepared [`Notification`] and reports whether
/// delivery succeeded. Retries, deadlines and dedup are handled by the
/// pipeline, never by the channel.
pub trait NotificationChannel: Send + Sync + fmt::Debug {
    /// Returns the name of this channel.
    fn name(&self) -> &str;

    /// Delivers a notification.
    fn send<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, std::result::Result<(), SendError>>;
}

/// One configured channel of a receiver.
#[derive(Debug, Clone)]
pub struct Integration {
    /// Display name of the integration, or its type tag when unnamed.
    /// Part of the notification log key.
    pub name: String,
    /// Position within the receiver.
    pub index: usize,
    /// Whether resolved alerts are delivered.
    pub send_resolved: bool,
    /// The sender.
    pub channel: Arc<dyn NotificationChannel>,
}

impl Integration {
    /// Creates an integration.
    pub fn new(
        name: impl Into<String>,
        index: usize,
        send_resolved: bool,
        channel: Arc<dyn NotificationChannel>,
    ) -> Self {
        Self {
            name: name.into(),
            index,
            send_resolved,
            channel,
        }
    }
}

// ============================================================================
// Notification payload
// ============================================================================

/// The status of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    /// At least one alert is firing.
    Firing,
    /// All alerts are resolved.
    Resolved,
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Firing => write!(f, "firing"),
            Self::Resolved => write!(f, "resolved"),
        }
    }
}

/// An alert as presented to channels and templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationAlert {
    /// State at flush time.
    pub status: AlertState,
    /// Identifying labels.
    pub labels: LabelSet,
    /// Informational annotations.
    pub annotations: LabelSet,
    /// When the alert started.
    pub starts_at: DateTime<Utc>,
    /// When the alert ended or will end.
    pub ends_at: DateTime<Utc>,
    /// Link back to the alert source.
    #[serde(rename = "generatorURL")]
    pub generator_url: String,
    /// Hex fingerprint.
    pub fingerprint: String,
}

impl NotificationAlert {
    fn from_alert(alert: &Alert, now: DateTime<Utc>) -> Self {
        Self {
            status: alert.state_at(now),
            labels: alert.labels.clone(),
            annotations: alert.annotations.clone(),
            starts_at: alert.starts_at,
            ends_at: alert.ends_at,
            generator_url: alert.generator_url.clone(),
            fingerprint: alert.fingerprint().to_string(),
        }
    }
}

/// Everything a channel needs to describe a flushed group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// The receiver being notified.
    pub receiver: String,
    /// Firing if any alert fires, otherwise resolved.
    pub status: NotificationStatus,
    /// The alerts, in group order.
    pub alerts: Vec<NotificationAlert>,
    /// The labels the group is keyed by.
    pub group_labels: LabelSet,
    /// Labels shared by every alert.
    pub common_labels: LabelSet,
    /// Annotations shared by every alert.
    pub common_annotations: LabelSet,
    /// External URL of the engine.
    #[serde(rename = "externalURL")]
    pub external_url: String,
    /// Key of the aggregation group.
    pub group_key: String,
    /// Number of firing alerts.
    pub firing_count: usize,
    /// Number of resolved alerts.
    pub resolved_count: usize,
}

impl Notification {
    /// Builds the notification for `alerts` flushed under `ctx`.
    #[must_use]
    pub fn new(ctx: &FlushContext, alerts: &[Alert], external_url: impl Into<String>) -> Self {
        let alerts: Vec<NotificationAlert> = alerts
            .iter()
            .map(|a| NotificationAlert::from_alert(a, ctx.now))
            .collect();
        let firing_count = alerts.iter().filter(|a| a.status == AlertState::Firing).count();
        let status = if firing_count > 0 {
            NotificationStatus::Firing
        } else {
            NotificationStatus::Resolved
        };
        let common_labels = common(alerts.iter().map(|a| &a.labels));
        let common_annotations = common(alerts.iter().map(|a| &a.annotations));

        Self {
            receiver: ctx.receiver.clone(),
            status,
            resolved_count: alerts.len() - firing_count,
            firing_count,
            alerts,
            group_labels: ctx.group_labels.clone(),
            common_labels,
            common_annotations,
            external_url: external_url.into(),
            group_key: ctx.group_key.clone(),
        }
    }
}

/// Pairs present with the same value in every set.
fn common<'a>(mut sets: impl Iterator<Item = &'a LabelSet>) -> LabelSet {
    let Some(first) = sets.next() else {
        return LabelSet::new();
    };
    let mut shared = first.clone();
    for set in sets {
        shared.retain(|k, v| set.get(k) == Some(&*v));
    }
    shared
}

// ============================================================================
// Stages
// ============================================================================

/// Per-flush parameters shared by every stage.
#[derive(Debug, Clone)]
pub struct FlushContext {
    /// Key of the aggregation group.
    pub group_key: String,
    /// Receiver of the route.
    pub receiver: String,
    /// The labels the group is keyed by.
    pub group_labels: LabelSet,
    /// Route repeat interval, used by dedup.
    pub repeat_interval: Duration,
    /// Flush time; alert state is evaluated at this instant.
    pub now: DateTime<Utc>,
    /// No delivery attempt starts or continues past this instant.
    pub deadline: Instant,
}

/// Decides whether an alert must be suppressed.
///
/// Implementations re-evaluate on every call; nothing is cached on alerts.
pub trait Muter: Send + Sync + fmt::Debug {
    /// Returns true if the alert is muted.
    fn mutes(&self, alert: &Alert) -> bool;
}

/// Executes a flushed group.
pub trait Stage: Send + Sync + fmt::Debug {
    /// Processes the alerts of one flush.
    fn exec<'a>(&'a self, ctx: &'a FlushContext, alerts: Vec<Alert>) -> BoxFuture<'a, Result<()>>;
}

/// Timing knobs of the delivery stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Delay before each integration starts.
    pub wait: Duration,
    /// First retry backoff.
    pub initial_backoff: Duration,
    /// Retry backoff ceiling.
    pub max_backoff: Duration,
}

impl From<&AlertManagerConfig> for PipelineSettings {
    fn from(config: &AlertManagerConfig) -> Self {
        Self {
            wait: config.notification_wait(),
            initial_backoff: config.retry_initial_backoff(),
            max_backoff: config.retry_max_backoff(),
        }
    }
}

/// Delivers flushed groups to every integration of one receiver.
#[derive(Debug)]
pub struct ReceiverPipeline {
    receiver: String,
    integrations: Vec<Integration>,
    muters: Vec<Arc<dyn Muter>>,
    nflog: Arc<NotificationLog>,
    settings: PipelineSettings,
    external_url: String,
}

impl ReceiverPipeline {
    /// Creates the pipeline for `receiver`.
    pub fn new(
        receiver: impl Into<String>,
        integrations: Vec<Integration>,
        muters: Vec<Arc<dyn Muter>>,
        nflog: Arc<NotificationLog>,
        settings: PipelineSettings,
        external_url: impl Into<String>,
    ) -> Self {
        Self {
            receiver: receiver.into(),
            integrations,
            muters,
            nflog,
            settings,
            external_url: external_url.into(),
        }
    }

    /// The receiver name.
    #[must_use]
    pub fn receiver(&self) -> &str {
        &self.receiver
    }

    /// The integrations, in order.
    #[must_use]
    pub fn integrations(&self) -> &[Integration] {
        &self.integrations
    }

    /// Removes muted alerts. Every muter sees every alert so each can
    /// record its verdict.
    fn unmuted(&self, alerts: &[Alert]) -> Vec<Alert> {
        alerts
            .iter()
            .filter(|alert| {
                let mut muted = false;
                for muter in &self.muters {
                    muted |= muter.mutes(alert);
                }
                !muted
            })
            .cloned()
            .collect()
    }

    async fn exec_integration(
        &self,
        ctx: &FlushContext,
        integration: &Integration,
        alerts: &[Alert],
    ) -> Result<()> {
        let label = format!("{}/{}/{}", self.receiver, integration.name, integration.index);
        let delivery_error = |reason: String| AlertError::Delivery {
            integration: label.clone(),
            reason,
        };

        // Wait
        if !self.settings.wait.is_zero() {
            let until = (Instant::now() + self.settings.wait).min(ctx.deadline);
            tokio::time::sleep_until(until).await;
        }
        if Instant::now() >= ctx.deadline {
            return Err(delivery_error("flush deadline exceeded before delivery".to_string()));
        }

        // Mute
        let alerts = self.unmuted(alerts);
        if alerts.is_empty() {
            debug!(integration = %label, "all alerts muted, nothing to deliver");
            return Ok(());
        }

        // Dedup
        let (firing, resolved) = split_by_state(&alerts, ctx.now);
        let key = ReceiverKey {
            group_key: ctx.group_key.clone(),
            receiver: self.receiver.clone(),
            integration: integration.name.clone(),
            index: integration.index,
        };
        let previous = self.nflog.query(&key);
        if !needs_update(
            previous.as_ref(),
            &firing,
            &resolved,
            integration.send_resolved,
            ctx.repeat_interval,
            ctx.now,
        ) {
            debug!(integration = %label, group_key = %ctx.group_key, "already notified, skipping");
            return Ok(());
        }

        // Retry
        let sendable: Vec<Alert> = if integration.send_resolved {
            alerts
        } else {
            alerts.into_iter().filter(|a| !a.resolved_at(ctx.now)).collect()
        };
        if !sendable.is_empty() {
            let notification = Notification::new(ctx, &sendable, self.external_url.clone());
            self.deliver(ctx, integration, &notification)
                .await
                .map_err(delivery_error)?;
            info!(
                integration = %label,
                group_key = %ctx.group_key,
                alerts = sendable.len(),
                status = %notification.status,
                "notification delivered"
            );
        }

        // Record
        self.nflog.log(key, firing, resolved, ctx.now);
        Ok(())
    }

    /// Sends with exponential backoff until success, a permanent failure or
    /// the flush deadline.
    async fn deliver(
        &self,
        ctx: &FlushContext,
        integration: &Integration,
        notification: &Notification,
    ) -> std::result::Result<(), String> {
        let mut backoff = self.settings.initial_backoff.max(MIN_BACKOFF);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let outcome = tokio::time::timeout_at(ctx.deadline, integration.channel.send(notification)).await;
            let err = match outcome {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(err)) if !err.retryable => {
                    return Err(format!("non-retryable error after {attempt} attempt(s): {err}"));
                }
                Ok(Err(err)) => err,
                Err(_) => {
                    return Err(format!("flush deadline exceeded after {attempt} attempt(s)"));
                }
            };

            let retry_at = Instant::now() + backoff;
            if retry_at >= ctx.deadline {
                return Err(format!("retries exhausted after {attempt} attempt(s): {err}"));
            }
            warn!(
                channel = %integration.channel.name(),
                attempt,
                error = %err,
                backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                "notification attempt failed, retrying"
            );
            tokio::time::sleep_until(retry_at).await;
            backoff = (backoff * 2).min(self.settings.max_backoff);
        }
    }
}

fn split_by_state(alerts: &[Alert], now: DateTime<Utc>) -> (BTreeSet<Fingerprint>, BTreeSet<Fingerprint>) {
    let mut firing = BTreeSet::new();
    let mut resolved = BTreeSet::new();
    for alert in alerts {
        if alert.resolved_at(now) {
            resolved.insert(alert.fingerprint());
        } else {
            firing.insert(alert.fingerprint());
        }
    }
    (firing, resolved)
}

impl Stage for ReceiverPipeline {
    fn exec<'a>(&'a self, ctx: &'a FlushContext, alerts: Vec<Alert>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let results = join_all(
                self.integrations
                    .iter()
                    .map(|integration| self.exec_integration(ctx, integration, &alerts)),
            )
            .await;

            let mut first_error = None;
            for result in results {
                if let Err(e) = result {
                    error!(receiver = %self.receiver, group_key = %ctx.group_key, error = %e, "integration failed");
                    first_error.get_or_insert(e);
                }
            }
            first_error.map_or(Ok(()), Err)
        })
    }
}

/// Sends each flushed group to the pipeline of its receiver.
#[derive(Debug, Default)]
pub struct RoutingStage {
    pipelines: HashMap<String, ReceiverPipeline>,
}

impl RoutingStage {
    /// Creates a stage over the given receiver pipelines.
    #[must_use]
    pub fn new(pipelines: impl IntoIterator<Item = ReceiverPipeline>) -> Self {
        Self {
            pipelines: pipelines
                .into_iter()
                .map(|p| (p.receiver.clone(), p))
                .collect(),
        }
    }

    /// Returns the pipeline of `receiver`.
    #[must_use]
    pub fn pipeline(&self, receiver: &str) -> Option<&ReceiverPipeline> {
        self.pipelines.get(receiver)
    }
}

impl Stage for RoutingStage {
    fn exec<'a>(&'a self, ctx: &'a FlushContext, alerts: Vec<Alert>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let Some(pipeline) = self.pipelines.get(&ctx.receiver) else {
                return Err(AlertError::config(format!(
                    "no pipeline for receiver {:?}",
                    ctx.receiver
                )));
            };
            pipeline.exec(ctx, alerts).await
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Channels and muters shared by the crate's tests.

    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records every notification it receives.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingChannel {
        pub(crate) sent: Mutex<Vec<Notification>>,
    }

    impl RecordingChannel {
        pub(crate) fn count(&self) -> usize {
            self.sent.lock().len()
        }
    }

    impl NotificationChannel for RecordingChannel {
        fn name(&self) -> &str {
            "recording"
        }

        fn send<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, std::result::Result<(), SendError>> {
            self.sent.lock().push(notification.clone());
            Box::pin(async { Ok(()) })
        }
    }

    /// Fails the first `failures` attempts.
    #[derive(Debug)]
    pub(crate) struct FlakyChannel {
        pub(crate) failures: usize,
        pub(crate) retryable: bool,
        pub(crate) attempts: AtomicUsize,
    }

    impl FlakyChannel {
        pub(crate) fn new(failures: usize, retryable: bool) -> Self {
            Self {
                failures,
                retryable,
                attempts: AtomicUsize::new(0),
            }
        }
    }

    impl NotificationChannel for FlakyChannel {
        fn name(&self) -> &str {
            "flaky"
        }

        fn send<'a>(&'a self, _: &'a Notification) -> BoxFuture<'a, std::result::Result<(), SendError>> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            let result = if attempt < self.failures {
                Err(SendError {
                    retryable: self.retryable,
                    reason: format!("attempt {attempt} failed"),
                })
            } else {
                Ok(())
            };
            Box::pin(async move { result })
        }
    }

    /// Mutes alerts carrying `muted="true"`.
    #[derive(Debug)]
    pub(crate) struct LabelMuter;

    impl Muter for LabelMuter {
        fn mutes(&self, alert: &Alert) -> bool {
            alert.labels.get("muted").is_some_and(|v| v == "true")
        }
    }
}
