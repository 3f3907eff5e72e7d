//! The dispatcher: routes alerts into aggregation groups and flushes them.
//!
//! Every alert read from the store is matched against the routing tree. For
//! each matching route the alert joins the group identified by the route and
//! the alert's grouping-label values. Each group runs as its own task:
//!
//! ```text
//! Idle -> Waiting(group_wait) -> Flushing -> Idle -> Waiting(group_interval) -> ...
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::config::AlertManagerConfig;
use crate::notify::{FlushContext, Stage};
use crate::provider::{AlertIterator, AlertStore};
use crate::route::{Route, RouteOpts};
use crate::types::{Alert, Fingerprint, LabelSet, add_duration};

/// Timing knobs of the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherSettings {
    /// Lower bound of a flush's delivery budget.
    pub min_flush_timeout: Duration,
    /// The Wait stage delay, added to every flush budget.
    pub wait: Duration,
    /// How often empty groups are collected.
    pub gc_interval: Duration,
}

impl DispatcherSettings {
    /// Delivery budget of one flush: `max(group_interval, min) + wait`.
    #[must_use]
    pub fn flush_timeout(&self, group_interval: Duration) -> Duration {
        group_interval.max(self.min_flush_timeout) + self.wait
    }
}

impl From<&AlertManagerConfig> for DispatcherSettings {
    fn from(config: &AlertManagerConfig) -> Self {
        Self {
            min_flush_timeout: config.min_flush_timeout(),
            wait: config.notification_wait(),
            gc_interval: config.dispatcher_gc_interval(),
        }
    }
}

/// A snapshot of one aggregation group.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertGroup {
    /// The group key passed to the pipeline.
    pub key: String,
    /// The receiver the group notifies.
    pub receiver: String,
    /// The grouping labels.
    pub labels: LabelSet,
    /// The alerts currently in the group, ordered by labels.
    pub alerts: Vec<Alert>,
}

type GroupId = (String, Fingerprint);

/// Routes alerts from the store into aggregation groups.
#[derive(Debug)]
pub struct Dispatcher {
    route: Route,
    alerts: Arc<AlertStore>,
    stage: Arc<dyn Stage>,
    settings: DispatcherSettings,
    groups: Mutex<HashMap<GroupId, Arc<AggregationGroup>>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
}

impl Dispatcher {
    /// Creates a dispatcher over `route`, delivering flushes to `stage`.
    ///
    /// The dispatcher stops on a child of `cancel`.
    #[must_use]
    pub fn new(
        route: Route,
        alerts: Arc<AlertStore>,
        stage: Arc<dyn Stage>,
        settings: DispatcherSettings,
        cancel: &CancellationToken,
    ) -> Self {
        Self {
            route,
            alerts,
            stage,
            settings,
            groups: Mutex::new(HashMap::new()),
            cancel: cancel.child_token(),
            tracker: TaskTracker::new(),
            started: AtomicBool::new(false),
        }
    }

    /// The routing tree.
    #[must_use]
    pub const fn route(&self) -> &Route {
        &self.route
    }

    /// Starts consuming the alert store. Calling it again has no effect.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let alerts = self.alerts.subscribe();
        self.tracker.spawn(Arc::clone(self).run(alerts));
        debug!(route = %self.route.key(), "dispatcher started");
    }

    async fn run(self: Arc<Self>, mut alerts: AlertIterator) {
        let gc_interval = self.settings.gc_interval;
        let mut gc = tokio::time::interval_at(Instant::now() + gc_interval, gc_interval);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                next = alerts.next_alert() => {
                    let Some(alert) = next else { break };
                    self.process(&alert);
                }
                _ = gc.tick() => self.collect_garbage(),
            }
        }
        info!(groups = self.groups.lock().len(), "dispatcher stopped");
    }

    fn process(&self, alert: &Alert) {
        for route in self.route.match_labels(&alert.labels) {
            let group_labels = route.group_labels(&alert.labels);
            let id = (route.id().to_string(), Fingerprint::from_labels(&group_labels));

            let mut groups = self.groups.lock();
            let group = groups.entry(id).or_insert_with(|| {
                let group = Arc::new(AggregationGroup::new(
                    route,
                    group_labels,
                    self.cancel.child_token(),
                ));
                debug!(group = %group.key, receiver = %group.opts.receiver, "aggregation group created");
                let flush_timeout = self.settings.flush_timeout(route.opts().group_interval);
                self.tracker.spawn(
                    Arc::clone(&group).run(Arc::clone(&self.stage), flush_timeout),
                );
                group
            });
            group.insert(alert.clone());
        }
    }

    /// Drops groups that hold no alerts and stops their tasks.
    fn collect_garbage(&self) {
        let mut groups = self.groups.lock();
        let before = groups.len();
        groups.retain(|_, group| {
            if group.is_empty() {
                group.cancel.cancel();
                false
            } else {
                true
            }
        });
        let removed = before - groups.len();
        if removed > 0 {
            debug!(removed, remaining = groups.len(), "collected empty aggregation groups");
        }
    }

    /// Returns a snapshot of every aggregation group, ordered by key.
    #[must_use]
    pub fn groups(&self) -> Vec<AlertGroup> {
        let mut groups: Vec<AlertGroup> = self
            .groups
            .lock()
            .values()
            .map(|group| group.snapshot())
            .collect();
        groups.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| a.receiver.cmp(&b.receiver)));
        groups
    }

    /// Stops the dispatcher and every group task, waiting for them to exit.
    ///
    /// In-flight flushes are abandoned. Safe to call more than once.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Alerts sharing a route and grouping-label values.
#[derive(Debug)]
struct AggregationGroup {
    key: String,
    labels: LabelSet,
    opts: RouteOpts,
    alerts: Mutex<HashMap<Fingerprint, Alert>>,
    has_flushed: AtomicBool,
    wake: Notify,
    cancel: CancellationToken,
}

impl AggregationGroup {
    fn new(route: &Route, labels: LabelSet, cancel: CancellationToken) -> Self {
        let key = format!("{}:{}", route.key(), display_labels(&labels));
        Self {
            key,
            labels,
            opts: route.opts().clone(),
            alerts: Mutex::new(HashMap::new()),
            has_flushed: AtomicBool::new(false),
            wake: Notify::new(),
            cancel,
        }
    }

    fn insert(&self, alert: Alert) {
        let starts_at = alert.starts_at;
        self.alerts.lock().insert(alert.fingerprint(), alert);

        // An alert older than group_wait flushes a fresh group right away.
        if !self.has_flushed.load(Ordering::Acquire)
            && add_duration(starts_at, self.opts.group_wait) < Utc::now()
        {
            self.wake.notify_one();
        }
    }

    fn is_empty(&self) -> bool {
        self.alerts.lock().is_empty()
    }

    fn sorted_alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.alerts.lock().values().cloned().collect();
        alerts.sort_by(|a, b| a.labels.cmp(&b.labels));
        alerts
    }

    fn snapshot(&self) -> AlertGroup {
        AlertGroup {
            key: self.key.clone(),
            receiver: self.opts.receiver.clone(),
            labels: self.labels.clone(),
            alerts: self.sorted_alerts(),
        }
    }

    async fn run(self: Arc<Self>, stage: Arc<dyn Stage>, flush_timeout: Duration) {
        let mut next = Instant::now() + self.opts.group_wait;
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep_until(next) => {}
                () = self.wake.notified() => {
                    if self.has_flushed.load(Ordering::Acquire) {
                        continue;
                    }
                }
            }

            self.has_flushed.store(true, Ordering::Release);
            next = Instant::now() + self.opts.group_interval;

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = self.flush(stage.as_ref(), flush_timeout) => {}
            }
        }
        debug!(group = %self.key, "aggregation group stopped");
    }

    async fn flush(&self, stage: &dyn Stage, flush_timeout: Duration) {
        let alerts = self.sorted_alerts();
        if alerts.is_empty() {
            return;
        }
        let now = Utc::now();
        let ctx = FlushContext {
            group_key: self.key.clone(),
            receiver: self.opts.receiver.clone(),
            group_labels: self.labels.clone(),
            repeat_interval: self.opts.repeat_interval,
            now,
            deadline: Instant::now() + flush_timeout,
        };
        debug!(group = %self.key, alerts = alerts.len(), "flushing aggregation group");

        match stage.exec(&ctx, alerts.clone()).await {
            Ok(()) => {
                // Resolved alerts that were not updated during the flush are done.
                let mut current = self.alerts.lock();
                for alert in alerts.iter().filter(|a| a.resolved_at(now)) {
                    let fingerprint = alert.fingerprint();
                    if current
                        .get(&fingerprint)
                        .is_some_and(|c| c.updated_at == alert.updated_at && c.ends_at == alert.ends_at)
                    {
                        current.remove(&fingerprint);
                    }
                }
            }
            Err(e) => {
                error!(group = %self.key, receiver = %self.opts.receiver, error = %e, "failed to notify aggregation group");
            }
        }
    }
}

fn display_labels(labels: &LabelSet) -> String {
    let pairs: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v:?}")).collect();
    format!("{{{}}}", pairs.join(", "))
}
