//! Inhibition of alerts by other firing alerts.
//!
//! The [`Inhibitor`] follows the alert store in a background task and keeps,
//! per rule, the alerts matching the rule's source matchers. A target alert
//! is muted while a firing source agrees with it on every `equal` label.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::config::InhibitRule;
use crate::marker::AlertMarker;
use crate::matchers::Matchers;
use crate::notify::Muter;
use crate::provider::{AlertIterator, AlertStore};
use crate::types::{Alert, Fingerprint};

#[derive(Debug)]
struct InhibitionRule {
    source: Matchers,
    target: Matchers,
    equal: Vec<String>,
    sources: RwLock<HashMap<Fingerprint, Alert>>,
}

impl InhibitionRule {
    fn new(rule: &InhibitRule) -> Self {
        Self {
            source: rule.source_matchers.clone(),
            target: rule.target_matchers.clone(),
            equal: rule.equal.clone(),
            sources: RwLock::new(HashMap::new()),
        }
    }

    fn observe(&self, alert: &Alert) {
        if !self.source.matches(&alert.labels) {
            return;
        }
        let fingerprint = alert.fingerprint();
        let mut sources = self.sources.write();
        if alert.resolved() {
            sources.remove(&fingerprint);
        } else {
            sources.insert(fingerprint, alert.clone());
        }
    }

    fn equal_labels(&self, source: &Alert, target: &Alert) -> bool {
        self.equal.iter().all(|name| {
            source.labels.get(name).map_or("", String::as_str)
                == target.labels.get(name).map_or("", String::as_str)
        })
    }

    /// Finds a firing source inhibiting `target`.
    ///
    /// When the target also matches the source matchers, sources that match
    /// the target matchers are skipped so two alerts never inhibit each other.
    fn inhibiting_source(&self, target: &Alert, fingerprint: Fingerprint, now: DateTime<Utc>) -> Option<Fingerprint> {
        let two_sided = self.source.matches(&target.labels);
        self.sources
            .read()
            .iter()
            .filter(|(fp, _)| **fp != fingerprint)
            .filter(|(_, source)| !source.resolved_at(now))
            .filter(|(_, source)| !(two_sided && self.target.matches(&source.labels)))
            .find(|(_, source)| self.equal_labels(source, target))
            .map(|(fp, _)| *fp)
    }
}

/// Mute stage applying the configured inhibition rules.
#[derive(Debug)]
pub struct Inhibitor {
    rules: Arc<Vec<InhibitionRule>>,
    alerts: Arc<AlertStore>,
    marker: Arc<AlertMarker>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
}

impl Inhibitor {
    /// Creates an inhibitor; it observes nothing until [`Inhibitor::start`].
    ///
    /// `cancel` is the engine's token; the inhibitor stops on its own token,
    /// a child of it.
    #[must_use]
    pub fn new(
        rules: &[InhibitRule],
        alerts: Arc<AlertStore>,
        marker: Arc<AlertMarker>,
        cancel: &CancellationToken,
    ) -> Self {
        Self {
            rules: Arc::new(rules.iter().map(InhibitionRule::new).collect()),
            alerts,
            marker,
            cancel: cancel.child_token(),
            tracker: TaskTracker::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Number of configured rules.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Starts following the alert store. Calling it again has no effect.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let alerts = self.alerts.subscribe();
        let rules = Arc::clone(&self.rules);
        let cancel = self.cancel.clone();
        self.tracker.spawn(Self::run(rules, alerts, cancel));
        self.tracker.close();
        debug!(rules = self.rules.len(), "inhibitor started");
    }

    async fn run(rules: Arc<Vec<InhibitionRule>>, mut alerts: AlertIterator, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                next = alerts.next_alert() => {
                    let Some(alert) = next else { break };
                    for rule in rules.iter() {
                        rule.observe(&alert);
                    }
                }
            }
        }
        info!("inhibitor stopped");
    }

    /// Stops the background task and waits for it to exit.
    ///
    /// Safe to call more than once, and before [`Inhibitor::start`].
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Muter for Inhibitor {
    fn mutes(&self, alert: &Alert) -> bool {
        let fingerprint = alert.fingerprint();
        let now = Utc::now();
        for rule in self.rules.iter() {
            if !rule.target.matches(&alert.labels) {
                continue;
            }
            if let Some(source) = rule.inhibiting_source(alert, fingerprint, now) {
                self.marker.set_inhibited(fingerprint, vec![source]);
                return true;
            }
        }
        self.marker.set_inhibited(fingerprint, Vec::new());
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    use crate::marker::MarkerState;
    use crate::matchers::Matcher;
    use crate::types::LabelSet;

    fn alert(pairs: &[(&str, &str)], resolved: bool) -> Alert {
        let now = Utc::now();
        Alert {
            labels: pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect::<LabelSet>(),
            annotations: LabelSet::new(),
            starts_at: now - ChronoDuration::minutes(10),
            ends_at: if resolved {
                now - ChronoDuration::minutes(1)
            } else {
                now + ChronoDuration::minutes(5)
            },
            generator_url: String::new(),
            timeout: false,
            updated_at: now,
        }
    }

    fn severity_rule() -> InhibitRule {
        InhibitRule {
            source_matchers: Matchers(vec![Matcher::equal("severity", "critical").unwrap()]),
            target_matchers: Matchers(vec![Matcher::equal("severity", "warning").unwrap()]),
            equal: vec!["cluster".into()],
        }
    }

    fn inhibitor(rules: &[InhibitRule]) -> (Inhibitor, Arc<AlertStore>, Arc<AlertMarker>) {
        let store = Arc::new(AlertStore::new());
        let marker = Arc::new(AlertMarker::new());
        let inhibitor = Inhibitor::new(rules, Arc::clone(&store), Arc::clone(&marker), &CancellationToken::new());
        (inhibitor, store, marker)
    }

    async fn eventually_mutes(inhibitor: &Inhibitor, target: &Alert) -> bool {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !inhibitor.mutes(target) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }

    #[tokio::test]
    async fn critical_inhibits_warning_in_same_cluster() {
        let (inhibitor, store, marker) = inhibitor(&[severity_rule()]);
        inhibitor.start();

        let source = alert(&[("alertname", "NodeDown"), ("severity", "critical"), ("cluster", "a")], false);
        store.put(vec![source.clone()]).unwrap();

        let target = alert(&[("alertname", "HighLatency"), ("severity", "warning"), ("cluster", "a")], false);
        assert!(eventually_mutes(&inhibitor, &target).await);

        let status = marker.status(target.fingerprint());
        assert_eq!(status.state, MarkerState::Suppressed);
        assert_eq!(status.inhibited_by, vec![source.fingerprint()]);

        let other_cluster = alert(&[("alertname", "HighLatency"), ("severity", "warning"), ("cluster", "b")], false);
        assert!(!inhibitor.mutes(&other_cluster));

        inhibitor.stop().await;
    }

    #[tokio::test]
    async fn resolved_source_releases_target() {
        let (inhibitor, store, marker) = inhibitor(&[severity_rule()]);
        inhibitor.start();

        let labels = [("alertname", "NodeDown"), ("severity", "critical"), ("cluster", "a")];
        store.put(vec![alert(&labels, false)]).unwrap();
        let target = alert(&[("alertname", "HighLatency"), ("severity", "warning"), ("cluster", "a")], false);
        assert!(eventually_mutes(&inhibitor, &target).await);

        store.put(vec![alert(&labels, true)]).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while inhibitor.mutes(&target) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(marker.status(target.fingerprint()).state, MarkerState::Active);

        inhibitor.stop().await;
    }

    #[tokio::test]
    async fn alert_never_inhibits_itself() {
        let rule = InhibitRule {
            source_matchers: Matchers(vec![Matcher::equal("alertname", "Flapping").unwrap()]),
            target_matchers: Matchers(vec![Matcher::equal("alertname", "Flapping").unwrap()]),
            equal: Vec::new(),
        };
        let (inhibitor, store, _) = inhibitor(&[rule]);
        inhibitor.start();

        let only = alert(&[("alertname", "Flapping")], false);
        store.put(vec![only.clone()]).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!inhibitor.mutes(&only));
        inhibitor.stop().await;
    }

    #[test]
    fn equal_treats_missing_as_empty() {
        let rule = InhibitionRule::new(&severity_rule());
        let source = alert(&[("severity", "critical")], false);
        let target = alert(&[("severity", "warning")], false);
        rule.observe(&source);
        assert_eq!(
            rule.inhibiting_source(&target, target.fingerprint(), Utc::now()),
            Some(source.fingerprint())
        );
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (inhibitor, _, _) = inhibitor(&[]);
        inhibitor.stop().await;
        inhibitor.start();
        inhibitor.stop().await;
        inhibitor.stop().await;
    }
}
