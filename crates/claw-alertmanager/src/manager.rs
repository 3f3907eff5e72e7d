//! The alert notification engine.
//!
//! [`AlertManager`] owns the long-lived state (alert store, silences,
//! notification log, marker) and the currently applied dispatch graph
//! (routing tree, dispatcher, inhibitor, integrations). Applying a new
//! configuration rebuilds only the graph; the stores survive every
//! reconfiguration.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::channels::{ChannelFactory, NotifierFactory, NotifierPlugin, available_notifiers, build_integrations};
use crate::config::{AlertManagerConfig, AlertingConfig};
use crate::dispatch::{AlertGroup, Dispatcher, DispatcherSettings};
use crate::error::Result;
use crate::inhibit::Inhibitor;
use crate::marker::{AlertMarker, AlertStatus};
use crate::nflog::NotificationLog;
use crate::notify::{Muter, PipelineSettings, ReceiverPipeline, RoutingStage};
use crate::provider::AlertStore;
use crate::route::Route;
use crate::silence::{Silence, SilenceState, SilenceStore, Silencer};
use crate::snapshot::SnapshotFile;
use crate::store::ConfigStore;
use crate::template::{Templates, persist_templates};
use crate::types::{Alert, AlertValidationError, Fingerprint, InvalidAlert, PostableAlert};

/// File name of the notification log snapshot.
pub const NOTIFICATION_LOG_FILENAME: &str = "notifications";
/// File name of the silences snapshot.
pub const SILENCES_FILENAME: &str = "silences";

/// The outcome of applying a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyOutcome {
    /// A new dispatch graph is running.
    Applied,
    /// The configuration and templates were unchanged; nothing was done.
    Unchanged,
}

/// The dispatch graph built from one configuration.
#[derive(Debug)]
struct ActiveGraph {
    config: AlertingConfig,
    hash: String,
    generation: u64,
    dispatcher: Arc<Dispatcher>,
    inhibitor: Arc<Inhibitor>,
}

impl ActiveGraph {
    async fn stop(&self) {
        self.dispatcher.stop().await;
        self.inhibitor.stop().await;
    }
}

/// Bookkeeping guarded by the reconciliation lock.
#[derive(Debug, Default)]
struct Reconciliation {
    hash: Option<String>,
    generation: u64,
}

/// The alert notification engine.
///
/// Alerts are submitted with [`AlertManager::put_alerts`]. The dispatcher of
/// the applied configuration groups them, and each flushed group goes through
/// the per-integration pipeline of its receiver.
#[derive(Debug)]
pub struct AlertManager {
    settings: AlertManagerConfig,
    alerts: Arc<AlertStore>,
    marker: Arc<AlertMarker>,
    silences: Arc<SilenceStore>,
    nflog: Arc<NotificationLog>,
    config_store: Arc<dyn ConfigStore>,
    factory: Arc<dyn NotifierFactory>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    reconcile: tokio::sync::Mutex<Reconciliation>,
    graph: RwLock<Option<Arc<ActiveGraph>>>,
}

impl AlertManager {
    /// Creates an engine with the built-in notification channels.
    ///
    /// Must be called from within a Tokio runtime: the maintenance tasks of
    /// the notification log, the silences and the alert store are spawned
    /// here. No configuration is applied yet.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AlertError::Config`] if `settings` fail
    /// [`AlertManagerConfig::validate`]. Snapshot problems are logged, not
    /// returned.
    pub fn new(settings: AlertManagerConfig, config_store: Arc<dyn ConfigStore>) -> Result<Self> {
        Self::with_factory(settings, config_store, Arc::new(ChannelFactory::default()))
    }

    /// Creates an engine whose channels are built by `factory`.
    ///
    /// # Errors
    ///
    /// See [`AlertManager::new`].
    pub fn with_factory(
        settings: AlertManagerConfig,
        config_store: Arc<dyn ConfigStore>,
        factory: Arc<dyn NotifierFactory>,
    ) -> Result<Self> {
        settings.validate()?;
        let working_dir = settings.working_dir();
        let retention = settings.retention();

        let nflog = Arc::new(open_with_snapshot(
            "nflog",
            SnapshotFile::new(working_dir.join(NOTIFICATION_LOG_FILENAME)),
            |file| NotificationLog::new(retention, file),
        )?);
        let silences = Arc::new(open_with_snapshot(
            "silences",
            SnapshotFile::new(working_dir.join(SILENCES_FILENAME)),
            |file| SilenceStore::new(retention, file),
        )?);

        let manager = Self {
            alerts: Arc::new(AlertStore::new()),
            marker: Arc::new(AlertMarker::new()),
            silences,
            nflog,
            config_store,
            factory,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            reconcile: tokio::sync::Mutex::new(Reconciliation::default()),
            graph: RwLock::new(None),
            settings,
        };
        manager.spawn_maintenance();
        info!(working_dir = %working_dir.display(), "alert manager initialized");
        Ok(manager)
    }

    fn spawn_maintenance(&self) {
        let interval = self.settings.maintenance_interval();

        let nflog = Arc::clone(&self.nflog);
        let cancel = self.cancel.clone();
        self.tracker
            .spawn(async move { nflog.run_maintenance(interval, cancel).await });

        let silences = Arc::clone(&self.silences);
        let cancel = self.cancel.clone();
        self.tracker
            .spawn(async move { silences.run_maintenance(interval, cancel).await });

        let alerts = Arc::clone(&self.alerts);
        let marker = Arc::clone(&self.marker);
        let cancel = self.cancel.clone();
        let gc_interval = self.settings.alert_gc_interval();
        let grace = self.settings.resolved_alert_retention();
        self.tracker.spawn(async move {
            alerts.run_gc(gc_interval, grace, &marker, cancel).await;
        });
    }

    /// Engine settings.
    #[must_use]
    pub const fn settings(&self) -> &AlertManagerConfig {
        &self.settings
    }

    // ============ Lifecycle ============

    /// Applies the stored configuration, then polls the store until
    /// `shutdown` resolves or the engine is stopped, and finally stops the
    /// engine.
    ///
    /// If the stored configuration cannot be applied at startup, the
    /// default configuration is applied instead.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        if let Err(e) = self.sync_and_apply_config_from_store().await {
            error!(error = %e, "failed to apply stored configuration");
            if self.graph.read().is_none() {
                match AlertingConfig::default_config() {
                    Ok(config) => {
                        if let Err(e) = self.apply_config(config).await {
                            error!(error = %e, "failed to apply default configuration");
                        }
                    }
                    Err(e) => error!(error = %e, "default configuration is invalid"),
                }
            }
        }

        let poll = self.settings.poll_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + poll, poll);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_and_apply_config_from_store().await {
                        warn!(error = %e, "failed to sync configuration from store");
                    }
                }
            }
        }
        self.stop_and_wait().await;
    }

    /// Stops every background task and waits for them to exit.
    ///
    /// Snapshots are written one last time. Later ingestion fails with
    /// [`crate::AlertError::Store`]. Safe to call more than once.
    pub async fn stop_and_wait(&self) {
        let _reconcile = self.reconcile.lock().await;
        self.cancel.cancel();
        let graph = self.graph.write().take();
        if let Some(graph) = graph {
            graph.stop().await;
        }
        self.tracker.close();
        self.tracker.wait().await;
        self.alerts.close();
        info!("alert manager stopped");
    }

    // ============ Configuration ============

    /// Loads the latest configuration from the store and applies it.
    ///
    /// The default configuration is used when the store is empty.
    ///
    /// # Errors
    ///
    /// Returns the store error, or the error of [`AlertManager::apply_config`].
    pub async fn sync_and_apply_config_from_store(&self) -> Result<ApplyOutcome> {
        let config = match self.config_store.get_latest().await? {
            Some(stored) => {
                debug!(version = stored.version, "loaded configuration from store");
                AlertingConfig::load(stored.raw.as_bytes())?
            }
            None => {
                info!("no configuration stored, using the default");
                AlertingConfig::default_config()?
            }
        };
        self.apply_config(config).await
    }

    /// Applies `config` and, if that succeeds, saves it to the store.
    ///
    /// # Errors
    ///
    /// Returns the apply error, in which case nothing is saved, or the store
    /// error.
    pub async fn save_and_apply_config(&self, config: AlertingConfig) -> Result<ApplyOutcome> {
        config.validate()?;
        let raw = serde_json::to_string(&config)?;
        let hash = config.content_hash()?;
        let outcome = self.apply_config(config).await?;
        let stored = self.config_store.save(raw, hash).await?;
        info!(version = stored.version, outcome = ?outcome, "configuration saved");
        Ok(outcome)
    }

    /// Applies `config`, replacing the running dispatch graph.
    ///
    /// Applying a configuration whose content hash matches the running one,
    /// with unchanged template files, does nothing. Any construction error
    /// leaves the previous graph running.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AlertError::Config`] or [`crate::AlertError::Template`]
    /// for an unusable configuration, and [`crate::AlertError::Persistence`]
    /// if the templates cannot be written.
    pub async fn apply_config(&self, config: AlertingConfig) -> Result<ApplyOutcome> {
        let mut reconcile = self.reconcile.lock().await;
        config.validate()?;
        let hash = config.content_hash()?;

        let (template_paths, templates_changed) =
            persist_templates(&config.template_files, &self.settings.templates_dir())?;
        if !templates_changed && reconcile.hash.as_deref() == Some(hash.as_str()) {
            debug!(hash = %hash, "configuration unchanged, skipping apply");
            return Ok(ApplyOutcome::Unchanged);
        }

        let templates = Arc::new(Templates::new(&template_paths, &self.settings.app_url)?);
        let routing = &config.alertmanager_config;

        let inhibitor = Arc::new(Inhibitor::new(
            &routing.inhibit_rules,
            Arc::clone(&self.alerts),
            Arc::clone(&self.marker),
            &self.cancel,
        ));
        let silencer = Arc::new(Silencer::new(Arc::clone(&self.silences), Arc::clone(&self.marker)));
        let muters: Vec<Arc<dyn Muter>> = vec![Arc::clone(&inhibitor) as Arc<dyn Muter>, silencer];

        let pipeline_settings = PipelineSettings::from(&self.settings);
        let pipelines = routing
            .receivers
            .iter()
            .map(|receiver| {
                let integrations = build_integrations(receiver, self.factory.as_ref(), &templates)?;
                Ok(ReceiverPipeline::new(
                    receiver.name.clone(),
                    integrations,
                    muters.clone(),
                    Arc::clone(&self.nflog),
                    pipeline_settings,
                    self.settings.app_url.clone(),
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let dispatcher = Arc::new(Dispatcher::new(
            Route::new(&routing.route),
            Arc::clone(&self.alerts),
            Arc::new(RoutingStage::new(pipelines)),
            DispatcherSettings::from(&self.settings),
            &self.cancel,
        ));

        let previous = self.graph.write().take();
        if let Some(previous) = previous {
            previous.stop().await;
            debug!(generation = previous.generation, "previous dispatch graph stopped");
        }
        inhibitor.start();
        dispatcher.start();

        reconcile.generation += 1;
        reconcile.hash = Some(hash.clone());
        info!(
            generation = reconcile.generation,
            hash = %hash,
            receivers = routing.receivers.len(),
            inhibit_rules = inhibitor.rule_count(),
            templates = template_paths.len(),
            "alerting configuration applied"
        );
        *self.graph.write() = Some(Arc::new(ActiveGraph {
            config,
            hash,
            generation: reconcile.generation,
            dispatcher,
            inhibitor,
        }));
        Ok(ApplyOutcome::Applied)
    }

    /// The applied configuration.
    #[must_use]
    pub fn current_config(&self) -> Option<AlertingConfig> {
        self.graph.read().as_ref().map(|g| g.config.clone())
    }

    /// Content hash of the applied configuration.
    #[must_use]
    pub fn config_hash(&self) -> Option<String> {
        self.graph.read().as_ref().map(|g| g.hash.clone())
    }

    /// Number of configurations applied so far; 0 before the first.
    #[must_use]
    pub fn config_generation(&self) -> u64 {
        self.graph.read().as_ref().map_or(0, |g| g.generation)
    }

    /// Metadata of every available notification channel type.
    #[must_use]
    pub fn available_notifiers(&self) -> &'static [NotifierPlugin] {
        available_notifiers()
    }

    // ============ Alerts ============

    /// Ingests a batch of alerts.
    ///
    /// Valid alerts are stored even when others in the batch are invalid.
    /// Returns the fingerprints of the stored alerts, in batch order.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AlertError::Store`] if the store rejected the batch,
    /// which takes precedence, otherwise [`crate::AlertError::Validation`]
    /// listing every invalid alert along with the accepted fingerprints.
    pub fn put_alerts(&self, batch: &[PostableAlert]) -> Result<Vec<Fingerprint>> {
        let now = Utc::now();
        let resolve_timeout = self.settings.default_resolve_timeout();

        let mut valid = Vec::with_capacity(batch.len());
        let mut failures = Vec::new();
        for (index, postable) in batch.iter().enumerate() {
            let alert = Alert::from_postable(postable, now, resolve_timeout);
            match alert.validate() {
                Ok(()) => valid.push(alert),
                Err(reason) => failures.push(InvalidAlert {
                    index,
                    alert: postable.clone(),
                    reason,
                }),
            }
        }

        let accepted: Vec<Fingerprint> = valid.iter().map(Alert::fingerprint).collect();
        self.alerts.put(valid)?;

        if failures.is_empty() {
            debug!(accepted = accepted.len(), "alerts ingested");
            return Ok(accepted);
        }
        warn!(
            accepted = accepted.len(),
            invalid = failures.len(),
            "some alerts failed validation"
        );
        Err(AlertValidationError { failures, accepted }.into())
    }

    /// Returns every stored alert, ordered by labels.
    #[must_use]
    pub fn list_alerts(&self) -> Vec<Alert> {
        let mut alerts = self.alerts.list();
        alerts.sort_by(|a, b| a.labels.cmp(&b.labels));
        alerts
    }

    /// Returns the stored alert with `fingerprint`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AlertError::AlertNotFound`] if it is not stored.
    pub fn get_alert(&self, fingerprint: Fingerprint) -> Result<Alert> {
        self.alerts.get(fingerprint)
    }

    /// Returns what the alert was last muted by.
    #[must_use]
    pub fn alert_status(&self, fingerprint: Fingerprint) -> AlertStatus {
        self.marker.status(fingerprint)
    }

    /// Returns the aggregation groups of the applied configuration.
    #[must_use]
    pub fn alert_groups(&self) -> Vec<AlertGroup> {
        self.graph
            .read()
            .as_ref()
            .map(|g| g.dispatcher.groups())
            .unwrap_or_default()
    }

    // ============ Silences ============

    /// Creates a silence, or updates it when its id is set.
    ///
    /// Returns the silence id.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AlertError::InvalidSilence`] or
    /// [`crate::AlertError::SilenceNotFound`].
    pub fn create_silence(&self, silence: Silence) -> Result<String> {
        self.silences.set(silence)
    }

    /// Expires the silence with `id` now.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AlertError::SilenceNotFound`] for unknown ids and
    /// [`crate::AlertError::InvalidSilence`] if it already expired.
    pub fn expire_silence(&self, id: &str) -> Result<()> {
        self.silences.expire(id)
    }

    /// Returns the silence with `id`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AlertError::SilenceNotFound`] for unknown ids.
    pub fn get_silence(&self, id: &str) -> Result<Silence> {
        self.silences.get(id)
    }

    /// Lists silences, optionally only those in `state`.
    #[must_use]
    pub fn list_silences(&self, state: Option<SilenceState>) -> Vec<Silence> {
        self.silences.list(state, Utc::now())
    }
}

/// Opens a store from its snapshot. An unreadable snapshot is logged and the
/// store starts empty without persistence, leaving the file untouched.
fn open_with_snapshot<T>(
    component: &'static str,
    file: SnapshotFile,
    open: impl Fn(Option<SnapshotFile>) -> Result<T>,
) -> Result<T> {
    match open(Some(file.clone())) {
        Ok(store) => Ok(store),
        Err(e) => {
            warn!(
                component,
                path = %file.path().display(),
                error = %e,
                "failed to load snapshot, continuing without persistence"
            );
            open(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AlertError;
    use crate::store::MemoryConfigStore;
    use tempfile::TempDir;

    fn settings(dir: &TempDir) -> AlertManagerConfig {
        AlertManagerConfig {
            data_path: dir.path().to_path_buf(),
            ..AlertManagerConfig::default()
        }
    }

    fn manager(dir: &TempDir) -> AlertManager {
        AlertManager::new(settings(dir), Arc::new(MemoryConfigStore::new())).unwrap()
    }

    mod lifecycle_tests {
        use super::*;

        #[tokio::test]
        async fn empty_store_applies_default() {
            let dir = TempDir::new().unwrap();
            let manager = manager(&dir);
            assert_eq!(manager.config_generation(), 0);

            let outcome = manager.sync_and_apply_config_from_store().await.unwrap();
            assert_eq!(outcome, ApplyOutcome::Applied);
            assert_eq!(manager.config_generation(), 1);
            assert_eq!(
                manager.current_config().unwrap(),
                AlertingConfig::default_config().unwrap()
            );

            manager.stop_and_wait().await;
        }

        #[tokio::test]
        async fn zero_maintenance_interval_is_rejected() {
            let dir = TempDir::new().unwrap();
            let settings = AlertManagerConfig {
                maintenance_interval_secs: 0,
                ..settings(&dir)
            };

            let result = AlertManager::new(settings, Arc::new(MemoryConfigStore::new()));
            assert!(matches!(result, Err(AlertError::Config { .. })));
        }

        #[tokio::test]
        async fn run_stops_on_shutdown() {
            let dir = TempDir::new().unwrap();
            let manager = manager(&dir);
            manager.run(async {}).await;

            assert_eq!(manager.config_generation(), 0, "graph is torn down on stop");
            let err = manager.put_alerts(&[PostableAlert::new(Default::default()).label("a", "b")]);
            assert!(matches!(err, Err(AlertError::Store { .. })));
        }

        #[tokio::test]
        async fn stop_writes_snapshots() {
            let dir = TempDir::new().unwrap();
            let manager = manager(&dir);
            let now = Utc::now();
            manager
                .create_silence(
                    Silence::new(
                        crate::matchers::Matchers(vec![crate::matchers::Matcher::equal("a", "b").unwrap()]),
                        now,
                        now + chrono::Duration::hours(1),
                        "tester",
                        "",
                    )
                    .unwrap(),
                )
                .unwrap();
            manager.stop_and_wait().await;
            manager.stop_and_wait().await;

            let silences = settings(&dir).working_dir().join(SILENCES_FILENAME);
            assert!(silences.exists());
        }

        #[tokio::test]
        async fn corrupt_snapshot_is_not_fatal() {
            let dir = TempDir::new().unwrap();
            let working_dir = settings(&dir).working_dir();
            std::fs::create_dir_all(&working_dir).unwrap();
            std::fs::write(working_dir.join(SILENCES_FILENAME), b"{broken").unwrap();

            let manager = manager(&dir);
            assert!(manager.list_silences(None).is_empty());
            manager.stop_and_wait().await;
        }
    }

    mod ingestion_tests {
        use super::*;

        #[tokio::test]
        async fn returns_accepted_fingerprints() {
            let dir = TempDir::new().unwrap();
            let manager = manager(&dir);
            let batch = [
                PostableAlert::new(Default::default()).label("alertname", "A"),
                PostableAlert::new(Default::default()).label("alertname", "B"),
            ];

            let accepted = manager.put_alerts(&batch).unwrap();
            assert_eq!(accepted.len(), 2);
            assert_eq!(manager.get_alert(accepted[0]).unwrap().name(), "A");
            assert_eq!(manager.list_alerts().len(), 2);
            manager.stop_and_wait().await;
        }

        #[tokio::test]
        async fn validation_error_lists_both_outcomes() {
            let dir = TempDir::new().unwrap();
            let manager = manager(&dir);
            let batch = [
                PostableAlert::new(Default::default()).label("alertname", "A"),
                PostableAlert::new(Default::default()),
            ];

            let Err(AlertError::Validation(err)) = manager.put_alerts(&batch) else {
                panic!("expected a validation error");
            };
            assert_eq!(err.indices(), vec![1]);
            assert_eq!(err.accepted.len(), 1);
            manager.stop_and_wait().await;
        }
    }

    mod config_tests {
        use super::*;
        use crate::store::MemoryConfigStore;

        #[tokio::test]
        async fn save_then_sync_is_unchanged() {
            let dir = TempDir::new().unwrap();
            let store = Arc::new(MemoryConfigStore::new());
            let manager = AlertManager::new(settings(&dir), store.clone()).unwrap();

            let config = AlertingConfig::default_config().unwrap();
            assert_eq!(
                manager.save_and_apply_config(config).await.unwrap(),
                ApplyOutcome::Applied
            );
            assert_eq!(store.get_latest().await.unwrap().unwrap().version, 1);
            assert_eq!(
                manager.sync_and_apply_config_from_store().await.unwrap(),
                ApplyOutcome::Unchanged
            );
            assert_eq!(manager.config_generation(), 1);
            manager.stop_and_wait().await;
        }

        #[tokio::test]
        async fn invalid_config_is_not_saved() {
            let dir = TempDir::new().unwrap();
            let store = Arc::new(MemoryConfigStore::new());
            let manager = AlertManager::new(settings(&dir), store.clone()).unwrap();

            let mut config = AlertingConfig::default_config().unwrap();
            config.alertmanager_config.receivers[0].integrations[0].kind = "pager".into();
            assert!(matches!(
                manager.save_and_apply_config(config).await,
                Err(AlertError::Config { .. })
            ));
            assert!(store.get_latest().await.unwrap().is_none());
            manager.stop_and_wait().await;
        }

        #[tokio::test]
        async fn template_change_forces_apply() {
            let dir = TempDir::new().unwrap();
            let manager = manager(&dir);

            let mut config = AlertingConfig::default_config().unwrap();
            config
                .template_files
                .insert("ops.tmpl".into(), "{{receiver}}".into());
            manager.apply_config(config.clone()).await.unwrap();

            std::fs::write(settings(&dir).templates_dir().join("ops.tmpl"), "tampered").unwrap();
            assert_eq!(manager.apply_config(config).await.unwrap(), ApplyOutcome::Applied);
            assert_eq!(manager.config_generation(), 2);
            manager.stop_and_wait().await;
        }
    }

    #[test]
    fn notifiers_are_listed() {
        let kinds: Vec<&str> = available_notifiers().iter().map(|n| n.kind).collect();
        assert!(kinds.contains(&"email"));
        assert!(kinds.contains(&"webhook"));
    }
}
