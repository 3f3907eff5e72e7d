//! Silences: time-bounded matcher sets that mute alerts.
//!
//! This module provides:
//! - [`Silence`]: a single silence rule
//! - [`SilenceStore`]: the persisted set of silences
//! - [`Silencer`]: the mute stage backed by the store

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AlertError, Result};
use crate::marker::AlertMarker;
use crate::matchers::Matchers;
use crate::notify::Muter;
use crate::snapshot::{SnapshotFile, run_maintenance};
use crate::types::{Alert, LabelSet, add_duration};

/// Lifecycle state of a silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SilenceState {
    /// Starts in the future.
    Pending,
    /// Currently muting matching alerts.
    Active,
    /// Ended.
    Expired,
}

impl fmt::Display for SilenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// A silence mutes every alert matched by all of its matchers while active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Silence {
    /// Unique identifier; empty until stored.
    #[serde(default)]
    pub id: String,
    /// Matchers an alert must all satisfy.
    pub matchers: Matchers,
    /// When the silence starts.
    pub starts_at: DateTime<Utc>,
    /// When the silence ends.
    pub ends_at: DateTime<Utc>,
    /// Who created the silence.
    #[serde(default)]
    pub created_by: String,
    /// Why the silence exists.
    #[serde(default)]
    pub comment: String,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl Silence {
    /// Creates a new silence.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::InvalidSilence`] if the silence has no matchers
    /// or does not end after it starts.
    pub fn new(
        matchers: Matchers,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        created_by: impl Into<String>,
        comment: impl Into<String>,
    ) -> Result<Self> {
        let silence = Self {
            id: String::new(),
            matchers,
            starts_at,
            ends_at,
            created_by: created_by.into(),
            comment: comment.into(),
            updated_at: Utc::now(),
        };
        silence.validate()?;
        Ok(silence)
    }

    /// Checks the structural invariants of the silence.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::InvalidSilence`] describing the problem.
    pub fn validate(&self) -> Result<()> {
        if self.matchers.is_empty() {
            return Err(AlertError::InvalidSilence {
                reason: "at least one matcher required".to_string(),
            });
        }
        if self.ends_at <= self.starts_at {
            return Err(AlertError::InvalidSilence {
                reason: "end time must be after start time".to_string(),
            });
        }
        Ok(())
    }

    /// Returns the state of the silence at `now`.
    #[must_use]
    pub fn state_at(&self, now: DateTime<Utc>) -> SilenceState {
        if now < self.starts_at {
            SilenceState::Pending
        } else if now < self.ends_at {
            SilenceState::Active
        } else {
            SilenceState::Expired
        }
    }

    /// Returns true if `starts_at <= now < ends_at`.
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.state_at(now) == SilenceState::Active
    }

    /// Returns true if every matcher is satisfied by `labels`.
    #[must_use]
    pub fn matches(&self, labels: &LabelSet) -> bool {
        self.matchers.matches(labels)
    }
}

/// Persisted set of silences.
#[derive(Debug)]
pub struct SilenceStore {
    silences: RwLock<HashMap<String, Silence>>,
    retention: Duration,
    snapshot: Option<SnapshotFile>,
}

impl SilenceStore {
    /// Creates a store that keeps expired silences for `retention`.
    ///
    /// With a snapshot file, previously persisted silences are loaded; a
    /// missing snapshot starts empty.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::Persistence`] if the snapshot exists but cannot
    /// be read.
    pub fn new(retention: Duration, snapshot: Option<SnapshotFile>) -> Result<Self> {
        let silences: Vec<Silence> = match &snapshot {
            Some(file) => file.load()?,
            None => Vec::new(),
        };
        if !silences.is_empty() {
            info!(count = silences.len(), "loaded silences from snapshot");
        }
        Ok(Self {
            silences: RwLock::new(silences.into_iter().map(|s| (s.id.clone(), s)).collect()),
            retention,
            snapshot,
        })
    }

    /// Creates or updates a silence and returns its id.
    ///
    /// A silence with an empty id is created with a fresh id. A silence with
    /// an existing id replaces the stored one unless that one has expired.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::InvalidSilence`] for invalid or expired silences
    /// and [`AlertError::SilenceNotFound`] for unknown ids.
    pub fn set(&self, mut silence: Silence) -> Result<String> {
        silence.validate()?;
        let now = Utc::now();
        silence.updated_at = now;

        let mut silences = self.silences.write();
        if silence.id.is_empty() {
            silence.id = Uuid::new_v4().to_string();
        } else {
            let existing = silences
                .get(&silence.id)
                .ok_or_else(|| AlertError::SilenceNotFound {
                    id: silence.id.clone(),
                })?;
            if existing.state_at(now) == SilenceState::Expired {
                return Err(AlertError::InvalidSilence {
                    reason: format!("silence {} has already expired", silence.id),
                });
            }
        }

        let id = silence.id.clone();
        info!(
            silence_id = %id,
            matchers = %silence.matchers,
            ends_at = %silence.ends_at,
            "silence stored"
        );
        silences.insert(id.clone(), silence);
        Ok(id)
    }

    /// Expires a silence now.
    ///
    /// A pending silence collapses to an empty range so it never activates.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::SilenceNotFound`] for unknown ids and
    /// [`AlertError::InvalidSilence`] if the silence already expired.
    pub fn expire(&self, id: &str) -> Result<()> {
        let now = Utc::now();
        let mut silences = self.silences.write();
        let silence = silences
            .get_mut(id)
            .ok_or_else(|| AlertError::SilenceNotFound { id: id.to_string() })?;

        match silence.state_at(now) {
            SilenceState::Expired => {
                return Err(AlertError::InvalidSilence {
                    reason: format!("silence {id} has already expired"),
                });
            }
            SilenceState::Pending => {
                silence.starts_at = now;
                silence.ends_at = now;
            }
            SilenceState::Active => silence.ends_at = now,
        }
        silence.updated_at = now;
        info!(silence_id = %id, "silence expired");
        Ok(())
    }

    /// Returns the silence with the given id.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::SilenceNotFound`] for unknown ids.
    pub fn get(&self, id: &str) -> Result<Silence> {
        self.silences
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| AlertError::SilenceNotFound { id: id.to_string() })
    }

    /// Returns all silences, optionally restricted to one state at `now`.
    #[must_use]
    pub fn list(&self, state: Option<SilenceState>, now: DateTime<Utc>) -> Vec<Silence> {
        let mut silences: Vec<Silence> = self
            .silences
            .read()
            .values()
            .filter(|s| state.is_none_or(|st| s.state_at(now) == st))
            .cloned()
            .collect();
        silences.sort_by(|a, b| a.starts_at.cmp(&b.starts_at).then_with(|| a.id.cmp(&b.id)));
        silences
    }

    /// Returns the ids of active silences matching `labels`.
    #[must_use]
    pub fn mutes(&self, labels: &LabelSet, now: DateTime<Utc>) -> Vec<String> {
        let mut ids: Vec<String> = self
            .silences
            .read()
            .values()
            .filter(|s| s.is_active_at(now) && s.matches(labels))
            .map(|s| s.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Removes silences expired for longer than the retention.
    ///
    /// Returns the number of removed silences.
    pub fn gc(&self, now: DateTime<Utc>) -> usize {
        let mut silences = self.silences.write();
        let before = silences.len();
        silences.retain(|_, s| add_duration(s.ends_at, self.retention) > now);
        before - silences.len()
    }

    /// Writes the snapshot, if one is configured.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::Persistence`] if the snapshot cannot be written.
    pub fn snapshot(&self) -> Result<usize> {
        let Some(file) = &self.snapshot else {
            return Ok(0);
        };
        let silences: Vec<Silence> = self.silences.read().values().cloned().collect();
        file.save(&silences)
    }

    /// Garbage collects and snapshots every `interval` until `cancel` fires,
    /// then writes a final snapshot.
    pub async fn run_maintenance(&self, interval: Duration, cancel: CancellationToken) {
        run_maintenance("silences", interval, cancel, || {
            let removed = self.gc(Utc::now());
            if removed > 0 {
                debug!(removed, "garbage collected silences");
            }
            self.snapshot()
        })
        .await;
    }

    /// Number of stored silences in any state.
    #[must_use]
    pub fn len(&self) -> usize {
        self.silences.read().len()
    }

    /// Returns true if no silences are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.silences.read().is_empty()
    }
}

/// Mute stage that suppresses alerts matched by an active silence.
#[derive(Debug, Clone)]
pub struct Silencer {
    silences: Arc<SilenceStore>,
    marker: Arc<AlertMarker>,
}

impl Silencer {
    /// Creates a silencer over the store, recording outcomes in `marker`.
    #[must_use]
    pub const fn new(silences: Arc<SilenceStore>, marker: Arc<AlertMarker>) -> Self {
        Self { silences, marker }
    }
}

impl Muter for Silencer {
    fn mutes(&self, alert: &Alert) -> bool {
        let ids = self.silences.mutes(&alert.labels, Utc::now());
        let muted = !ids.is_empty();
        self.marker.set_silenced(alert.fingerprint(), ids);
        muted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    use crate::matchers::Matcher;

    fn matchers(name: &str, value: &str) -> Matchers {
        Matchers(vec![Matcher::equal(name, value).unwrap()])
    }

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn active_silence(name: &str) -> Silence {
        let now = Utc::now();
        Silence::new(
            matchers("alertname", name),
            now - ChronoDuration::minutes(1),
            now + ChronoDuration::hours(1),
            "admin",
            "maintenance",
        )
        .unwrap()
    }

    fn store() -> SilenceStore {
        SilenceStore::new(Duration::from_secs(3600), None).unwrap()
    }

    mod silence_tests {
        use super::*;

        #[test]
        fn silence_requires_matchers() {
            let now = Utc::now();
            let result = Silence::new(Matchers::default(), now, now + ChronoDuration::hours(1), "", "");
            assert!(matches!(result, Err(AlertError::InvalidSilence { .. })));
        }

        #[test]
        fn silence_requires_positive_range() {
            let now = Utc::now();
            let result = Silence::new(matchers("a", "b"), now, now, "", "");
            assert!(result.is_err());
        }

        #[test]
        fn silence_states() {
            let now = Utc::now();
            let silence = Silence::new(
                matchers("a", "b"),
                now,
                now + ChronoDuration::hours(1),
                "",
                "",
            )
            .unwrap();

            assert_eq!(silence.state_at(now - ChronoDuration::seconds(1)), SilenceState::Pending);
            assert_eq!(silence.state_at(now), SilenceState::Active);
            assert_eq!(silence.state_at(now + ChronoDuration::hours(1)), SilenceState::Expired);
        }

        #[test]
        fn silence_matching() {
            let silence = active_silence("HighCPU");
            assert!(silence.matches(&labels(&[("alertname", "HighCPU"), ("node", "n1")])));
            assert!(!silence.matches(&labels(&[("alertname", "DiskFull")])));
        }
    }

    mod store_tests {
        use super::*;

        #[test]
        fn set_assigns_id() {
            let store = store();
            let id = store.set(active_silence("HighCPU")).unwrap();
            assert!(!id.is_empty());
            assert_eq!(store.get(&id).unwrap().comment, "maintenance");
        }

        #[test]
        fn update_keeps_id() {
            let store = store();
            let id = store.set(active_silence("HighCPU")).unwrap();

            let mut updated = store.get(&id).unwrap();
            updated.comment = "extended".into();
            assert_eq!(store.set(updated).unwrap(), id);
            assert_eq!(store.get(&id).unwrap().comment, "extended");
            assert_eq!(store.len(), 1);
        }

        #[test]
        fn update_unknown_id_fails() {
            let store = store();
            let mut silence = active_silence("HighCPU");
            silence.id = "missing".into();
            assert!(matches!(store.set(silence), Err(AlertError::SilenceNotFound { .. })));
        }

        #[test]
        fn expire_active_silence() {
            let store = store();
            let id = store.set(active_silence("HighCPU")).unwrap();
            store.expire(&id).unwrap();

            let expired = store.get(&id).unwrap();
            assert_eq!(expired.state_at(Utc::now()), SilenceState::Expired);
            assert!(store.expire(&id).is_err());
        }

        #[test]
        fn expire_pending_never_activates() {
            let store = store();
            let now = Utc::now();
            let pending = Silence::new(
                matchers("alertname", "HighCPU"),
                now + ChronoDuration::hours(1),
                now + ChronoDuration::hours(2),
                "",
                "",
            )
            .unwrap();
            let id = store.set(pending).unwrap();
            store.expire(&id).unwrap();

            let silence = store.get(&id).unwrap();
            assert_eq!(silence.starts_at, silence.ends_at);
            assert!(!silence.is_active_at(silence.starts_at));
        }

        #[test]
        fn mutes_only_when_active() {
            let store = store();
            let id = store.set(active_silence("HighCPU")).unwrap();
            let alert_labels = labels(&[("alertname", "HighCPU")]);

            assert_eq!(store.mutes(&alert_labels, Utc::now()), vec![id.clone()]);
            store.expire(&id).unwrap();
            assert!(store.mutes(&alert_labels, Utc::now()).is_empty());
        }

        #[test]
        fn list_filters_by_state() {
            let store = store();
            store.set(active_silence("HighCPU")).unwrap();
            let id = store.set(active_silence("DiskFull")).unwrap();
            store.expire(&id).unwrap();

            assert_eq!(store.list(None, Utc::now()).len(), 2);
            assert_eq!(store.list(Some(SilenceState::Active), Utc::now()).len(), 1);
            assert_eq!(store.list(Some(SilenceState::Expired), Utc::now()).len(), 1);
        }

        #[test]
        fn gc_respects_retention() {
            let store = SilenceStore::new(Duration::from_secs(60), None).unwrap();
            let id = store.set(active_silence("HighCPU")).unwrap();
            store.expire(&id).unwrap();

            assert_eq!(store.gc(Utc::now()), 0);
            assert_eq!(store.gc(Utc::now() + ChronoDuration::minutes(2)), 1);
            assert!(store.is_empty());
        }

        #[test]
        fn snapshot_round_trip() {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("silences");
            let store = SilenceStore::new(Duration::from_secs(3600), Some(SnapshotFile::new(&path))).unwrap();
            let id = store.set(active_silence("HighCPU")).unwrap();
            assert!(store.snapshot().unwrap() > 0);

            let reloaded = SilenceStore::new(Duration::from_secs(3600), Some(SnapshotFile::new(&path))).unwrap();
            assert_eq!(reloaded.get(&id).unwrap(), store.get(&id).unwrap());
        }
    }

    #[test]
    fn silencer_marks_alerts() {
        let silences = Arc::new(store());
        let marker = Arc::new(AlertMarker::new());
        let silencer = Silencer::new(Arc::clone(&silences), Arc::clone(&marker));
        let id = silences.set(active_silence("HighCPU")).unwrap();

        let now = Utc::now();
        let alert = Alert {
            labels: labels(&[("alertname", "HighCPU")]),
            annotations: LabelSet::new(),
            starts_at: now,
            ends_at: now + ChronoDuration::minutes(5),
            generator_url: String::new(),
            timeout: false,
            updated_at: now,
        };

        assert!(silencer.mutes(&alert));
        assert_eq!(marker.status(alert.fingerprint()).silenced_by, vec![id.clone()]);

        silences.expire(&id).unwrap();
        assert!(!silencer.mutes(&alert));
        assert!(marker.status(alert.fingerprint()).silenced_by.is_empty());
    }
}
