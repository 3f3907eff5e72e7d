//! The notification log: what was last delivered to each integration.
//!
//! Entries are keyed by [`ReceiverKey`] and remember the firing and resolved
//! alert sets of the latest successful delivery. The dedup stage consults the
//! log through [`needs_update`].

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::Result;
use crate::snapshot::{SnapshotFile, run_maintenance};
use crate::types::{Fingerprint, add_duration, sub_duration};

/// Identity of one integration notified for one aggregation group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReceiverKey {
    /// The aggregation group key.
    pub group_key: String,
    /// The receiver name.
    pub receiver: String,
    /// The integration name.
    pub integration: String,
    /// The integration's position within the receiver.
    pub index: usize,
}

impl fmt::Display for ReceiverKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.group_key, self.receiver, self.integration, self.index
        )
    }
}

/// The latest successful delivery for a [`ReceiverKey`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Which integration and group this entry belongs to.
    pub key: ReceiverKey,
    /// Hash of the delivered alert set.
    pub group_hash: String,
    /// True if the delivery contained no firing alerts.
    pub resolved: bool,
    /// Firing alerts at delivery time.
    pub firing_alerts: BTreeSet<Fingerprint>,
    /// Resolved alerts at delivery time.
    pub resolved_alerts: BTreeSet<Fingerprint>,
    /// When the delivery happened.
    pub timestamp: DateTime<Utc>,
    /// When the entry may be garbage collected.
    pub expires_at: DateTime<Utc>,
}

/// Hash identifying a delivered alert set.
#[must_use]
pub fn hash_alerts(firing: &BTreeSet<Fingerprint>, resolved: &BTreeSet<Fingerprint>) -> String {
    let mut hasher = blake3::Hasher::new();
    for fp in firing {
        hasher.update(&fp.0.to_le_bytes());
    }
    hasher.update(b"|");
    for fp in resolved {
        hasher.update(&fp.0.to_le_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// Decides whether a group must be (re-)sent to an integration.
///
/// - no previous entry: only if something fires
/// - new firing alerts: always
/// - nothing fires anymore: only if something fired last time
/// - new resolved alerts, when the integration sends resolved: always
/// - otherwise: once `repeat_interval` has elapsed since the last delivery
#[must_use]
pub fn needs_update(
    entry: Option<&LogEntry>,
    firing: &BTreeSet<Fingerprint>,
    resolved: &BTreeSet<Fingerprint>,
    send_resolved: bool,
    repeat_interval: Duration,
    now: DateTime<Utc>,
) -> bool {
    let Some(entry) = entry else {
        return !firing.is_empty();
    };
    if !firing.is_subset(&entry.firing_alerts) {
        return true;
    }
    if firing.is_empty() {
        return !entry.firing_alerts.is_empty();
    }
    if send_resolved && !resolved.is_subset(&entry.resolved_alerts) {
        return true;
    }
    entry.timestamp <= sub_duration(now, repeat_interval)
}

/// Persisted log of successful deliveries.
#[derive(Debug)]
pub struct NotificationLog {
    entries: RwLock<HashMap<ReceiverKey, LogEntry>>,
    retention: Duration,
    snapshot: Option<SnapshotFile>,
}

impl NotificationLog {
    /// Creates a log whose entries expire after `retention`.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the snapshot exists but cannot be read.
    pub fn new(retention: Duration, snapshot: Option<SnapshotFile>) -> Result<Self> {
        let entries: Vec<LogEntry> = match &snapshot {
            Some(file) => file.load()?,
            None => Vec::new(),
        };
        if !entries.is_empty() {
            info!(count = entries.len(), "loaded notification log from snapshot");
        }
        Ok(Self {
            entries: RwLock::new(entries.into_iter().map(|e| (e.key.clone(), e)).collect()),
            retention,
            snapshot,
        })
    }

    /// Records a successful delivery.
    pub fn log(
        &self,
        key: ReceiverKey,
        firing: BTreeSet<Fingerprint>,
        resolved: BTreeSet<Fingerprint>,
        now: DateTime<Utc>,
    ) {
        let entry = LogEntry {
            group_hash: hash_alerts(&firing, &resolved),
            resolved: firing.is_empty(),
            key: key.clone(),
            firing_alerts: firing,
            resolved_alerts: resolved,
            timestamp: now,
            expires_at: add_duration(now, self.retention),
        };
        debug!(key = %key, hash = %entry.group_hash, "notification logged");
        self.entries.write().insert(key, entry);
    }

    /// Returns the latest entry for `key`.
    #[must_use]
    pub fn query(&self, key: &ReceiverKey) -> Option<LogEntry> {
        self.entries.read().get(key).cloned()
    }

    /// Removes entries that expired at or before `now`.
    ///
    /// Returns the number of removed entries.
    pub fn gc(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    /// Writes the snapshot, if one is configured.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the snapshot cannot be written.
    pub fn snapshot(&self) -> Result<usize> {
        let Some(file) = &self.snapshot else {
            return Ok(0);
        };
        let entries: Vec<LogEntry> = self.entries.read().values().cloned().collect();
        file.save(&entries)
    }

    /// Garbage collects and snapshots every `interval` until `cancel` fires,
    /// then writes a final snapshot.
    pub async fn run_maintenance(&self, interval: Duration, cancel: CancellationToken) {
        run_maintenance("nflog", interval, cancel, || {
            let removed = self.gc(Utc::now());
            if removed > 0 {
                debug!(removed, "garbage collected notification log entries");
            }
            self.snapshot()
        })
        .await;
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;
    use test_case::test_case;

    fn key() -> ReceiverKey {
        ReceiverKey {
            group_key: "{}:{alertname=\"HighCPU\"}".into(),
            receiver: "ops".into(),
            integration: "webhook".into(),
            index: 0,
        }
    }

    fn set(fps: &[u64]) -> BTreeSet<Fingerprint> {
        fps.iter().copied().map(Fingerprint).collect()
    }

    fn entry(firing: &[u64], resolved: &[u64], age: ChronoDuration) -> LogEntry {
        let now = Utc::now();
        LogEntry {
            key: key(),
            group_hash: hash_alerts(&set(firing), &set(resolved)),
            resolved: firing.is_empty(),
            firing_alerts: set(firing),
            resolved_alerts: set(resolved),
            timestamp: now - age,
            expires_at: now + ChronoDuration::days(5),
        }
    }

    const REPEAT: Duration = Duration::from_secs(3600);

    #[test_case(None, &[1], &[], true ; "first delivery of firing alerts")]
    #[test_case(None, &[], &[1], false ; "first delivery of only resolved alerts")]
    #[test_case(Some(entry(&[1], &[], ChronoDuration::minutes(1))), &[1], &[], false ; "unchanged within repeat")]
    #[test_case(Some(entry(&[1], &[], ChronoDuration::hours(2))), &[1], &[], true ; "unchanged after repeat")]
    #[test_case(Some(entry(&[1], &[], ChronoDuration::minutes(1))), &[1, 2], &[], true ; "new firing alert")]
    #[test_case(Some(entry(&[1, 2], &[], ChronoDuration::minutes(1))), &[1], &[], false ; "firing subset without resolved")]
    #[test_case(Some(entry(&[1, 2], &[], ChronoDuration::minutes(1))), &[1], &[2], true ; "newly resolved alert")]
    #[test_case(Some(entry(&[1], &[], ChronoDuration::minutes(1))), &[], &[1], true ; "everything resolved")]
    #[test_case(Some(entry(&[], &[1], ChronoDuration::minutes(1))), &[], &[1], false ; "resolved already sent")]
    fn dedup_decisions(previous: Option<LogEntry>, firing: &[u64], resolved: &[u64], expected: bool) {
        assert_eq!(
            needs_update(previous.as_ref(), &set(firing), &set(resolved), true, REPEAT, Utc::now()),
            expected
        );
    }

    #[test]
    fn resolved_ignored_without_send_resolved() {
        let previous = entry(&[1, 2], &[], ChronoDuration::minutes(1));
        assert!(!needs_update(
            Some(&previous),
            &set(&[1]),
            &set(&[2]),
            false,
            REPEAT,
            Utc::now()
        ));
    }

    #[test]
    fn log_and_query() {
        let log = NotificationLog::new(Duration::from_secs(60), None).unwrap();
        let now = Utc::now();
        log.log(key(), set(&[1]), set(&[2]), now);

        let stored = log.query(&key()).unwrap();
        assert_eq!(stored.firing_alerts, set(&[1]));
        assert!(!stored.resolved);
        assert_eq!(stored.expires_at, now + ChronoDuration::seconds(60));
        assert_eq!(stored.group_hash, hash_alerts(&set(&[1]), &set(&[2])));
    }

    #[test]
    fn gc_removes_expired() {
        let log = NotificationLog::new(Duration::from_secs(60), None).unwrap();
        let now = Utc::now();
        log.log(key(), set(&[1]), set(&[]), now);

        assert_eq!(log.gc(now), 0);
        assert_eq!(log.gc(now + ChronoDuration::seconds(61)), 1);
        assert!(log.is_empty());
    }

    #[test]
    fn hash_distinguishes_firing_from_resolved() {
        assert_ne!(hash_alerts(&set(&[1]), &set(&[])), hash_alerts(&set(&[]), &set(&[1])));
    }

    #[test]
    fn snapshot_survives_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notifications");
        let log = NotificationLog::new(Duration::from_secs(60), Some(SnapshotFile::new(&path))).unwrap();
        log.log(key(), set(&[1]), set(&[]), Utc::now());
        log.snapshot().unwrap();

        let reloaded = NotificationLog::new(Duration::from_secs(60), Some(SnapshotFile::new(&path))).unwrap();
        assert_eq!(reloaded.query(&key()), log.query(&key()));
    }
}
