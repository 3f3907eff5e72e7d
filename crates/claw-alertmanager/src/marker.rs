//! Per-alert suppression status.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::Fingerprint;

/// The suppression state of an alert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerState {
    /// Not yet evaluated by a mute stage.
    #[default]
    Unprocessed,
    /// Neither silenced nor inhibited.
    Active,
    /// Silenced or inhibited.
    Suppressed,
}

/// What an alert was last muted by.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertStatus {
    /// Overall state.
    pub state: MarkerState,
    /// Ids of the silences muting the alert.
    pub silenced_by: Vec<String>,
    /// Fingerprints of the alerts inhibiting the alert.
    pub inhibited_by: Vec<Fingerprint>,
}

/// Records the outcome of the latest mute evaluation for each alert.
///
/// The marker is informational: mute stages always re-evaluate and never
/// consult it to decide.
#[derive(Debug, Default)]
pub struct AlertMarker {
    statuses: RwLock<HashMap<Fingerprint, AlertStatus>>,
}

impl AlertMarker {
    /// Creates an empty marker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the silences muting `fingerprint`; empty means not silenced.
    pub fn set_silenced(&self, fingerprint: Fingerprint, silence_ids: Vec<String>) {
        let mut statuses = self.statuses.write();
        let status = statuses.entry(fingerprint).or_default();
        status.silenced_by = silence_ids;
        status.state = Self::state_of(status);
    }

    /// Records the alerts inhibiting `fingerprint`; empty means not inhibited.
    pub fn set_inhibited(&self, fingerprint: Fingerprint, sources: Vec<Fingerprint>) {
        let mut statuses = self.statuses.write();
        let status = statuses.entry(fingerprint).or_default();
        status.inhibited_by = sources;
        status.state = Self::state_of(status);
    }

    fn state_of(status: &AlertStatus) -> MarkerState {
        if status.silenced_by.is_empty() && status.inhibited_by.is_empty() {
            MarkerState::Active
        } else {
            MarkerState::Suppressed
        }
    }

    /// Returns the status of `fingerprint`, `Unprocessed` if unknown.
    #[must_use]
    pub fn status(&self, fingerprint: Fingerprint) -> AlertStatus {
        self.statuses
            .read()
            .get(&fingerprint)
            .cloned()
            .unwrap_or_default()
    }

    /// Forgets `fingerprint`.
    pub fn delete(&self, fingerprint: Fingerprint) {
        self.statuses.write().remove(&fingerprint);
    }

    /// Number of tracked alerts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.statuses.read().len()
    }

    /// Returns true if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.statuses.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_is_unprocessed() {
        let marker = AlertMarker::new();
        assert_eq!(marker.status(Fingerprint(1)).state, MarkerState::Unprocessed);
    }

    #[test]
    fn silenced_then_released() {
        let marker = AlertMarker::new();
        marker.set_silenced(Fingerprint(1), vec!["s1".into()]);
        assert_eq!(marker.status(Fingerprint(1)).state, MarkerState::Suppressed);

        marker.set_silenced(Fingerprint(1), vec![]);
        assert_eq!(marker.status(Fingerprint(1)).state, MarkerState::Active);
    }

    #[test]
    fn inhibition_and_silence_combine() {
        let marker = AlertMarker::new();
        marker.set_inhibited(Fingerprint(1), vec![Fingerprint(2)]);
        marker.set_silenced(Fingerprint(1), vec![]);

        let status = marker.status(Fingerprint(1));
        assert_eq!(status.state, MarkerState::Suppressed);
        assert_eq!(status.inhibited_by, vec![Fingerprint(2)]);
    }

    #[test]
    fn delete_forgets() {
        let marker = AlertMarker::new();
        marker.set_silenced(Fingerprint(1), vec![]);
        assert_eq!(marker.len(), 1);
        marker.delete(Fingerprint(1));
        assert!(marker.is_empty());
    }
}
