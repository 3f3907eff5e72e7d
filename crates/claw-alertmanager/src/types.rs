//! Core types for the alerting system.
//!
//! This module provides the fundamental types used throughout the crate:
//! - [`LabelSet`]: The identity-bearing label map of an alert
//! - [`Fingerprint`]: A stable hash of a label set
//! - [`PostableAlert`]: An alert as submitted by a client
//! - [`Alert`]: A validated alert as held by the alert store
//! - [`AlertValidationError`]: The per-alert outcome of a rejected batch

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A sorted map of label names to label values.
pub type LabelSet = BTreeMap<String, String>;

/// The label that conventionally carries an alert's name.
pub const ALERT_NAME_LABEL: &str = "alertname";

/// A stable 64-bit identity derived from a label set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    /// Computes the fingerprint of a label set.
    ///
    /// The result only depends on the label pairs, never on insertion order.
    #[must_use]
    pub fn from_labels(labels: &LabelSet) -> Self {
        let mut hasher = blake3::Hasher::new();
        for (name, value) in labels {
            hasher.update(name.as_bytes());
            hasher.update(&[0xff]);
            hasher.update(value.as_bytes());
            hasher.update(&[0xff]);
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&hasher.finalize().as_bytes()[..8]);
        Self(u64::from_le_bytes(bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Whether an alert is firing or resolved at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    /// The alert is actively firing.
    Firing,
    /// The alert's end time has passed.
    Resolved,
}

impl AlertState {
    /// Returns the state as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Firing => "firing",
            Self::Resolved => "resolved",
        }
    }
}

impl fmt::Display for AlertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An alert as submitted by a client, before defaults and validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PostableAlert {
    /// Identifying labels; empty values are dropped on ingestion.
    pub labels: LabelSet,
    /// Informational annotations; empty values are dropped on ingestion.
    pub annotations: LabelSet,
    /// When the alert started firing.
    pub starts_at: Option<DateTime<Utc>>,
    /// When the alert ends; unset means "resolve after the resolve timeout".
    pub ends_at: Option<DateTime<Utc>>,
    /// Link back to the entity that generated the alert.
    #[serde(rename = "generatorURL")]
    pub generator_url: String,
}

impl PostableAlert {
    /// Creates a postable alert carrying only labels.
    #[must_use]
    pub fn new(labels: LabelSet) -> Self {
        Self {
            labels,
            ..Self::default()
        }
    }

    /// Adds a label.
    #[must_use]
    pub fn label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }

    /// Adds an annotation.
    #[must_use]
    pub fn annotation(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(name.into(), value.into());
        self
    }

    /// Sets the start time.
    #[must_use]
    pub const fn starts_at(mut self, at: DateTime<Utc>) -> Self {
        self.starts_at = Some(at);
        self
    }

    /// Sets the end time.
    #[must_use]
    pub const fn ends_at(mut self, at: DateTime<Utc>) -> Self {
        self.ends_at = Some(at);
        self
    }
}

/// A structural problem with a single alert.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// No label pair survived empty-value filtering.
    #[error("at least one label pair required")]
    MissingLabels,
    /// A label name is not a valid identifier.
    #[error("invalid label name {0:?}")]
    InvalidLabelName(String),
    /// An annotation name is not a valid identifier.
    #[error("invalid annotation name {0:?}")]
    InvalidAnnotationName(String),
    /// The alert ends before it starts.
    #[error("start time must be before end time")]
    EndBeforeStart,
}

/// A validated alert held by the alert store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// Identifying labels.
    pub labels: LabelSet,
    /// Informational annotations.
    pub annotations: LabelSet,
    /// When the alert started firing.
    pub starts_at: DateTime<Utc>,
    /// When the alert ends (or ended).
    pub ends_at: DateTime<Utc>,
    /// Link back to the entity that generated the alert.
    #[serde(rename = "generatorURL")]
    pub generator_url: String,
    /// True when `ends_at` was derived from the resolve timeout.
    pub timeout: bool,
    /// When the alert was last ingested.
    pub updated_at: DateTime<Utc>,
}

impl Alert {
    /// Builds an alert from client input, applying the ingestion defaults.
    ///
    /// Empty-valued labels and annotations are dropped. A missing start time
    /// becomes the end time, or `now` when both are missing. A missing end
    /// time becomes `max(starts_at, now) + resolve_timeout` and marks the
    /// alert as timeout-resolved.
    #[must_use]
    pub fn from_postable(
        postable: &PostableAlert,
        now: DateTime<Utc>,
        resolve_timeout: Duration,
    ) -> Self {
        let non_empty = |set: &LabelSet| -> LabelSet {
            set.iter()
                .filter(|(_, v)| !v.is_empty())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        let starts_at = postable.starts_at.or(postable.ends_at).unwrap_or(now);
        let (ends_at, timeout) = match postable.ends_at {
            Some(ends_at) => (ends_at, false),
            None => (add_duration(starts_at.max(now), resolve_timeout), true),
        };

        Self {
            labels: non_empty(&postable.labels),
            annotations: non_empty(&postable.annotations),
            starts_at,
            ends_at,
            generator_url: postable.generator_url.clone(),
            timeout,
            updated_at: now,
        }
    }

    /// Returns the fingerprint of the alert's labels.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::from_labels(&self.labels)
    }

    /// Returns the value of the `alertname` label, or an empty string.
    #[must_use]
    pub fn name(&self) -> &str {
        self.labels.get(ALERT_NAME_LABEL).map_or("", String::as_str)
    }

    /// Returns true if the alert has ended at `now`.
    #[must_use]
    pub fn resolved_at(&self, now: DateTime<Utc>) -> bool {
        self.ends_at <= now
    }

    /// Returns true if the alert has ended.
    #[must_use]
    pub fn resolved(&self) -> bool {
        self.resolved_at(Utc::now())
    }

    /// Returns the state of the alert at `now`.
    #[must_use]
    pub fn state_at(&self, now: DateTime<Utc>) -> AlertState {
        if self.resolved_at(now) {
            AlertState::Resolved
        } else {
            AlertState::Firing
        }
    }

    /// Checks the structural invariants of the alert.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.labels.is_empty() {
            return Err(ValidationError::MissingLabels);
        }
        if let Some(name) = self.labels.keys().find(|k| !is_valid_label_name(k)) {
            return Err(ValidationError::InvalidLabelName(name.clone()));
        }
        if let Some(name) = self.annotations.keys().find(|k| !is_valid_label_name(k)) {
            return Err(ValidationError::InvalidAnnotationName(name.clone()));
        }
        if self.ends_at < self.starts_at {
            return Err(ValidationError::EndBeforeStart);
        }
        Ok(())
    }

    /// Merges two observations of the same alert.
    ///
    /// The more recently updated observation wins, except that the earliest
    /// start time is kept and an explicit end time is not overridden by a
    /// timeout-derived one.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        if other.updated_at < self.updated_at {
            return other.merge(self);
        }

        let now = Utc::now();
        let mut merged = other.clone();
        if self.starts_at < other.starts_at {
            merged.starts_at = self.starts_at;
        }

        if other.resolved_at(now) {
            if self.resolved_at(now) && self.ends_at > other.ends_at {
                merged.ends_at = self.ends_at;
            }
        } else if self.ends_at > other.ends_at && !self.timeout {
            merged.ends_at = self.ends_at;
        }

        merged
    }

    /// Returns true if the activity ranges of the two alerts overlap.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        (other.ends_at > self.starts_at && other.ends_at < self.ends_at)
            || (other.starts_at > self.starts_at && other.starts_at < self.ends_at)
    }
}

/// Returns true if `name` matches `[a-zA-Z_][a-zA-Z0-9_]*`.
#[must_use]
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Adds a std duration to a timestamp, saturating at the maximum.
pub(crate) fn add_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Subtracts a std duration from a timestamp, saturating at the minimum.
pub(crate) fn sub_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| at.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// One rejected alert of an ingested batch.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidAlert {
    /// Position of the alert in the submitted batch.
    pub index: usize,
    /// The alert as submitted.
    pub alert: PostableAlert,
    /// Why it was rejected.
    pub reason: ValidationError,
}

/// The outcome of a batch in which some alerts failed validation.
///
/// Valid alerts of the same batch are stored regardless; their fingerprints
/// are listed in [`accepted`](Self::accepted) so callers can tell partial
/// success from total failure.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlertValidationError {
    /// The rejected alerts, in batch order.
    pub failures: Vec<InvalidAlert>,
    /// Fingerprints of the alerts that were stored.
    pub accepted: Vec<Fingerprint>,
}

impl AlertValidationError {
    /// Returns the batch indices of the rejected alerts.
    #[must_use]
    pub fn indices(&self) -> Vec<usize> {
        self.failures.iter().map(|f| f.index).collect()
    }
}

impl fmt::Display for AlertValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for failure in &self.failures {
            if !first {
                f.write_str(";")?;
            }
            first = false;
            write!(f, "alert {}: {}", failure.index, failure.reason)?;
        }
        Ok(())
    }
}

impl std::error::Error for AlertValidationError {}
