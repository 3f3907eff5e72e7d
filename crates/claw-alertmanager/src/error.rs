//! Error types for the claw-alertmanager crate.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::AlertValidationError;

/// Errors that can occur in the alert notification engine.
#[derive(Debug, Error)]
pub enum AlertError {
    /// One or more alerts of an ingested batch failed validation.
    #[error("{0}")]
    Validation(#[from] AlertValidationError),

    /// The routing configuration could not be applied.
    #[error("invalid configuration: {reason}")]
    Config {
        /// The reason the configuration was rejected.
        reason: String,
    },

    /// A notification template failed to parse or render.
    #[error("template error: {reason}")]
    Template {
        /// The reason the template failed.
        reason: String,
    },

    /// Reading or writing on-disk state failed.
    #[error("persistence error for {}: {reason}", path.display())]
    Persistence {
        /// The file that could not be read or written.
        path: PathBuf,
        /// The underlying failure.
        reason: String,
    },

    /// A single integration failed to deliver a notification.
    #[error("notification failed for integration {integration}: {reason}")]
    Delivery {
        /// The integration that failed, as `receiver/name/index`.
        integration: String,
        /// The reason the delivery failed.
        reason: String,
    },

    /// The alert store refused the batch as a whole.
    #[error("alert store rejected alerts: {reason}")]
    Store {
        /// The reason the store rejected the alerts.
        reason: String,
    },

    /// Alert with the given fingerprint was not found.
    #[error("alert not found: {fingerprint}")]
    AlertNotFound {
        /// The fingerprint that was not found.
        fingerprint: String,
    },

    /// Silence not found.
    #[error("silence not found: {id}")]
    SilenceNotFound {
        /// The silence ID that was not found.
        id: String,
    },

    /// A silence definition is invalid or cannot be changed.
    #[error("invalid silence: {reason}")]
    InvalidSilence {
        /// The reason the silence is invalid.
        reason: String,
    },

    /// A label matcher could not be built.
    #[error("invalid matcher: {reason}")]
    InvalidMatcher {
        /// The reason the matcher is invalid.
        reason: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),
}

impl AlertError {
    /// Shorthand for a configuration error.
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Shorthand for a persistence error on `path`.
    pub(crate) fn persistence(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Persistence {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for AlertError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

/// Result type for alerting operations.
pub type Result<T> = std::result::Result<T, AlertError>;
