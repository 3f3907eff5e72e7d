//! Persistent storage for the alerting configuration document.
//!
//! The engine reads and writes configuration only through [`ConfigStore`].
//! Two backends are provided: [`MemoryConfigStore`] for tests and embedding,
//! and [`FileConfigStore`], which keeps the latest document as a JSON file.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::snapshot::SnapshotFile;

/// A stored configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredConfig {
    /// Monotonic version, starting at 1.
    pub version: u64,
    /// The raw configuration document.
    pub raw: String,
    /// Content hash of the document.
    pub hash: String,
    /// When the version was saved.
    pub created_at: DateTime<Utc>,
}

/// Key-value storage for configuration documents.
pub trait ConfigStore: Send + Sync + fmt::Debug {
    /// Returns the latest stored configuration, if any.
    fn get_latest(&self) -> BoxFuture<'_, Result<Option<StoredConfig>>>;

    /// Stores a new version and returns it.
    fn save<'a>(&'a self, raw: String, hash: String) -> BoxFuture<'a, Result<StoredConfig>>;
}

fn next_version(latest: Option<&StoredConfig>, raw: String, hash: String) -> StoredConfig {
    StoredConfig {
        version: latest.map_or(1, |c| c.version + 1),
        raw,
        hash,
        created_at: Utc::now(),
    }
}

/// In-memory configuration store.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    latest: RwLock<Option<StoredConfig>>,
}

impl MemoryConfigStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get_latest(&self) -> BoxFuture<'_, Result<Option<StoredConfig>>> {
        let latest = self.latest.read().clone();
        Box::pin(async move { Ok(latest) })
    }

    fn save<'a>(&'a self, raw: String, hash: String) -> BoxFuture<'a, Result<StoredConfig>> {
        let mut latest = self.latest.write();
        let stored = next_version(latest.as_ref(), raw, hash);
        *latest = Some(stored.clone());
        Box::pin(async move { Ok(stored) })
    }
}

/// Configuration store backed by a single JSON file.
#[derive(Debug)]
pub struct FileConfigStore {
    file: SnapshotFile,
    lock: tokio::sync::Mutex<()>,
}

impl FileConfigStore {
    /// Creates a store persisting to `path`. The file is created on first save.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            file: SnapshotFile::new(path.as_ref()),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

impl ConfigStore for FileConfigStore {
    fn get_latest(&self) -> BoxFuture<'_, Result<Option<StoredConfig>>> {
        Box::pin(async move {
            let _guard = self.lock.lock().await;
            self.file.load::<Option<StoredConfig>>()
        })
    }

    fn save<'a>(&'a self, raw: String, hash: String) -> BoxFuture<'a, Result<StoredConfig>> {
        Box::pin(async move {
            let _guard = self.lock.lock().await;
            let latest = self.file.load::<Option<StoredConfig>>()?;
            let stored = next_version(latest.as_ref(), raw, hash);
            let bytes = self.file.save(&Some(&stored))?;
            debug!(path = %self.file.path().display(), version = stored.version, bytes, "configuration saved");
            Ok(stored)
        })
    }
}
