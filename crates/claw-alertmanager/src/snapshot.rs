//! JSON snapshot files for persisted engine state.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AlertError, Result};

/// A single JSON file holding a snapshot of some state.
///
/// Writes go to a sibling temporary file first and are renamed into place,
/// so a crash mid-write never leaves a truncated snapshot behind.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    /// Creates a handle for the snapshot at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The snapshot location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the snapshot, returning `T::default()` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::Persistence`] if the file exists but cannot be
    /// read or decoded.
    pub fn load<T: DeserializeOwned + Default>(&self) -> Result<T> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no snapshot found, starting empty");
                return Ok(T::default());
            }
            Err(e) => return Err(AlertError::persistence(&self.path, e)),
        };
        if bytes.is_empty() {
            return Ok(T::default());
        }
        serde_json::from_slice(&bytes).map_err(|e| AlertError::persistence(&self.path, e))
    }

    /// Atomically replaces the snapshot with `value`.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::Persistence`] if the file cannot be written.
    pub fn save<T: Serialize>(&self, value: &T) -> Result<usize> {
        let bytes = serde_json::to_vec(value)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| AlertError::persistence(parent, e))?;
        }
        let tmp = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).map_err(|e| AlertError::persistence(&tmp, e))?;
        file.write_all(&bytes)
            .and_then(|()| file.sync_all())
            .map_err(|e| AlertError::persistence(&tmp, e))?;
        drop(file);
        fs::rename(&tmp, &self.path).map_err(|e| AlertError::persistence(&self.path, e))?;
        Ok(bytes.len())
    }
}

/// Runs `maintain` every `interval`, and once more when `cancel` fires.
///
/// Failures are logged and do not stop the loop.
pub(crate) async fn run_maintenance<F>(
    component: &'static str,
    interval: Duration,
    cancel: CancellationToken,
    mut maintain: F,
) where
    F: FnMut() -> Result<usize>,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => maintain_once(component, &mut maintain),
        }
    }
    maintain_once(component, &mut maintain);
    info!(component, "maintenance stopped");
}

fn maintain_once<F>(component: &'static str, maintain: &mut F)
where
    F: FnMut() -> Result<usize>,
{
    match maintain() {
        Ok(bytes) => debug!(component, bytes, "maintenance completed"),
        Err(e) => warn!(component, error = %e, "maintenance failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn missing_file_loads_default() {
        let dir = TempDir::new().unwrap();
        let file = SnapshotFile::new(dir.path().join("silences"));
        let loaded: BTreeMap<String, u32> = file.load().unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let file = SnapshotFile::new(dir.path().join("nested").join("notifications"));
        let mut state = BTreeMap::new();
        state.insert("a".to_string(), 1u32);

        let written = file.save(&state).unwrap();
        assert!(written > 0);
        assert!(!file.path().with_extension("tmp").exists());

        let loaded: BTreeMap<String, u32> = file.load().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn save_overwrites_leftover_temp_file() {
        let dir = TempDir::new().unwrap();
        let file = SnapshotFile::new(dir.path().join("notifications"));
        fs::write(file.path().with_extension("tmp"), vec![b'x'; 4096]).unwrap();

        let state = BTreeMap::from([("a".to_string(), 1u32)]);
        let written = file.save(&state).unwrap();

        assert_eq!(fs::metadata(file.path()).unwrap().len(), written as u64);
        let loaded: BTreeMap<String, u32> = file.load().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn corrupt_file_is_persistence_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("silences");
        fs::write(&path, b"{broken").unwrap();

        let result: Result<BTreeMap<String, u32>> = SnapshotFile::new(&path).load();
        assert!(matches!(result, Err(AlertError::Persistence { .. })));
    }

    #[tokio::test]
    async fn maintenance_runs_final_pass_on_cancel() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let runs = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let counter = Arc::clone(&runs);
        let task = tokio::spawn(run_maintenance(
            "test",
            Duration::from_millis(10),
            cancel.clone(),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(0)
            },
        ));

        tokio::time::sleep(Duration::from_millis(35)).await;
        cancel.cancel();
        task.await.unwrap();
        assert!(runs.load(Ordering::SeqCst) >= 2);
    }
}
