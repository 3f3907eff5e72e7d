//! The in-memory alert store.
//!
//! This module provides:
//! - [`AlertStore`]: concurrent set of alerts keyed by fingerprint
//! - [`AlertIterator`]: async stream of alerts for one subscriber
//!
//! Every subscriber first receives the full current contents of the store,
//! then every subsequent write, in write order.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{AlertError, Result};
use crate::marker::AlertMarker;
use crate::types::{Alert, Fingerprint, sub_duration};

/// Concurrent in-memory alert set with subscriptions and GC.
#[derive(Debug, Default)]
pub struct AlertStore {
    alerts: RwLock<HashMap<Fingerprint, Alert>>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<Alert>>>,
    closed: AtomicBool,
}

impl AlertStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or updates alerts, merging with overlapping stored versions.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::Store`] if the store has been closed.
    pub fn put(&self, alerts: Vec<Alert>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AlertError::Store {
                reason: "alert store is closed".to_string(),
            });
        }

        // Listeners are notified while the write lock is held so subscribers
        // never observe writes out of order with their initial snapshot.
        let mut stored = self.alerts.write();
        let mut listeners = self.listeners.lock();
        for alert in alerts {
            let fingerprint = alert.fingerprint();
            let alert = match stored.get(&fingerprint) {
                Some(old) if old.overlaps(&alert) => old.merge(&alert),
                _ => alert,
            };
            stored.insert(fingerprint, alert.clone());
            listeners.retain(|tx| tx.send(alert.clone()).is_ok());
        }
        Ok(())
    }

    /// Returns the alert with the given fingerprint.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::AlertNotFound`] if no such alert is stored.
    pub fn get(&self, fingerprint: Fingerprint) -> Result<Alert> {
        self.alerts
            .read()
            .get(&fingerprint)
            .cloned()
            .ok_or_else(|| AlertError::AlertNotFound {
                fingerprint: fingerprint.to_string(),
            })
    }

    /// Returns a copy of every stored alert.
    #[must_use]
    pub fn list(&self) -> Vec<Alert> {
        self.alerts.read().values().cloned().collect()
    }

    /// Returns the number of stored alerts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.alerts.read().len()
    }

    /// Returns true if no alerts are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.alerts.read().is_empty()
    }

    /// Subscribes to the store.
    ///
    /// The iterator yields every stored alert, then every later write. It
    /// ends when the store is closed.
    #[must_use]
    pub fn subscribe(&self) -> AlertIterator {
        let (tx, rx) = mpsc::unbounded_channel();
        let stored = self.alerts.read();
        for alert in stored.values() {
            // The receiver is still alive here, so the send cannot fail.
            let _ = tx.send(alert.clone());
        }
        if !self.closed.load(Ordering::Acquire) {
            self.listeners.lock().push(tx);
        }
        AlertIterator { rx }
    }

    /// Removes alerts resolved for longer than `grace` before `now`.
    ///
    /// Returns the removed alerts.
    pub fn gc(&self, now: DateTime<Utc>, grace: Duration) -> Vec<Alert> {
        let cutoff = sub_duration(now, grace);
        let mut removed = Vec::new();
        self.alerts.write().retain(|_, alert| {
            if alert.resolved_at(cutoff) {
                removed.push(alert.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Runs GC every `interval` until `cancel` fires.
    ///
    /// Status entries of collected alerts are removed from `marker`.
    pub async fn run_gc(
        &self,
        interval: Duration,
        grace: Duration,
        marker: &AlertMarker,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = self.gc(Utc::now(), grace);
                    for alert in &removed {
                        marker.delete(alert.fingerprint());
                    }
                    if !removed.is_empty() {
                        debug!(removed = removed.len(), "garbage collected resolved alerts");
                    }
                }
            }
        }
        info!("alert store gc stopped");
    }

    /// Closes the store: later writes fail and all iterators end.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.listeners.lock().clear();
    }
}

/// A subscriber's view of the alert store.
#[derive(Debug)]
pub struct AlertIterator {
    rx: mpsc::UnboundedReceiver<Alert>,
}

impl AlertIterator {
    /// Waits for the next alert; `None` once the store is closed.
    pub async fn next_alert(&mut self) -> Option<Alert> {
        self.rx.recv().await
    }
}

impl Stream for AlertIterator {
    type Item = Alert;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
