//! ---
//! ota_section: "03-update-orchestration"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Update-available fan-out and scheduled checks."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use otad_versioning::Update;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ManagerError, Result};
use crate::manager::UpdateManager;

/// Pending notifications per subscriber before new ones are dropped.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 16;

#[derive(Debug, Default)]
pub(crate) struct Subscribers {
    senders: Mutex<Vec<mpsc::Sender<Update>>>,
}

impl Subscribers {
    fn add(&self) -> mpsc::Receiver<Update> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        self.senders.lock().push(tx);
        rx
    }

    fn publish(&self, update: &Update) {
        let mut senders = self.senders.lock();
        senders.retain(|sender| match sender.try_send(update.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(update_version = %update.version, "subscriber queue full, notification dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("subscriber went away");
                false
            }
        });
    }
}

impl UpdateManager {
    /// Receive every update found by the scheduled check.
    pub fn subscribe(&self) -> mpsc::Receiver<Update> {
        self.subscribers.add()
    }

    /// Run `callback` for every update found by the scheduled check.
    ///
    /// The callback runs on its own task, never on the checking task.
    pub fn register_update_available_callback<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(Update) + Send + 'static,
    {
        let mut rx = self.subscribers.add();
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                callback(update);
            }
        })
    }

    /// Re-run [`UpdateManager::check_for_update`] every `interval` until `cancel` fires.
    ///
    /// Each check is awaited before the next tick is taken, so runs never overlap.
    /// Ticks missed by a slow check are dropped rather than queued. A zero
    /// `interval` is rejected with [`ManagerError::InvalidCheckInterval`].
    pub fn spawn_periodic_check(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        if interval.is_zero() {
            return Err(ManagerError::InvalidCheckInterval);
        }
        let manager = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_secs = interval.as_secs(), "periodic update check started");
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = manager.run_scheduled_check() => {}
                }
                // The next check starts one full interval after this one finished.
                ticker.reset();
            }
            info!("periodic update check stopped");
        }))
    }

    /// Start the scheduled check when the manager was built with an interval.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let interval = self.check_interval()?;
        match self.spawn_periodic_check(interval, cancel) {
            Ok(handle) => Some(handle),
            Err(err) => {
                error!(error = %err.report(), "periodic update check not started");
                None
            }
        }
    }

    async fn run_scheduled_check(&self) {
        match self.check_for_update().await {
            Ok(resolved) => {
                info!(update_version = %resolved.update.version, "update available");
                self.subscribers.publish(&resolved.update);
            }
            Err(err) if err.is_no_suitable_update() => {
                info!("no update available");
            }
            Err(err) => {
                error!(error = %err.report(), "failed to check for updates");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use semver::Version;

    fn update(minor: u64) -> Update {
        Update::new(Version::new(1, minor, 0))
    }

    #[test]
    fn full_queue_drops_notifications_without_starving_other_subscribers() {
        let subscribers = Subscribers::default();
        let mut stalled = subscribers.add();
        let mut reader = subscribers.add();

        let mut delivered = 0;
        for minor in 0..(SUBSCRIBER_QUEUE_CAPACITY as u64 * 2) {
            subscribers.publish(&update(minor));
            if reader.try_recv().is_ok() {
                delivered += 1;
            }
        }

        assert_eq!(delivered, SUBSCRIBER_QUEUE_CAPACITY * 2);
        let mut queued = Vec::new();
        while let Ok(update) = stalled.try_recv() {
            queued.push(update.version.minor);
        }
        let expected: Vec<u64> = (0..SUBSCRIBER_QUEUE_CAPACITY as u64).collect();
        assert_eq!(queued, expected);
        assert_eq!(subscribers.senders.lock().len(), 2);
    }

    #[test]
    fn closed_subscribers_are_pruned_on_publish() {
        let subscribers = Subscribers::default();
        let gone = subscribers.add();
        let mut kept = subscribers.add();
        drop(gone);

        subscribers.publish(&update(1));

        assert_eq!(subscribers.senders.lock().len(), 1);
        assert_eq!(kept.try_recv().map(|update| update.version.minor).ok(), Some(1));
    }
}
