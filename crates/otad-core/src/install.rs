//! ---
//! ota_section: "03-update-orchestration"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Asynchronous installation with progress streaming."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use otad_versioning::Update;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::UpdateBackend;
use crate::error::{ManagerError, Result};
use crate::manager::UpdateManager;

/// Interval at which the backend is polled for progress during an install.
pub const PROGRESS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Buffered progress samples before new ones are dropped.
pub const PROGRESS_CHANNEL_CAPACITY: usize = 1000;

/// Progress percentages published while an installation runs.
///
/// Consecutive values always differ. The stream ends once the installation
/// finished and the completion callback ran.
pub type ProgressStream = mpsc::Receiver<i32>;

impl UpdateManager {
    /// Install `update` in the background.
    ///
    /// `on_complete` runs exactly once with the outcome, including
    /// [`ManagerError::Cancelled`] when `cancel` fires first.
    pub fn install_update_async<F>(
        self: &Arc<Self>,
        update: Update,
        cancel: CancellationToken,
        on_complete: F,
    ) -> ProgressStream
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let manager = Arc::clone(self);
        self.spawn_install(cancel, on_complete, async move {
            manager.install_update(&update).await
        })
    }

    /// Background variant of [`UpdateManager::install_next_update`].
    ///
    /// Resolution happens on the installer task when nothing is cached; its
    /// failures are reported through `on_complete`.
    pub fn install_next_update_async<F>(
        self: &Arc<Self>,
        cancel: CancellationToken,
        on_complete: F,
    ) -> ProgressStream
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let manager = Arc::clone(self);
        self.spawn_install(cancel, on_complete, async move {
            manager.install_next_update().await
        })
    }

    fn spawn_install<F, Fut>(
        &self,
        cancel: CancellationToken,
        on_complete: F,
        install: Fut,
    ) -> ProgressStream
    where
        F: FnOnce(Result<()>) + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (progress_tx, progress_rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        let (done_tx, done_rx) = oneshot::channel();

        let installer_cancel = cancel.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = installer_cancel.cancelled() => Err(ManagerError::Cancelled),
                result = install => result,
            };
            if let Err(err) = &result {
                warn!(error = %err.report(), "background installation did not succeed");
            }
            on_complete(result);
            let _ = done_tx.send(());
        });

        tokio::spawn(publish_progress(
            Arc::clone(&self.backend),
            progress_tx,
            done_rx,
            cancel,
        ));

        progress_rx
    }
}

async fn publish_progress(
    backend: Arc<dyn UpdateBackend>,
    tx: mpsc::Sender<i32>,
    mut done: oneshot::Receiver<()>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(PROGRESS_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_published: Option<i32> = None;

    loop {
        tokio::select! {
            biased;
            _ = &mut done => break,
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        // A backend query that never returns must not outlive the installation.
        let queried = tokio::select! {
            biased;
            _ = &mut done => break,
            _ = cancel.cancelled() => break,
            queried = backend.progress() => queried,
        };
        let progress = match queried {
            Ok(progress) => progress,
            Err(err) => {
                debug!(error = %format!("{err:#}"), "failed to query install progress");
                continue;
            }
        };
        if last_published == Some(progress.percentage) {
            continue;
        }
        match tx.try_send(progress.percentage) {
            Ok(()) => last_published = Some(progress.percentage),
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                debug!(progress = dropped, "progress consumer lagging, sample dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
    debug!("progress reporting stopped");
}
