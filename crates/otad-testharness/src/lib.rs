//! ---
//! ota_section: "05-testing"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Test doubles for the update backend and release index."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
//! Scriptable stand-ins for the collaborators of `otad_core::UpdateManager`.
//!
//! [`FakeBackend`] emulates RAUC: it reports a compatibility string, an
//! installed version, a scripted progress sequence, and records every bundle it
//! was asked to install. [`StaticReleaseIndex`] serves a fixed list of updates.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use otad_core::backend::{BOOTNAME_ATTRIBUTE, BUNDLE_VERSION_ATTRIBUTE, OPERATION_INSTALLING};
use otad_core::{InstallOptions, InstallProgress, SlotStatus, UpdateBackend};
use otad_versioning::{Bundle, ReleaseIndex, Update};
use parking_lot::Mutex;
use semver::Version;
use tokio::time::Instant;
use tracing::debug;

/// Compatibility string used by the fixtures unless stated otherwise.
pub const DEFAULT_COMPATIBLE: &str = "cbpifw-raspberrypi3-64";

const OPERATION_IDLE: &str = "idle";
const BOOT_SLOT: &str = "A";

#[derive(Debug)]
struct BackendState {
    compatible: String,
    slots: Vec<SlotStatus>,
    operation: String,
    progress_script: VecDeque<i32>,
    last_progress: i32,
    progress_delay: Duration,
    install_delay: Duration,
    install_error: Option<String>,
    installs: Vec<String>,
}

/// In-memory RAUC stand-in.
#[derive(Debug)]
pub struct FakeBackend {
    state: Mutex<BackendState>,
    progress_queries: AtomicUsize,
}

impl FakeBackend {
    /// Idle backend for `compatible` without any installed version.
    pub fn new(compatible: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(BackendState {
                compatible: compatible.into(),
                slots: Vec::new(),
                operation: OPERATION_IDLE.to_owned(),
                progress_script: VecDeque::new(),
                last_progress: 0,
                progress_delay: Duration::ZERO,
                install_delay: Duration::ZERO,
                install_error: None,
                installs: Vec::new(),
            }),
            progress_queries: AtomicUsize::new(0),
        }
    }

    /// Report `version` as the bundle version of the booted slot.
    pub fn with_installed_version(self, version: &str) -> Self {
        {
            let mut state = self.state.lock();
            state.slots = vec![
                SlotStatus::new("rootfs.0")
                    .with_attribute(BOOTNAME_ATTRIBUTE, BOOT_SLOT)
                    .with_attribute(BUNDLE_VERSION_ATTRIBUTE, version),
                SlotStatus::new("rootfs.1").with_attribute(BOOTNAME_ATTRIBUTE, "B"),
            ];
        }
        self
    }

    /// Percentages returned by successive progress queries; the last one repeats.
    pub fn with_progress_script(self, script: impl IntoIterator<Item = i32>) -> Self {
        self.state.lock().progress_script = script.into_iter().collect();
        self
    }

    /// Time each progress query takes before it answers.
    pub fn with_progress_delay(self, delay: Duration) -> Self {
        self.state.lock().progress_delay = delay;
        self
    }

    /// Time each installation takes; the backend reports `installing` meanwhile.
    pub fn with_install_delay(self, delay: Duration) -> Self {
        self.state.lock().install_delay = delay;
        self
    }

    pub fn failing_install(self, message: impl Into<String>) -> Self {
        self.state.lock().install_error = Some(message.into());
        self
    }

    pub fn set_operation(&self, operation: impl Into<String>) {
        self.state.lock().operation = operation.into();
    }

    /// URLs handed to `install_bundle`, in call order.
    pub fn installs(&self) -> Vec<String> {
        self.state.lock().installs.clone()
    }

    pub fn progress_queries(&self) -> usize {
        self.progress_queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpdateBackend for FakeBackend {
    async fn boot_slot(&self) -> Result<String> {
        Ok(BOOT_SLOT.to_owned())
    }

    async fn slot_status(&self) -> Result<Vec<SlotStatus>> {
        Ok(self.state.lock().slots.clone())
    }

    async fn compatible(&self) -> Result<String> {
        Ok(self.state.lock().compatible.clone())
    }

    async fn install_bundle(&self, url: &str, _options: InstallOptions) -> Result<()> {
        let delay = {
            let mut state = self.state.lock();
            state.installs.push(url.to_owned());
            state.operation = OPERATION_INSTALLING.to_owned();
            state.install_delay
        };
        debug!(bundle_url = %url, "fake install started");
        tokio::time::sleep(delay).await;
        let mut state = self.state.lock();
        state.operation = OPERATION_IDLE.to_owned();
        match &state.install_error {
            Some(message) => Err(anyhow!(message.clone())),
            None => Ok(()),
        }
    }

    async fn progress(&self) -> Result<InstallProgress> {
        self.progress_queries.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.lock().progress_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        if let Some(next) = state.progress_script.pop_front() {
            state.last_progress = next;
        }
        Ok(InstallProgress {
            percentage: state.last_progress,
            message: String::new(),
            depth: 1,
        })
    }

    async fn operation(&self) -> Result<String> {
        Ok(self.state.lock().operation.clone())
    }
}

/// Release index serving a fixed list of updates, or always failing.
#[derive(Debug, Default)]
pub struct StaticReleaseIndex {
    updates: Vec<Update>,
    error: Option<String>,
    delay: Duration,
    queries: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    query_starts: Mutex<Vec<Instant>>,
}

impl StaticReleaseIndex {
    pub fn new(updates: Vec<Update>) -> Self {
        Self {
            updates,
            ..Self::default()
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Time each listing takes before it answers.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Highest number of listings that were running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Instants at which listings started, in call order.
    pub fn query_starts(&self) -> Vec<Instant> {
        self.query_starts.lock().clone()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReleaseIndex for StaticReleaseIndex {
    async fn updates(&self) -> Result<Vec<Update>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.query_starts.lock().push(Instant::now());
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.error {
            Some(message) => Err(anyhow!(message.clone())),
            None => Ok(self.updates.clone()),
        }
    }
}

/// Update bundle asset for `compatible` following the `<tag>_<version>_update.bin` convention.
pub fn update_bundle(compatible: &str, version: &str) -> Bundle {
    let asset = format!("{compatible}_v{version}_update.bin");
    Bundle::new(format!("https://downloads.example.com/releases/{asset}")).with_asset_name(asset)
}

/// Release `version` carrying one update bundle for `compatible`.
pub fn release_for(compatible: &str, version: &str) -> Update {
    Update::new(parse(version)).with_bundle(update_bundle(compatible, version))
}

/// Release `version` without any bundles.
pub fn bare_release(version: &str) -> Update {
    Update::new(parse(version))
}

fn parse(version: &str) -> Version {
    Version::parse(version).unwrap_or_else(|err| panic!("fixture version {version}: {err}"))
}
