//! ---
//! ota_section: "03-update-orchestration"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Update resolution and installation orchestration."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use otad_common::config::ManagerConfig;
use otad_versioning::semver::{normalize_version, parse_version, read_os_release_version};
use otad_versioning::{Bundle, ReleaseIndex, Update};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::artifact::extract_compatibility;
use crate::backend::{InstallOptions, UpdateBackend, BUNDLE_VERSION_ATTRIBUTE, OPERATION_INSTALLING};
use crate::error::{ManagerError, Result};
use crate::metrics::ManagerMetrics;
use crate::notify::Subscribers;
use crate::resolve::{matching_bundle, prepare_bundle, select_update, CompatibilityExtractor, Selection};

const DEFAULT_OS_RELEASE_PATH: &str = "/etc/os-release";

/// Externally visible state of the update backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagerStatus {
    Idle,
    Installing,
}

impl ManagerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagerStatus::Idle => "idle",
            ManagerStatus::Installing => "installing",
        }
    }
}

impl fmt::Display for ManagerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a successful resolution: the update and the bundle to install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUpdate {
    pub update: Update,
    pub bundle: Bundle,
}

/// Decides which update to install next and drives the backend to install it.
///
/// The manager keeps only the last resolved update; whether the backend is
/// installing is always queried live. Callers are responsible for not starting
/// two installations at once (see [`UpdateManager::status`]).
pub struct UpdateManager {
    pub(crate) backend: Arc<dyn UpdateBackend>,
    index: Arc<dyn ReleaseIndex>,
    allow_prerelease: bool,
    check_interval: Option<Duration>,
    os_release_path: PathBuf,
    extract_compatibility: CompatibilityExtractor,
    metrics: Option<ManagerMetrics>,
    next_update: Mutex<Option<Update>>,
    pub(crate) subscribers: Subscribers,
}

impl fmt::Debug for UpdateManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateManager")
            .field("allow_prerelease", &self.allow_prerelease)
            .field("check_interval", &self.check_interval)
            .field("os_release_path", &self.os_release_path)
            .finish_non_exhaustive()
    }
}

impl UpdateManager {
    pub fn builder(index: Arc<dyn ReleaseIndex>) -> UpdateManagerBuilder {
        UpdateManagerBuilder::new(index)
    }

    /// Interval of the scheduled check, if enabled.
    pub fn check_interval(&self) -> Option<Duration> {
        self.check_interval
    }

    /// The update found by the last successful resolution. May be stale.
    pub fn next_update(&self) -> Option<Update> {
        self.next_update.lock().clone()
    }

    /// Resolve the next installable update.
    ///
    /// Fails with [`ManagerError::NoSuitableUpdate`] when nothing newer and
    /// compatible is published.
    pub async fn check_for_update(&self) -> Result<ResolvedUpdate> {
        if let Some(metrics) = &self.metrics {
            metrics.inc_check();
        }
        let compatible = self
            .backend
            .compatible()
            .await
            .map_err(ManagerError::backend("compatible query"))?;
        info!(compatible = %compatible, "checking for update");

        let raw_version = self.current_os_version().await?;
        let current = parse_version(&raw_version).map_err(|source| ManagerError::InvalidVersion {
            version: raw_version.clone(),
            source,
        })?;

        let candidates = self.index.updates().await.map_err(ManagerError::Repository)?;
        debug!(
            compatible = %compatible,
            current_os_version = %current,
            candidates = candidates.len(),
            "release index queried"
        );

        let selection = Selection {
            current: &current,
            compatible: &compatible,
            allow_prerelease: self.allow_prerelease,
            extract_compatibility: self.extract_compatibility,
        };
        let Some((update, bundle)) = select_update(candidates, selection) else {
            info!(compatible = %compatible, current_os_version = %current, "no new update found");
            return Err(ManagerError::NoSuitableUpdate);
        };

        if let Some(metrics) = &self.metrics {
            metrics.inc_update_found();
        }
        *self.next_update.lock() = Some(update.clone());
        Ok(ResolvedUpdate { update, bundle })
    }

    /// Install the cached next update, resolving one first when none is cached.
    pub async fn install_next_update(&self) -> Result<()> {
        let update = self.cached_or_resolve().await?;
        self.install_update(&update).await
    }

    /// Install `update` using the bundle matching this device.
    pub async fn install_update(&self, update: &Update) -> Result<()> {
        let bundle = self.compatible_bundle(update).await?;
        info!(
            update_version = %update.version,
            update_name = %update.name,
            bundle_url = %bundle.url,
            "starting update"
        );
        if let Some(metrics) = &self.metrics {
            metrics.inc_install_started();
        }
        let options = InstallOptions {
            ignore_incompatible: false,
        };
        if let Err(source) = self.backend.install_bundle(&bundle.url, options).await {
            if let Some(metrics) = &self.metrics {
                metrics.inc_install_failure();
            }
            error!(bundle_url = %bundle.url, error = %format!("{source:#}"), "failed to install bundle");
            return Err(ManagerError::InstallFailure {
                url: bundle.url,
                source,
            });
        }
        info!(update_version = %update.version, "update installed");
        Ok(())
    }

    /// Live backend state; never cached so it is safe to poll during an install.
    pub async fn status(&self) -> Result<ManagerStatus> {
        let operation = self
            .backend
            .operation()
            .await
            .map_err(ManagerError::backend("operation query"))?;
        if operation == OPERATION_INSTALLING {
            Ok(ManagerStatus::Installing)
        } else {
            Ok(ManagerStatus::Idle)
        }
    }

    /// Percentage of the running installation.
    pub async fn progress(&self) -> Result<i32> {
        if self.status().await? != ManagerStatus::Installing {
            return Err(ManagerError::NoOperationInProgress);
        }
        let progress = self
            .backend
            .progress()
            .await
            .map_err(ManagerError::backend("progress query"))?;
        Ok(progress.percentage)
    }

    pub(crate) async fn cached_or_resolve(&self) -> Result<Update> {
        if let Some(update) = self.next_update() {
            return Ok(update);
        }
        Ok(self.check_for_update().await?.update)
    }

    async fn compatible_bundle(&self, update: &Update) -> Result<Bundle> {
        let compatible = self
            .backend
            .compatible()
            .await
            .map_err(ManagerError::backend("compatible query"))?;
        let mut update = update.clone();
        for bundle in &mut update.bundles {
            prepare_bundle(bundle, self.extract_compatibility);
        }
        matching_bundle(&update, &compatible)
            .cloned()
            .ok_or(ManagerError::NoSuitableUpdate)
    }

    async fn current_os_version(&self) -> Result<String> {
        match self.version_from_backend().await {
            Ok(version) => Ok(version),
            Err(backend_err) => {
                debug!(
                    error = %format!("{backend_err:#}"),
                    "failed to determine OS version from update backend, maybe this is a fresh install"
                );
                read_os_release_version(&self.os_release_path)
                    .await
                    .map_err(|err| {
                        error!(
                            path = %self.os_release_path.display(),
                            error = %format!("{err:#}"),
                            "failed to determine OS version from os-release"
                        );
                        ManagerError::VersionUnavailable(
                            err.context(format!("update backend: {backend_err:#}")),
                        )
                    })
            }
        }
    }

    async fn version_from_backend(&self) -> anyhow::Result<String> {
        let boot_slot = self
            .backend
            .boot_slot()
            .await
            .context("failed to get current boot slot")?;
        let slots = self
            .backend
            .slot_status()
            .await
            .context("failed to get slot status")?;
        let slot = slots
            .iter()
            .find(|slot| slot.is_boot_slot(&boot_slot))
            .ok_or_else(|| anyhow!("boot slot {boot_slot} not listed in slot status"))?;
        let version = slot
            .attribute(BUNDLE_VERSION_ATTRIBUTE)
            .map(normalize_version)
            .filter(|version| !version.is_empty())
            .ok_or_else(|| anyhow!("slot {} carries no {BUNDLE_VERSION_ATTRIBUTE}", slot.name))?;
        Ok(version.to_owned())
    }
}

/// Validated construction of an [`UpdateManager`].
pub struct UpdateManagerBuilder {
    index: Arc<dyn ReleaseIndex>,
    backend: Option<Arc<dyn UpdateBackend>>,
    allow_prerelease: bool,
    check_interval: Option<Duration>,
    os_release_path: PathBuf,
    extract_compatibility: CompatibilityExtractor,
    metrics: Option<ManagerMetrics>,
}

impl UpdateManagerBuilder {
    pub fn new(index: Arc<dyn ReleaseIndex>) -> Self {
        Self {
            index,
            backend: None,
            allow_prerelease: false,
            check_interval: None,
            os_release_path: PathBuf::from(DEFAULT_OS_RELEASE_PATH),
            extract_compatibility,
            metrics: None,
        }
    }

    /// Seed the builder from the `[manager]` configuration section.
    pub fn from_config(index: Arc<dyn ReleaseIndex>, config: &ManagerConfig) -> Self {
        let mut builder = Self::new(index)
            .allow_prerelease(config.allow_prerelease)
            .os_release_path(config.os_release_path.clone());
        if let Some(interval) = config.check_interval {
            builder = builder.check_interval(interval);
        }
        builder
    }

    /// Update backend driving installations; required.
    pub fn backend(mut self, backend: Arc<dyn UpdateBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn allow_prerelease(mut self, allow: bool) -> Self {
        self.allow_prerelease = allow;
        self
    }

    pub fn check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = Some(interval);
        self
    }

    /// os-release file consulted when the backend reports no installed version.
    pub fn os_release_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.os_release_path = path.into();
        self
    }

    pub fn compatibility_extractor(mut self, extractor: CompatibilityExtractor) -> Self {
        self.extract_compatibility = extractor;
        self
    }

    pub fn metrics(mut self, metrics: ManagerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> anyhow::Result<UpdateManager> {
        if matches!(self.check_interval, Some(interval) if interval.is_zero()) {
            return Err(anyhow!("check interval must be greater than zero"));
        }
        if self.os_release_path.as_os_str().is_empty() {
            return Err(anyhow!("os-release path must not be empty"));
        }
        let backend = self
            .backend
            .ok_or_else(|| anyhow!("an update backend must be configured"))?;
        Ok(UpdateManager {
            backend,
            index: self.index,
            allow_prerelease: self.allow_prerelease,
            check_interval: self.check_interval,
            os_release_path: self.os_release_path,
            extract_compatibility: self.extract_compatibility,
            metrics: self.metrics,
            next_update: Mutex::new(None),
            subscribers: Subscribers::default(),
        })
    }
}
