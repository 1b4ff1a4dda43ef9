//! ---
//! ota_section: "01-core-functionality"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Shared primitives and utilities for the update agent."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_os_release_path() -> PathBuf {
    PathBuf::from("/etc/os-release")
}

fn default_feed_path() -> PathBuf {
    PathBuf::from("/etc/otad/update_feed.json")
}

fn default_github_per_page() -> u8 {
    50
}

fn default_busctl() -> PathBuf {
    PathBuf::from("busctl")
}

fn default_backend_poll_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_http_enabled() -> bool {
    true
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/otad/update.socket")
}

fn default_logging_directory() -> Option<PathBuf> {
    None
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_dbus_service_name() -> String {
    "org.otad.Update1".to_owned()
}

fn default_metrics_enabled() -> bool {
    true
}

/// Primary configuration object for the otad runtime.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub dbus: DbusConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "OTAD_CONFIG";

    /// Default locations inspected when no explicit path is supplied.
    pub const DEFAULT_CANDIDATES: [&str; 2] = ["/etc/otad.toml", "otad.toml"];

    /// Load configuration from disk, respecting the `OTAD_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.manager.validate()?;
        self.repository.validate()?;
        self.backend.validate()?;
        self.http.validate()?;
        self.dbus.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Resolution and scheduling options for the update manager.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    #[serde(default)]
    pub allow_prerelease: bool,
    /// Interval between scheduled update checks; unset disables polling.
    #[serde(default)]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub check_interval: Option<Duration>,
    #[serde(default = "default_os_release_path")]
    pub os_release_path: PathBuf,
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<()> {
        if matches!(self.check_interval, Some(interval) if interval.is_zero()) {
            return Err(anyhow!("manager.check_interval must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            allow_prerelease: false,
            check_interval: None,
            os_release_path: default_os_release_path(),
        }
    }
}

/// Where candidate releases are fetched from.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RepositorySource {
    GitHub,
    #[default]
    Feed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    #[serde(default)]
    pub source: RepositorySource,
    #[serde(default)]
    pub github: Option<GitHubConfig>,
    #[serde(default = "default_feed_path")]
    pub feed_path: PathBuf,
}

impl RepositoryConfig {
    pub fn validate(&self) -> Result<()> {
        match self.source {
            RepositorySource::GitHub => {
                let github = self.github.as_ref().ok_or_else(|| {
                    anyhow!("repository.source is github but [repository.github] is missing")
                })?;
                github.validate()
            }
            RepositorySource::Feed => {
                if self.feed_path.as_os_str().is_empty() {
                    return Err(anyhow!("repository.feed_path must not be empty"));
                }
                Ok(())
            }
        }
    }
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            source: RepositorySource::Feed,
            github: None,
            feed_path: default_feed_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    pub owner: String,
    pub repo: String,
    #[serde(default = "default_github_per_page")]
    pub per_page: u8,
    /// Optional API token; anonymous access is rate limited by GitHub.
    #[serde(default)]
    pub token: Option<String>,
}

impl GitHubConfig {
    pub fn validate(&self) -> Result<()> {
        if self.owner.trim().is_empty() || self.repo.trim().is_empty() {
            return Err(anyhow!("repository.github owner and repo must be set"));
        }
        if self.per_page == 0 || self.per_page > 100 {
            return Err(anyhow!(
                "repository.github.per_page must be within 1..=100, got {}",
                self.per_page
            ));
        }
        Ok(())
    }
}

/// Message bus the RAUC service is reachable on.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    System,
    Session,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_busctl")]
    pub busctl: PathBuf,
    #[serde(default)]
    pub bus: BusKind,
    /// How often a running installation is polled for completion.
    #[serde(default = "default_backend_poll_interval")]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    #[serde(rename = "poll_interval_ms")]
    pub poll_interval: Duration,
}

impl BackendConfig {
    pub fn validate(&self) -> Result<()> {
        if self.busctl.as_os_str().is_empty() {
            return Err(anyhow!("backend.busctl must not be empty"));
        }
        if self.poll_interval.is_zero() {
            return Err(anyhow!("backend.poll_interval_ms must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            busctl: default_busctl(),
            bus: BusKind::default(),
            poll_interval: default_backend_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
}

impl HttpConfig {
    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.socket_path.as_os_str().is_empty() {
            return Err(anyhow!("http.socket_path must be set when http is enabled"));
        }
        Ok(())
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            socket_path: default_socket_path(),
        }
    }
}

/// D-Bus control surface; off unless enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbusConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bus: BusKind,
    /// Well-known name requested on the bus.
    #[serde(default = "default_dbus_service_name")]
    pub service_name: String,
}

impl DbusConfig {
    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.service_name.trim().is_empty() {
            return Err(anyhow!("dbus.service_name must be set when dbus is enabled"));
        }
        Ok(())
    }
}

impl Default for DbusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bus: BusKind::default(),
            service_name: default_dbus_service_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for the rolling JSON log; stdout only when unset.
    #[serde(default = "default_logging_directory")]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}
