//! ---
//! ota_section: "01-core-functionality"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Shared primitives and utilities for the update agent."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
//! Core shared primitives for the otad workspace.
//! This crate exposes configuration loading, logging, and version metadata
//! utilities consumed by the daemon and its adapters.

pub mod config;
pub mod logging;
pub mod version;

pub use config::{
    AppConfig, BackendConfig, BusKind, GitHubConfig, HttpConfig, LoadedAppConfig, LoggingConfig,
    ManagerConfig, MetricsConfig, RepositoryConfig, RepositorySource,
};
pub use logging::{init_tracing, LogFormat};
pub use version::VersionInfo;
