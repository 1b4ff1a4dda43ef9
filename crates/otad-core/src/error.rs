//! ---
//! ota_section: "03-update-orchestration"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Update manager error taxonomy."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
use std::error::Error as _;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ManagerError>;

#[derive(Debug, Error)]
pub enum ManagerError {
    /// Nothing newer and compatible is published; an expected outcome.
    #[error("no suitable update found")]
    NoSuitableUpdate,
    #[error("current installed version ({version}) is not a semver version")]
    InvalidVersion {
        version: String,
        #[source]
        source: semver::Error,
    },
    #[error("failed to determine current os version")]
    VersionUnavailable(#[source] anyhow::Error),
    #[error("update backend {operation} failed")]
    Backend {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to load possible updates from repository")]
    Repository(#[source] anyhow::Error),
    #[error("failed to install bundle {url}")]
    InstallFailure {
        url: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("no operation in progress")]
    NoOperationInProgress,
    #[error("operation cancelled")]
    Cancelled,
    #[error("update check interval must be greater than zero")]
    InvalidCheckInterval,
}

impl ManagerError {
    pub(crate) fn backend(operation: &'static str) -> impl FnOnce(anyhow::Error) -> Self {
        move |source| Self::Backend { operation, source }
    }

    pub fn is_no_suitable_update(&self) -> bool {
        matches!(self, Self::NoSuitableUpdate)
    }

    /// Render the error together with its source chain on one line.
    pub fn report(&self) -> String {
        let mut rendered = self.to_string();
        let mut source = self.source();
        while let Some(cause) = source {
            rendered.push_str(": ");
            rendered.push_str(&cause.to_string());
            source = cause.source();
        }
        rendered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn report_includes_wrapped_causes() {
        let err = ManagerError::InstallFailure {
            url: "https://example.com/a_update.bin".into(),
            source: anyhow!("bundle signature invalid").context("InstallBundle call failed"),
        };
        let report = err.report();
        assert!(report.starts_with("failed to install bundle https://example.com/a_update.bin"));
        assert!(report.contains("InstallBundle call failed"));
        assert!(report.contains("bundle signature invalid"));
    }

    #[test]
    fn no_suitable_update_is_distinguishable() {
        assert!(ManagerError::NoSuitableUpdate.is_no_suitable_update());
        assert!(!ManagerError::NoOperationInProgress.is_no_suitable_update());
    }
}
