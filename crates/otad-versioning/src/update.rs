//! ---
//! ota_section: "02-release-index"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Release data model and release index sources."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};

/// A release published in the release index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    /// Semantic version of the release.
    pub version: Version,
    /// Publication timestamp, when the index reports one.
    #[serde(default)]
    pub release_date: Option<DateTime<Utc>>,
    /// Display name of the release.
    #[serde(default)]
    pub name: String,
    /// Release notes.
    #[serde(default)]
    pub notes: String,
    /// Artifacts attached to the release, in index order.
    #[serde(default)]
    pub bundles: Vec<Bundle>,
    /// Whether the index marks the release as a prerelease.
    #[serde(default)]
    pub prerelease: bool,
}

impl Update {
    /// Create an update without metadata or bundles.
    #[must_use]
    pub fn new(version: Version) -> Self {
        Self {
            version,
            release_date: None,
            name: String::new(),
            notes: String::new(),
            bundles: Vec::new(),
            prerelease: false,
        }
    }

    /// Attach a display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Attach a bundle.
    #[must_use]
    pub fn with_bundle(mut self, bundle: Bundle) -> Self {
        self.bundles.push(bundle);
        self
    }

    /// Mark the update as a prerelease.
    #[must_use]
    pub fn prerelease(mut self, prerelease: bool) -> Self {
        self.prerelease = prerelease;
        self
    }
}

/// One downloadable artifact of an [`Update`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    /// Download location handed to the update backend.
    pub url: String,
    /// File name of the artifact; backfilled from the URL when empty.
    #[serde(default)]
    pub asset_name: String,
    /// Compatibility tag; derived from the asset name when unset.
    #[serde(default)]
    pub compatibility: Option<String>,
    /// Artifact size in bytes.
    #[serde(default)]
    pub size: i64,
}

impl Bundle {
    /// Create a bundle pointing at `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            asset_name: String::new(),
            compatibility: None,
            size: 0,
        }
    }

    /// Attach an asset name.
    #[must_use]
    pub fn with_asset_name(mut self, asset_name: impl Into<String>) -> Self {
        self.asset_name = asset_name.into();
        self
    }

    /// Attach an explicit compatibility tag.
    #[must_use]
    pub fn with_compatibility(mut self, compatibility: impl Into<String>) -> Self {
        self.compatibility = Some(compatibility.into());
        self
    }
}

/// Source of candidate updates.
///
/// Implementations return releases in any order; callers sort them.
#[async_trait]
pub trait ReleaseIndex: Send + Sync {
    /// Fetch all candidate updates currently published.
    async fn updates(&self) -> Result<Vec<Update>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_entry_defaults_optional_fields() {
        let update: Update = serde_json::from_str(
            r#"{"version": "1.8.2", "bundles": [{"url": "https://example.com/a_update.bin"}]}"#,
        )
        .unwrap();
        assert_eq!(update.version, Version::new(1, 8, 2));
        assert!(update.release_date.is_none());
        assert!(!update.prerelease);
        assert_eq!(update.bundles[0].asset_name, "");
        assert!(update.bundles[0].compatibility.is_none());
    }
}
