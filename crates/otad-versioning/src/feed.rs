//! ---
//! ota_section: "02-release-index"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Local JSON feed release index."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::update::{ReleaseIndex, Update};

/// Release index backed by a JSON document on local storage, e.g. a feed
/// mirrored onto the device by provisioning tooling.
///
/// ```json
/// {"releases": [{"version": "1.8.2", "name": "Penguin", "bundles": [{"url": "..."}]}]}
/// ```
#[derive(Debug, Clone)]
pub struct FeedReleaseIndex {
    path: PathBuf,
}

impl FeedReleaseIndex {
    /// Create an index reading `path` on every query.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the feed document.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Deserialize)]
struct UpdateFeed {
    #[serde(default)]
    releases: Vec<Update>,
}

#[async_trait]
impl ReleaseIndex for FeedReleaseIndex {
    async fn updates(&self) -> Result<Vec<Update>> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            debug!(path = %self.path.display(), "update feed missing");
            return Ok(Vec::new());
        }
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed reading update feed {}", self.path.display()))?;
        let feed: UpdateFeed = serde_json::from_str(&raw)
            .with_context(|| format!("invalid update feed {}", self.path.display()))?;
        Ok(feed.releases)
    }
}
