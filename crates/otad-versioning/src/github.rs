//! ---
//! ota_section: "02-release-index"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "GitHub releases backed release index."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use async_trait::async_trait;
use octocrab::models::repos::Release;
use octocrab::Octocrab;
use otad_common::config::GitHubConfig;
use semver::Version;
use tracing::{debug, error};

use crate::update::{Bundle, ReleaseIndex, Update};

/// Release index reading the releases of a GitHub repository.
#[derive(Debug, Clone)]
pub struct GitHubReleaseIndex {
    client: Octocrab,
    owner: String,
    repo: String,
    per_page: u8,
}

impl GitHubReleaseIndex {
    /// Build an index for `owner/repo` using anonymous API access.
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Result<Self> {
        let client = Octocrab::builder()
            .build()
            .context("unable to construct GitHub client")?;
        Ok(Self {
            client,
            owner: owner.into(),
            repo: repo.into(),
            per_page: 50,
        })
    }

    /// Build an index from the `[repository.github]` configuration section.
    pub fn from_config(config: &GitHubConfig) -> Result<Self> {
        let mut builder = Octocrab::builder();
        if let Some(token) = &config.token {
            builder = builder.personal_token(token.clone());
        }
        let client = builder
            .build()
            .context("unable to construct GitHub client")?;
        Ok(Self {
            client,
            owner: config.owner.clone(),
            repo: config.repo.clone(),
            per_page: config.per_page,
        })
    }
}

#[async_trait]
impl ReleaseIndex for GitHubReleaseIndex {
    async fn updates(&self) -> Result<Vec<Update>> {
        let page = self
            .client
            .repos(self.owner.clone(), self.repo.clone())
            .releases()
            .list()
            .per_page(self.per_page)
            .send()
            .await
            .with_context(|| format!("failed to query github repo {}/{}", self.owner, self.repo))?;

        let updates = page
            .items
            .iter()
            .filter_map(|release| update_from_release(&self.owner, &self.repo, release))
            .collect::<Vec<_>>();
        debug!(owner = %self.owner, repo = %self.repo, count = updates.len(), "github releases listed");
        Ok(updates)
    }
}

fn update_from_release(owner: &str, repo: &str, release: &Release) -> Option<Update> {
    if release.draft {
        return None;
    }
    let version = match version_from_tag(&release.tag_name) {
        Ok(version) => version,
        Err(err) => {
            error!(
                owner,
                repo,
                tag = %release.tag_name,
                error = %err,
                "release skipped: tag name is not a semver version"
            );
            return None;
        }
    };
    let bundles = release
        .assets
        .iter()
        .map(|asset| Bundle {
            url: asset.browser_download_url.to_string(),
            asset_name: asset.name.clone(),
            compatibility: None,
            size: asset.size,
        })
        .collect();
    Some(Update {
        version,
        release_date: release.published_at,
        name: release.name.clone().unwrap_or_default(),
        notes: release.body.clone().unwrap_or_default(),
        bundles,
        prerelease: release.prerelease,
    })
}

/// Parse a release tag, accepting a single leading `v`.
pub fn version_from_tag(tag: &str) -> std::result::Result<Version, semver::Error> {
    Version::parse(tag.strip_prefix('v').unwrap_or(tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_accept_optional_v_prefix() {
        assert_eq!(version_from_tag("v1.8.2").unwrap(), Version::new(1, 8, 2));
        assert_eq!(version_from_tag("1.8.2").unwrap(), Version::new(1, 8, 2));
        assert!(version_from_tag("release-1").is_err());
        assert!(version_from_tag("vv1.8.2").is_err());
    }
}
