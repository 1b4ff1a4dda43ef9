//! ---
//! ota_section: "02-release-index"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Installed OS version discovery helpers."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
use std::path::Path;

use ::semver::Version;
use anyhow::{anyhow, Context, Result};

const VERSION_ID_KEY: &str = "VERSION_ID";

/// Strip surrounding whitespace and double quotes from a reported version.
#[must_use]
pub fn normalize_version(raw: &str) -> &str {
    raw.trim().trim_matches('"')
}

/// Strictly parse a reported OS version; no heuristics such as `v` prefixes or
/// missing patch components are accepted.
pub fn parse_version(raw: &str) -> std::result::Result<Version, ::semver::Error> {
    Version::parse(normalize_version(raw))
}

/// Extract `VERSION_ID` from os-release formatted text.
#[must_use]
pub fn os_release_version(contents: &str) -> Option<String> {
    contents.lines().find_map(|line| {
        let (key, value) = line.trim().split_once('=')?;
        if key.trim() != VERSION_ID_KEY {
            return None;
        }
        let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
        (!value.is_empty()).then(|| value.to_owned())
    })
}

/// Read the `VERSION_ID` of an os-release file.
pub async fn read_os_release_version(path: &Path) -> Result<String> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    os_release_version(&contents)
        .ok_or_else(|| anyhow!("no {} entry found in {}", VERSION_ID_KEY, path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_id_is_unquoted() {
        let contents = "NAME=\"Firmware OS\"\nID=fwos\nVERSION_ID=\"1.8.1\"\nPRETTY_NAME=\"Firmware OS 1.8.1\"\n";
        assert_eq!(os_release_version(contents).as_deref(), Some("1.8.1"));
        assert_eq!(
            os_release_version("VERSION_ID=2.0.0\n").as_deref(),
            Some("2.0.0")
        );
    }

    #[test]
    fn missing_version_id_yields_none() {
        assert!(os_release_version("NAME=fwos\nVERSION=\"1 (Penguin)\"\n").is_none());
        assert!(os_release_version("VERSION_ID=\"\"\n").is_none());
    }

    #[test]
    fn parse_is_strict() {
        assert_eq!(parse_version("\"1.8.1\"").unwrap(), Version::new(1, 8, 1));
        assert!(parse_version("1.8").is_err());
        assert!(parse_version("v1.8.1").is_err());
    }

    #[tokio::test]
    async fn reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("os-release");
        std::fs::write(&path, "VERSION_ID=1.2.3\n").unwrap();
        assert_eq!(read_os_release_version(&path).await.unwrap(), "1.2.3");
        assert!(read_os_release_version(&dir.path().join("missing"))
            .await
            .is_err());
    }
}
