//! ---
//! ota_section: "03-update-orchestration"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Release artifact classification."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
//! Bundle file names follow `<compat-tag>_<free-form>_update.bin`.

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

static COMPATIBILITY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z0-9\-.]+)_").expect("compatibility pattern to compile"));

static UPDATE_BUNDLE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r".*_update\.bin$").expect("update bundle pattern to compile"));

/// Derive the compatibility tag from an asset name; empty when the name carries none.
#[must_use]
pub fn extract_compatibility(asset_name: &str) -> String {
    COMPATIBILITY_PATTERN
        .captures(asset_name)
        .and_then(|captures| captures.get(1))
        .map(|tag| tag.as_str().to_owned())
        .unwrap_or_default()
}

/// Whether the asset is an installable update bundle rather than a full image,
/// source archive or other attachment.
#[must_use]
pub fn is_update_bundle(asset_name: &str) -> bool {
    UPDATE_BUNDLE_PATTERN.is_match(asset_name)
}

/// Last path segment of a download URL.
#[must_use]
pub fn asset_name_from_url(url: &str) -> String {
    if let Ok(parsed) = Url::parse(url) {
        if let Some(segment) = parsed.path_segments().and_then(|mut segments| segments.next_back()) {
            return segment.to_owned();
        }
    }
    url.rsplit('/').next().unwrap_or_default().to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_extract_compatibility() {
        let cases = [
            ("cbpfw-rpi3_v0.1.0.img", "cbpfw-rpi3"),
            ("cbpifw-someboard_.img", "cbpifw-someboard"),
            ("invalid-assetname.img", ""),
            ("board.v2_v1.0.0_update.bin", "board.v2"),
            ("_leading.img", ""),
        ];
        for (asset_name, compat) in cases {
            assert_eq!(extract_compatibility(asset_name), compat, "{asset_name}");
        }
    }

    #[test]
    fn update_bundles_are_recognised_by_suffix() {
        assert!(is_update_bundle("x_update.bin"));
        assert!(is_update_bundle("cbpifw-x_v1.8.2_update.bin"));
        assert!(!is_update_bundle("x.img"));
        assert!(!is_update_bundle("x_update.bin.sig"));
        assert!(!is_update_bundle("update.bin"));
    }

    #[test]
    fn asset_name_is_taken_from_url_path() {
        assert_eq!(
            asset_name_from_url("https://example.com/releases/download/v1.8.2/cbpifw-x_v1.8.2_update.bin"),
            "cbpifw-x_v1.8.2_update.bin"
        );
        assert_eq!(
            asset_name_from_url("https://example.com/fw/a_update.bin?token=abc"),
            "a_update.bin"
        );
        assert_eq!(asset_name_from_url("relative/dir/b_update.bin"), "b_update.bin");
    }
}
