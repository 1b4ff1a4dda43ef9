//! ---
//! ota_section: "03-update-orchestration"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Candidate selection for the next installable update."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
use otad_versioning::{Bundle, Update};
use semver::Version;
use tracing::{debug, info};

use crate::artifact::{asset_name_from_url, is_update_bundle};

/// Derives a compatibility tag from an asset name.
pub type CompatibilityExtractor = fn(&str) -> String;

/// Selection rules applied to release index candidates.
#[derive(Debug, Clone, Copy)]
pub struct Selection<'a> {
    pub current: &'a Version,
    pub compatible: &'a str,
    pub allow_prerelease: bool,
    pub extract_compatibility: CompatibilityExtractor,
}

/// Fill in the asset name and compatibility tag of a bundle when the index left them empty.
pub fn prepare_bundle(bundle: &mut Bundle, extract_compatibility: CompatibilityExtractor) {
    if bundle.asset_name.is_empty() {
        bundle.asset_name = asset_name_from_url(&bundle.url);
    }
    if bundle.compatibility.is_none() {
        bundle.compatibility = Some(extract_compatibility(&bundle.asset_name));
    }
}

/// First bundle of `update` that is an update bundle for `compatible`.
///
/// Bundles are matched on the tag set by [`prepare_bundle`]; a bundle without
/// one never matches.
pub fn matching_bundle<'u>(update: &'u Update, compatible: &str) -> Option<&'u Bundle> {
    update.bundles.iter().find(|bundle| {
        is_update_bundle(&bundle.asset_name) && bundle.compatibility.as_deref() == Some(compatible)
    })
}

/// Pick the lowest-versioned candidate newer than the current version that
/// carries a bundle for this device.
///
/// Candidates are sorted ascending (stable) first; a newer qualifying
/// candidate is never chosen over an older one, so intermediate releases are
/// installed in order.
pub fn select_update(mut candidates: Vec<Update>, rules: Selection<'_>) -> Option<(Update, Bundle)> {
    candidates.sort_by(|a, b| a.version.cmp(&b.version));

    for mut update in candidates {
        if update.version <= *rules.current {
            continue;
        }
        if update.prerelease && !rules.allow_prerelease {
            info!(update_version = %update.version, update_name = %update.name, "skipping prerelease");
            continue;
        }
        for bundle in &mut update.bundles {
            prepare_bundle(bundle, rules.extract_compatibility);
        }
        let found = matching_bundle(&update, rules.compatible).cloned();
        match found {
            Some(bundle) => {
                info!(
                    update_version = %update.version,
                    update_name = %update.name,
                    bundle_url = %bundle.url,
                    "identified possible next update"
                );
                return Some((update, bundle));
            }
            None => {
                debug!(
                    update_version = %update.version,
                    update_name = %update.name,
                    "possible update has no compatible update bundles"
                );
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::extract_compatibility;

    const COMPAT: &str = "cbpifw-raspberrypi3-64";

    fn rules(current: &Version) -> Selection<'_> {
        Selection {
            current,
            compatible: COMPAT,
            allow_prerelease: false,
            extract_compatibility,
        }
    }

    fn release(version: &str) -> Update {
        let version = Version::parse(version).unwrap();
        let asset = format!("{COMPAT}_v{version}_update.bin");
        Update::new(version).with_bundle(
            Bundle::new(format!("https://example.com/{asset}")).with_asset_name(asset),
        )
    }

    #[test]
    fn lowest_qualifying_candidate_wins_regardless_of_index_order() {
        let current = Version::new(1, 8, 1);
        let candidates = vec![release("2.0.0"), release("1.9.0"), release("1.8.0"), release("1.8.2")];
        let (update, _) = select_update(candidates, rules(&current)).unwrap();
        assert_eq!(update.version, Version::new(1, 8, 2));
    }

    #[test]
    fn equal_version_does_not_qualify() {
        let current = Version::new(1, 8, 2);
        assert!(select_update(vec![release("1.8.2")], rules(&current)).is_none());
    }

    #[test]
    fn candidates_without_matching_bundle_are_passed_over() {
        let current = Version::new(1, 0, 0);
        let other_board = Update::new(Version::new(1, 1, 0)).with_bundle(
            Bundle::new("https://example.com/otherboard_v1.1.0_update.bin")
                .with_asset_name("otherboard_v1.1.0_update.bin"),
        );
        let full_image = Update::new(Version::new(1, 2, 0)).with_bundle(
            Bundle::new("https://example.com/x.img").with_asset_name(format!("{COMPAT}_v1.2.0.img")),
        );
        let candidates = vec![other_board, full_image, release("1.3.0")];
        let (update, bundle) = select_update(candidates, rules(&current)).unwrap();
        assert_eq!(update.version, Version::new(1, 3, 0));
        assert_eq!(bundle.compatibility.as_deref(), Some(COMPAT));
    }

    #[test]
    fn prerelease_requires_opt_in() {
        let current = Version::new(1, 0, 0);
        let candidates = vec![release("1.1.0").prerelease(true), release("1.2.0")];
        let (update, _) = select_update(candidates.clone(), rules(&current)).unwrap();
        assert_eq!(update.version, Version::new(1, 2, 0));

        let permissive = Selection {
            allow_prerelease: true,
            ..rules(&current)
        };
        let (update, _) = select_update(candidates, permissive).unwrap();
        assert_eq!(update.version, Version::new(1, 1, 0));
    }

    #[test]
    fn empty_asset_name_is_backfilled_from_url() {
        let current = Version::new(1, 8, 1);
        let update = Update::new(Version::new(1, 8, 2))
            .with_bundle(Bundle::new("https://example.com/dl/cbpifw-x_v1.8.2_update.bin"));
        let selection = Selection {
            compatible: "cbpifw-x",
            ..rules(&current)
        };
        let (selected, bundle) = select_update(vec![update], selection).unwrap();
        assert_eq!(bundle.asset_name, "cbpifw-x_v1.8.2_update.bin");
        assert_eq!(bundle.compatibility.as_deref(), Some("cbpifw-x"));
        assert_eq!(selected.bundles[0], bundle);
    }

    #[test]
    fn explicit_compatibility_is_not_overwritten() {
        let mut bundle = Bundle::new("https://example.com/a_update.bin").with_compatibility("custom");
        prepare_bundle(&mut bundle, extract_compatibility);
        assert_eq!(bundle.asset_name, "a_update.bin");
        assert_eq!(bundle.compatibility.as_deref(), Some("custom"));
    }

    #[test]
    fn matching_uses_prepared_tag_only() {
        let mut update = Update::new(Version::new(1, 8, 2))
            .with_bundle(Bundle::new(format!("https://example.com/{COMPAT}_v1.8.2_update.bin")));
        assert!(matching_bundle(&update, COMPAT).is_none());

        prepare_bundle(&mut update.bundles[0], extract_compatibility);
        assert!(matching_bundle(&update, COMPAT).is_some());
        assert!(matching_bundle(&update, "otherboard").is_none());

        update.bundles[0].compatibility = Some("otherboard".to_owned());
        assert!(matching_bundle(&update, COMPAT).is_none());
    }
}
