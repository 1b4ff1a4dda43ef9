//! ---
//! ota_section: "03-update-orchestration"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Update backend capability consumed by the manager."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;

/// Backend operation reported while a bundle is being installed.
pub const OPERATION_INSTALLING: &str = "installing";

/// Slot attribute carrying the version of the bundle installed into the slot.
pub const BUNDLE_VERSION_ATTRIBUTE: &str = "bundle.version";

/// Slot attribute carrying the bootloader name of the slot.
pub const BOOTNAME_ATTRIBUTE: &str = "bootname";

/// Status of one boot slot as reported by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotStatus {
    pub name: String,
    pub attributes: BTreeMap<String, String>,
}

impl SlotStatus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Whether this slot is the one identified by the backend's boot slot.
    pub fn is_boot_slot(&self, boot_slot: &str) -> bool {
        self.name == boot_slot || self.attribute(BOOTNAME_ATTRIBUTE) == Some(boot_slot)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallOptions {
    /// Let the backend install bundles whose compatible string differs from the system's.
    pub ignore_incompatible: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallProgress {
    /// Completion in percent, 0–100.
    pub percentage: i32,
    pub message: String,
    /// Nesting depth of the step that produced `message`.
    pub depth: i32,
}

/// On-device daemon that tracks boot slots and installs bundles.
#[async_trait]
pub trait UpdateBackend: Send + Sync {
    /// Name of the slot the system booted from.
    async fn boot_slot(&self) -> Result<String>;

    async fn slot_status(&self) -> Result<Vec<SlotStatus>>;

    /// Compatibility string of this device.
    async fn compatible(&self) -> Result<String>;

    /// Install the bundle at `url`; resolves once the backend finished.
    async fn install_bundle(&self, url: &str, options: InstallOptions) -> Result<()>;

    async fn progress(&self) -> Result<InstallProgress>;

    /// Current backend operation, e.g. `idle` or `installing`.
    async fn operation(&self) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_slot_matches_name_or_bootname() {
        let slot = SlotStatus::new("rootfs.0").with_attribute(BOOTNAME_ATTRIBUTE, "A");
        assert!(slot.is_boot_slot("rootfs.0"));
        assert!(slot.is_boot_slot("A"));
        assert!(!slot.is_boot_slot("B"));
    }
}
