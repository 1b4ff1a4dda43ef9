//! ---
//! ota_section: "03-update-orchestration"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Update resolution and installation orchestration."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
//! The update manager: decides whether the release index offers a newer,
//! compatible bundle for this device and drives the update backend to
//! install it, streaming progress to local clients.

pub mod artifact;
pub mod backend;
pub mod busctl;
pub mod error;
pub mod install;
pub mod manager;
pub mod metrics;
pub mod notify;
pub mod resolve;

pub use artifact::{asset_name_from_url, extract_compatibility, is_update_bundle};
pub use backend::{InstallOptions, InstallProgress, SlotStatus, UpdateBackend};
pub use busctl::BusctlBackend;
pub use error::{ManagerError, Result};
pub use install::ProgressStream;
pub use manager::{ManagerStatus, ResolvedUpdate, UpdateManager, UpdateManagerBuilder};
pub use metrics::{new_registry, ManagerMetrics, SharedRegistry};
pub use otad_versioning::{Bundle, ReleaseIndex, Update};
