//! ---
//! ota_section: "02-release-index"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Release data model and release index sources."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Release metadata consumed by the update manager: the [`update::Update`] and
//! [`update::Bundle`] model, the [`update::ReleaseIndex`] capability with its
//! GitHub and local-feed sources, and helpers for reading the installed OS version.

pub mod feed;
pub mod github;
pub mod semver;
pub mod update;

pub use feed::FeedReleaseIndex;
pub use github::GitHubReleaseIndex;
pub use update::{Bundle, ReleaseIndex, Update};
