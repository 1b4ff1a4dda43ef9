//! ---
//! ota_section: "04-local-interfaces"
//! ota_subsection: "tests"
//! ota_type: "source"
//! ota_scope: "test"
//! ota_description: "D-Bus adapter method behaviour against the in-memory doubles."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use otad_core::{Update, UpdateManager};
use otad_dbus::{next_update, start_install, UpdateBusError};
use otad_testharness::{release_for, FakeBackend, StaticReleaseIndex, DEFAULT_COMPATIBLE};
use tokio_util::sync::CancellationToken;

fn manager(backend: &Arc<FakeBackend>, updates: Vec<Update>) -> Arc<UpdateManager> {
    Arc::new(
        UpdateManager::builder(Arc::new(StaticReleaseIndex::new(updates)))
            .backend(backend.clone())
            .build()
            .unwrap(),
    )
}

fn installed(version: &str) -> Arc<FakeBackend> {
    Arc::new(FakeBackend::new(DEFAULT_COMPATIBLE).with_installed_version(version))
}

#[tokio::test]
async fn next_update_returns_string_map() {
    let backend = installed("1.8.1");
    let manager = manager(
        &backend,
        vec![release_for(DEFAULT_COMPATIBLE, "1.8.2").with_name("Penguin")],
    );

    let fields = next_update(&manager).await.unwrap();
    assert_eq!(fields["version"], "1.8.2");
    assert_eq!(fields["name"], "Penguin");
}

#[tokio::test]
async fn next_update_without_candidate_is_no_update_error() {
    let backend = installed("1.8.2");
    let manager = manager(&backend, vec![release_for(DEFAULT_COMPATIBLE, "1.8.2")]);

    assert!(matches!(
        next_update(&manager).await,
        Err(UpdateBusError::NoUpdate(_))
    ));
}

#[tokio::test]
async fn install_starts_in_background() {
    let backend = installed("1.8.1");
    let release = release_for(DEFAULT_COMPATIBLE, "1.8.2");
    let expected_url = release.bundles[0].url.clone();
    let manager = manager(&backend, vec![release]);

    start_install(&manager, CancellationToken::new()).await.unwrap();

    for _ in 0..100 {
        if !backend.installs().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(backend.installs(), vec![expected_url]);
}

#[tokio::test]
async fn install_is_rejected_while_busy() {
    let backend = installed("1.8.1");
    backend.set_operation("installing");
    let manager = manager(&backend, vec![release_for(DEFAULT_COMPATIBLE, "1.8.2")]);

    assert!(matches!(
        start_install(&manager, CancellationToken::new()).await,
        Err(UpdateBusError::Busy(_))
    ));
    assert!(backend.installs().is_empty());
}
