//! ---
//! ota_section: "04-local-interfaces"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "D-Bus control surface with the UpdateAvailable signal."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
//! D-Bus adapter exposing an [`UpdateManager`] on the system or session bus.
//!
//! The `org.otad.Update1` interface at [`OBJECT_PATH`] offers `NextUpdate`,
//! `InstallNextUpdateAsync`, `Status`, `Progress`, the `AvailableUpdate`
//! property, and emits `UpdateAvailable` for every update the scheduled check
//! finds.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use otad_common::config::{BusKind, DbusConfig};
use otad_core::{ManagerError, ManagerStatus, Update, UpdateManager};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zbus::object_server::SignalContext;
use zbus::{connection, interface, Connection, DBusError};

/// Object path the update interface is served at.
pub const OBJECT_PATH: &str = "/org/otad/Update1";

/// Update description as carried by `NextUpdate`, `AvailableUpdate` and `UpdateAvailable`.
pub type UpdateFields = HashMap<String, String>;

/// Errors returned to D-Bus callers.
#[derive(Debug, DBusError)]
#[zbus(prefix = "org.otad.Update1.Error")]
pub enum UpdateBusError {
    #[zbus(error)]
    ZBus(zbus::Error),
    /// Nothing newer and compatible is published.
    NoUpdate(String),
    /// An installation is already running, or none is when progress is asked for.
    Busy(String),
    Failed(String),
}

impl From<ManagerError> for UpdateBusError {
    fn from(err: ManagerError) -> Self {
        match err {
            ManagerError::NoSuitableUpdate => Self::NoUpdate(err.to_string()),
            ManagerError::NoOperationInProgress => Self::Busy(err.to_string()),
            other => {
                let message = other.report();
                error!(error = %message, "d-bus request failed");
                Self::Failed(message)
            }
        }
    }
}

/// Flatten `update` into the string map handed to D-Bus clients.
pub fn update_fields(update: &Update) -> UpdateFields {
    let release_date = update
        .release_date
        .map(|date| date.to_rfc3339())
        .unwrap_or_default();
    HashMap::from([
        ("name".to_owned(), update.name.clone()),
        ("notes".to_owned(), update.notes.clone()),
        ("version".to_owned(), update.version.to_string()),
        ("releaseDate".to_owned(), release_date),
        ("prerelease".to_owned(), update.prerelease.to_string()),
    ])
}

/// Resolve the next update for `NextUpdate`.
pub async fn next_update(manager: &UpdateManager) -> Result<UpdateFields, UpdateBusError> {
    let resolved = manager.check_for_update().await?;
    Ok(update_fields(&resolved.update))
}

/// Start a background installation of the next update for `InstallNextUpdateAsync`.
pub async fn start_install(
    manager: &Arc<UpdateManager>,
    cancel: CancellationToken,
) -> Result<(), UpdateBusError> {
    if manager.status().await? == ManagerStatus::Installing {
        return Err(UpdateBusError::Busy(
            "an update is already being installed".to_owned(),
        ));
    }
    let mut progress = manager.install_next_update_async(cancel, |result| match result {
        Ok(()) => info!("update installed, reboot to activate"),
        Err(err) => warn!(error = %err.report(), "update installation failed"),
    });
    tokio::spawn(async move {
        while let Some(percentage) = progress.recv().await {
            debug!(progress = percentage, "install progress");
        }
    });
    Ok(())
}

struct UpdateInterface {
    manager: Arc<UpdateManager>,
    cancel: CancellationToken,
}

#[interface(name = "org.otad.Update1")]
impl UpdateInterface {
    async fn next_update(&self) -> Result<UpdateFields, UpdateBusError> {
        next_update(&self.manager).await
    }

    async fn install_next_update_async(&self) -> Result<(), UpdateBusError> {
        start_install(&self.manager, self.cancel.child_token()).await
    }

    async fn status(&self) -> Result<String, UpdateBusError> {
        Ok(self.manager.status().await?.to_string())
    }

    async fn progress(&self) -> Result<i32, UpdateBusError> {
        Ok(self.manager.progress().await?)
    }

    /// Last update found by a check; empty when none was found yet.
    #[zbus(property)]
    async fn available_update(&self) -> UpdateFields {
        self.manager
            .next_update()
            .map(|update| update_fields(&update))
            .unwrap_or_default()
    }

    #[zbus(signal)]
    async fn update_available(ctxt: &SignalContext<'_>, update: UpdateFields) -> zbus::Result<()>;
}

/// Handle to the exported interface and its signal forwarder.
pub struct DbusServer {
    connection: Connection,
    forwarder: JoinHandle<()>,
    cancel: CancellationToken,
}

impl fmt::Debug for DbusServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbusServer")
            .field("unique_name", &self.connection.unique_name())
            .finish_non_exhaustive()
    }
}

impl DbusServer {
    /// Stop forwarding notifications and leave the bus.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        self.forwarder.await.context("d-bus signal forwarder failed")?;
        drop(self.connection);
        info!("d-bus server stopped");
        Ok(())
    }
}

/// Export the update interface on the configured bus and request the service name.
///
/// `cancel` aborts installations started over D-Bus and stops the signal forwarder.
pub async fn spawn_dbus_server(
    manager: Arc<UpdateManager>,
    config: &DbusConfig,
    cancel: CancellationToken,
) -> Result<DbusServer> {
    let builder = match config.bus {
        BusKind::System => connection::Builder::system(),
        BusKind::Session => connection::Builder::session(),
    }
    .context("failed to connect to d-bus")?;

    let mut updates = manager.subscribe();
    let interface = UpdateInterface {
        manager,
        cancel: cancel.clone(),
    };
    let connection = builder
        .name(config.service_name.as_str())
        .with_context(|| format!("invalid d-bus service name {}", config.service_name))?
        .serve_at(OBJECT_PATH, interface)
        .context("failed to export update interface")?
        .build()
        .await
        .with_context(|| format!("failed to acquire d-bus name {}", config.service_name))?;
    info!(service = %config.service_name, path = OBJECT_PATH, "d-bus server listening");

    let iface_ref = connection
        .object_server()
        .interface::<_, UpdateInterface>(OBJECT_PATH)
        .await
        .context("update interface missing from object server")?;
    let forwarder_cancel = cancel.clone();
    let forwarder = tokio::spawn(async move {
        loop {
            let update = tokio::select! {
                biased;
                _ = forwarder_cancel.cancelled() => break,
                update = updates.recv() => match update {
                    Some(update) => update,
                    None => break,
                },
            };
            let ctxt = iface_ref.signal_context();
            if let Err(err) = UpdateInterface::update_available(ctxt, update_fields(&update)).await {
                error!(error = %err, "failed to emit UpdateAvailable");
            }
            let iface = iface_ref.get().await;
            if let Err(err) = iface.available_update_changed(ctxt).await {
                debug!(error = %err, "failed to announce AvailableUpdate change");
            }
        }
    });

    Ok(DbusServer {
        connection,
        forwarder,
        cancel,
    })
}
