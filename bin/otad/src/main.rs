//! ---
//! ota_section: "06-daemon"
//! ota_subsection: "binary"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Binary entrypoint for the otad update daemon."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use otad_api::{spawn_socket_server, ApiServer, ApiState};
use otad_common::config::{AppConfig, RepositoryConfig, RepositorySource};
use otad_common::logging::init_tracing;
use otad_common::version::VersionInfo;
use otad_core::{
    new_registry, BusctlBackend, ManagerError, ManagerMetrics, ManagerStatus, ReleaseIndex,
    SharedRegistry, UpdateManager, UpdateManagerBuilder,
};
use otad_dbus::{spawn_dbus_server, DbusServer};
use otad_versioning::{FeedReleaseIndex, GitHubReleaseIndex};
use tokio::signal;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    disable_version_flag = true,
    about = "Over-the-air update daemon for RAUC based devices",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(
        short = 'V',
        long = "version",
        action = ArgAction::SetTrue,
        help = "Print extended version information and exit"
    )]
    version: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the daemon with scheduled checks and the local API")]
    Run,
    #[command(about = "Check for an update but do not install it")]
    Check,
    #[command(about = "Install the next update and report progress")]
    Install,
    #[command(about = "Print the state of the update backend")]
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let version = VersionInfo::current();
    if cli.version {
        println!("{}", version.extended());
        return Ok(());
    }

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.extend(AppConfig::DEFAULT_CANDIDATES.into_iter().map(PathBuf::from));
    let loaded = AppConfig::load_with_source(&candidates)?;
    let config = loaded.config;
    init_tracing("otad", &config.logging)?;
    info!(
        config_path = %loaded.source.display(),
        version = %version.banner(),
        "configuration loaded"
    );

    let registry = config.metrics.enabled.then(new_registry);
    let manager = Arc::new(build_manager(&config, registry.clone())?);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(&config, manager, registry).await?,
        Commands::Check => check(&manager).await?,
        Commands::Install => install(&manager).await?,
        Commands::Status => status(&manager).await?,
    }

    Ok(())
}

fn build_index(config: &RepositoryConfig) -> Result<Arc<dyn ReleaseIndex>> {
    match config.source {
        RepositorySource::GitHub => {
            let github = config
                .github
                .as_ref()
                .context("repository.github section is required for the github source")?;
            info!(owner = %github.owner, repo = %github.repo, "using github release index");
            Ok(Arc::new(GitHubReleaseIndex::from_config(github)?))
        }
        RepositorySource::Feed => {
            info!(feed_path = %config.feed_path.display(), "using local release feed");
            Ok(Arc::new(FeedReleaseIndex::new(&config.feed_path)))
        }
    }
}

fn build_manager(config: &AppConfig, registry: Option<SharedRegistry>) -> Result<UpdateManager> {
    let index = build_index(&config.repository)?;
    let mut builder = UpdateManagerBuilder::from_config(index, &config.manager)
        .backend(Arc::new(BusctlBackend::from_config(&config.backend)));
    if let Some(registry) = registry {
        builder = builder.metrics(
            ManagerMetrics::new(registry).context("failed to register manager metrics")?,
        );
    }
    builder.build()
}

async fn run_daemon(
    config: &AppConfig,
    manager: Arc<UpdateManager>,
    registry: Option<SharedRegistry>,
) -> Result<()> {
    let cancel = CancellationToken::new();

    manager.register_update_available_callback(|update| {
        info!(update_version = %update.version, update_name = %update.name, "update available");
    });
    let periodic = manager.start(cancel.child_token());
    if periodic.is_none() {
        info!("periodic update check disabled by configuration");
    }

    let mut dbus_server: Option<DbusServer> = None;
    if config.dbus.enabled {
        match spawn_dbus_server(Arc::clone(&manager), &config.dbus, cancel.child_token()).await {
            Ok(server) => dbus_server = Some(server),
            Err(err) => warn!(error = %format!("{err:#}"), "failed to start d-bus server"),
        }
    } else {
        info!("d-bus server disabled by configuration");
    }

    let mut api_server: Option<ApiServer> = None;
    if config.http.enabled {
        let state = Arc::new(ApiState::new(
            Arc::clone(&manager),
            registry,
            cancel.child_token(),
        ));
        match spawn_socket_server(state, &config.http.socket_path) {
            Ok(server) => api_server = Some(server),
            Err(err) => warn!(error = %format!("{err:#}"), "failed to start api server"),
        }
    } else {
        info!("api server disabled by configuration");
    }

    info!("daemon running; waiting for termination signal");
    shutdown_signal().await?;
    info!("termination signal received; shutting down");
    cancel.cancel();

    if let Some(handle) = periodic {
        handle.await.context("periodic check task failed")?;
    }
    if let Some(server) = api_server {
        server.shutdown().await?;
    }
    if let Some(server) = dbus_server {
        server.shutdown().await?;
    }
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = signal::ctrl_c() => result.context("failed to listen for ctrl-c"),
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    signal::ctrl_c().await.context("failed to listen for ctrl-c")
}

async fn check(manager: &UpdateManager) -> Result<()> {
    match manager.check_for_update().await {
        Ok(resolved) => {
            println!(
                "Update available: {} ({})\nBundle: {}",
                resolved.update.version, resolved.update.name, resolved.bundle.url
            );
            Ok(())
        }
        Err(err) if err.is_no_suitable_update() => {
            println!("No update available");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

async fn install(manager: &Arc<UpdateManager>) -> Result<()> {
    if manager.status().await? == ManagerStatus::Installing {
        anyhow::bail!("an update is already being installed");
    }

    let cancel = CancellationToken::new();
    let (done_tx, done_rx) = oneshot::channel();
    let mut progress = manager.install_next_update_async(cancel.clone(), move |result| {
        let _ = done_tx.send(result);
    });

    loop {
        tokio::select! {
            sample = progress.recv() => match sample {
                Some(percentage) => println!("Progress: {percentage}%"),
                None => break,
            },
            _ = signal::ctrl_c() => {
                warn!("installation interrupted");
                cancel.cancel();
            }
        }
    }

    match done_rx.await.context("installer task vanished")? {
        Ok(()) => {
            println!("Update installed; reboot to activate");
            Ok(())
        }
        Err(ManagerError::NoSuitableUpdate) => {
            println!("No update available");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

async fn status(manager: &UpdateManager) -> Result<()> {
    let status = manager.status().await?;
    println!("Status: {status}");
    if status == ManagerStatus::Installing {
        match manager.progress().await {
            Ok(progress) => println!("Progress: {progress}%"),
            Err(ManagerError::NoOperationInProgress) => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}
