//! ---
//! ota_section: "04-local-interfaces"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Local HTTP control surface over a Unix domain socket."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
//! Unix-socket HTTP adapter exposing update checks, installation, status, and
//! metrics of an [`UpdateManager`] to local clients.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use otad_core::{ManagerError, ManagerStatus, SharedRegistry, Update, UpdateManager};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tokio::net::UnixListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Shared state handed to every request handler.
pub struct ApiState {
    manager: Arc<UpdateManager>,
    registry: Option<SharedRegistry>,
    cancel: CancellationToken,
}

impl ApiState {
    /// `cancel` aborts installations started through the adapter.
    pub fn new(
        manager: Arc<UpdateManager>,
        registry: Option<SharedRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            manager,
            registry,
            cancel,
        }
    }

    async fn ensure_idle(&self) -> Result<(), ApiError> {
        match self.manager.status().await? {
            ManagerStatus::Idle => Ok(()),
            ManagerStatus::Installing => Err(ApiError::new(
                StatusCode::CONFLICT,
                "an update is already being installed",
            )),
        }
    }
}

impl fmt::Debug for ApiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiState")
            .field("manager", &self.manager)
            .field("metrics", &self.registry.is_some())
            .finish_non_exhaustive()
    }
}

/// Handle to the running socket server.
#[derive(Debug)]
pub struct ApiServer {
    socket_path: PathBuf,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl ApiServer {
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Stop accepting requests, wait for the server task and remove the socket file.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let result = match self.task.await {
            Ok(result) => result,
            Err(err) => Err(err.into()),
        };
        remove_stale_socket(&self.socket_path)?;
        result
    }
}

/// Routes of the adapter, without a listener.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/update", post(post_update))
        .route("/update/check", get(get_check))
        .route("/update/status", get(get_status))
        .route("/update/progress", get(get_progress))
        .route("/metrics", get(get_metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve the adapter on `socket_path`, replacing a stale socket file.
pub fn spawn_socket_server(state: Arc<ApiState>, socket_path: &Path) -> Result<ApiServer> {
    remove_stale_socket(socket_path)?;
    if let Some(parent) = socket_path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create socket directory {}", parent.display()))?;
    }
    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("failed to bind API socket {}", socket_path.display()))?;

    let router = router(state);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let path = socket_path.to_path_buf();
    let task: JoinHandle<Result<()>> = tokio::spawn(async move {
        info!(socket = %path.display(), "api server listening");
        if let Err(err) = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
        {
            error!(socket = %path.display(), error = %err, "api server exited with error");
            return Err(err.into());
        }
        Ok(())
    });

    Ok(ApiServer {
        socket_path: socket_path.to_path_buf(),
        shutdown: Some(shutdown_tx),
        task,
    })
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(socket = %path.display(), "removed socket file");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove socket {}", path.display())),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateView {
    version: String,
    release_date: Option<DateTime<Utc>>,
    name: String,
    notes: String,
    prerelease: bool,
}

impl From<Update> for UpdateView {
    fn from(update: Update) -> Self {
        Self {
            version: update.version.to_string(),
            release_date: update.release_date,
            name: update.name,
            notes: update.notes,
            prerelease: update.prerelease,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    status: ManagerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    progress: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_update: Option<UpdateView>,
}

#[derive(Debug, Serialize)]
struct ProgressResponse {
    progress: i32,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<ManagerError> for ApiError {
    fn from(err: ManagerError) -> Self {
        match err {
            ManagerError::NoSuitableUpdate => Self::new(StatusCode::NOT_FOUND, "no update"),
            ManagerError::NoOperationInProgress => {
                Self::new(StatusCode::CONFLICT, err.to_string())
            }
            other => {
                let message = other.report();
                error!(error = %message, "update request failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

async fn get_check(State(state): State<Arc<ApiState>>) -> Result<Json<UpdateView>, ApiError> {
    state.ensure_idle().await?;
    let resolved = state.manager.check_for_update().await?;
    Ok(Json(resolved.update.into()))
}

async fn get_status(State(state): State<Arc<ApiState>>) -> Result<Json<StatusResponse>, ApiError> {
    let status = state.manager.status().await?;
    let response = match status {
        ManagerStatus::Installing => StatusResponse {
            status,
            progress: match state.manager.progress().await {
                Ok(progress) => Some(progress),
                Err(ManagerError::NoOperationInProgress) => None,
                Err(err) => return Err(err.into()),
            },
            next_update: None,
        },
        ManagerStatus::Idle => StatusResponse {
            status,
            progress: None,
            next_update: match state.manager.check_for_update().await {
                Ok(resolved) => Some(resolved.update.into()),
                Err(ManagerError::NoSuitableUpdate) => None,
                Err(err) => return Err(err.into()),
            },
        },
    };
    Ok(Json(response))
}

async fn post_update(
    State(state): State<Arc<ApiState>>,
) -> Result<(StatusCode, Json<StatusResponse>), ApiError> {
    state.ensure_idle().await?;

    let mut progress = state
        .manager
        .install_next_update_async(state.cancel.child_token(), |result| match result {
            Ok(()) => info!("update installed, reboot to activate"),
            Err(err) => warn!(error = %err.report(), "update installation failed"),
        });
    tokio::spawn(async move {
        while let Some(percentage) = progress.recv().await {
            debug!(progress = percentage, "install progress");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(StatusResponse {
            status: ManagerStatus::Installing,
            progress: None,
            next_update: None,
        }),
    ))
}

async fn get_progress(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<ProgressResponse>, ApiError> {
    let progress = state.manager.progress().await?;
    Ok(Json(ProgressResponse { progress }))
}

async fn get_metrics(State(state): State<Arc<ApiState>>) -> Result<Response, ApiError> {
    let registry = state
        .registry
        .as_ref()
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "metrics disabled"))?;
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(([(header::CONTENT_TYPE, encoder.format_type().to_owned())], buffer).into_response())
}
