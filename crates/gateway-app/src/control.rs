use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use commands::{CommandDispatcher, CommandError};
use gateway_client::GatewayTransport;
use session::SessionHandle;

/// Fire-and-forget entry point for the two control operations.
///
/// Callers get a join handle at most; the outcome only shows up in logs and in
/// later telemetry.
pub struct ControlHandle<T> {
    commands: Arc<CommandDispatcher<T>>,
    session: SessionHandle,
}

impl<T> Clone for ControlHandle<T> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            session: self.session.clone(),
        }
    }
}

impl<T: GatewayTransport + 'static> ControlHandle<T> {
    pub fn new(commands: Arc<CommandDispatcher<T>>, session: SessionHandle) -> Self {
        Self { commands, session }
    }

    pub fn set_mode(&self, mode: impl Into<String>) -> JoinHandle<()> {
        let commands = self.commands.clone();
        let mode = mode.into();
        tokio::spawn(async move {
            match commands.set_mode(&mode).await {
                Ok(outcome) => info!(mode = %mode, ?outcome, "mode change sent"),
                Err(err) if already_reported(&err) => {
                    debug!(mode = %mode, error = %err, "mode change not applied")
                }
                Err(err) => warn!(mode = %mode, error = %err, "mode change failed"),
            }
        })
    }

    pub fn set_reserve_percent(&self, percent: i64) -> JoinHandle<()> {
        let commands = self.commands.clone();
        tokio::spawn(async move {
            match commands.set_reserve_percent(percent).await {
                Ok(outcome) => info!(percent, ?outcome, "reserve change sent"),
                Err(err) if already_reported(&err) => {
                    debug!(percent, error = %err, "reserve change not applied")
                }
                Err(err) => warn!(percent, error = %err, "reserve change failed"),
            }
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_authenticated()
    }

    pub fn reserve_percent(&self) -> u8 {
        self.commands.reserve_percent().value()
    }
}

/// Outcomes the dispatcher has logged itself.
fn already_reported(err: &CommandError) -> bool {
    matches!(
        err,
        CommandError::NotAuthenticated
            | CommandError::InvalidValue(_)
            | CommandError::RepeatedAuthFailure { .. }
    )
}

#[derive(Debug, Deserialize)]
pub struct ModeRequest {
    pub mode: String,
}

#[derive(Debug, Deserialize)]
pub struct ReserveRequest {
    pub percent: i64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct HealthResponse {
    pub authenticated: bool,
    pub reserve_percent: u8,
}

pub fn router<T: GatewayTransport + 'static>(handle: ControlHandle<T>) -> Router {
    Router::new()
        .route("/health", get(get_health::<T>))
        .route("/mode", post(post_mode::<T>))
        .route("/reserve", post(post_reserve::<T>))
        .with_state(handle)
}

async fn get_health<T: GatewayTransport + 'static>(
    State(handle): State<ControlHandle<T>>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        authenticated: handle.is_authenticated(),
        reserve_percent: handle.reserve_percent(),
    })
}

async fn post_mode<T: GatewayTransport + 'static>(
    State(handle): State<ControlHandle<T>>,
    Json(request): Json<ModeRequest>,
) -> StatusCode {
    handle.set_mode(request.mode);
    StatusCode::ACCEPTED
}

async fn post_reserve<T: GatewayTransport + 'static>(
    State(handle): State<ControlHandle<T>>,
    Json(request): Json<ReserveRequest>,
) -> StatusCode {
    handle.set_reserve_percent(request.percent);
    StatusCode::ACCEPTED
}

/// Running control listener.
pub struct ControlServer {
    address: SocketAddr,
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl ControlServer {
    pub async fn spawn<T: GatewayTransport + 'static>(
        listen: SocketAddr,
        handle: ControlHandle<T>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(listen).await?;
        let address = listener.local_addr()?;
        info!(address = %address, "control api listening");

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let server = axum::serve(listener, router(handle)).with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });
        let task = tokio::spawn(async move {
            if let Err(err) = server.await {
                warn!(error = %err, "control api exited with error");
            }
        });

        Ok(Self {
            address,
            task,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!(error = %err, "control api task join failed");
        }
    }
}
