use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use metrics::counter;
use thiserror::Error;
use tracing::{error, info, warn};

use gateway_client::{GatewayTransport, RequestAuth};
use gateway_types::{paths, AuthToken, OperatingMode, OperationRequest, ReservePercent, ValueError};
use session::SessionManager;

#[derive(Debug, Clone)]
pub struct CommandConfig {
    /// Re-authentications allowed per command after the gateway rejects the token.
    pub max_auth_retries: u32,
    pub initial_reserve: ReservePercent,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            max_auth_retries: 1,
            initial_reserve: ReservePercent::DEFAULT,
        }
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("not authenticated with the gateway")]
    NotAuthenticated,
    #[error(transparent)]
    InvalidValue(#[from] ValueError),
    #[error("gateway kept rejecting the session after {attempts} attempts")]
    RepeatedAuthFailure { attempts: u32 },
    #[error("failed to encode operation: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The operation was posted and the commit call was issued.
    Committed,
}

#[derive(Debug, Clone, Copy)]
enum Command {
    Mode(OperatingMode),
    Reserve(ReservePercent),
}

/// Sends operating-mode changes to the gateway.
///
/// Each command runs guard, send, then either commit or re-authenticate and
/// start over. The restart count is bounded by `max_auth_retries`.
pub struct CommandDispatcher<T> {
    transport: Arc<T>,
    sessions: Arc<SessionManager<T>>,
    reserve: AtomicU8,
    max_auth_retries: u32,
}

impl<T: GatewayTransport> CommandDispatcher<T> {
    pub fn new(transport: Arc<T>, sessions: Arc<SessionManager<T>>, config: CommandConfig) -> Self {
        Self {
            transport,
            sessions,
            reserve: AtomicU8::new(config.initial_reserve.value()),
            max_auth_retries: config.max_auth_retries,
        }
    }

    /// Reserve used for non-backup modes.
    pub fn reserve_percent(&self) -> ReservePercent {
        ReservePercent::new(i64::from(self.reserve.load(Ordering::Relaxed)))
            .unwrap_or_default()
    }

    pub async fn set_mode(&self, mode: &str) -> Result<CommandOutcome, CommandError> {
        let mode = mode.parse::<OperatingMode>().map_err(|err| {
            error!(error = %err, "cannot set mode");
            CommandError::from(err)
        })?;
        self.dispatch(Command::Mode(mode)).await
    }

    /// Stores the reserve for later mode changes and switches to self
    /// consumption with it.
    pub async fn set_reserve_percent(&self, percent: i64) -> Result<CommandOutcome, CommandError> {
        let reserve = ReservePercent::new(percent).map_err(|err| {
            error!(error = %err, "cannot set reserve percent");
            CommandError::from(err)
        })?;
        self.dispatch(Command::Reserve(reserve)).await
    }

    async fn dispatch(&self, command: Command) -> Result<CommandOutcome, CommandError> {
        counter!("gateway_commands_total").increment(1);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let Some(token) = self.sessions.handle().token() else {
                error!(?command, "cannot send command, not authenticated");
                return Err(CommandError::NotAuthenticated);
            };

            let request = self.operation(command);
            let body = serde_json::to_value(&request)?;
            info!(?command, body = %body, attempt = attempts, "posting operation");

            match self
                .transport
                .post_json(paths::OPERATION, &body, RequestAuth::Bearer(&token))
                .await
            {
                Ok(response) if response.is_auth_rejected() => {
                    if attempts > self.max_auth_retries {
                        error!(?command, attempts, "operation rejected again after re-authentication");
                        return Err(CommandError::RepeatedAuthFailure { attempts });
                    }
                    counter!("gateway_command_auth_retries_total").increment(1);
                    warn!(?command, status = response.status, "operation rejected, re-authenticating");
                    if let Err(err) = self.sessions.authenticate().await {
                        warn!(error = %err, "re-authentication before retry failed");
                    }
                    continue;
                }
                Ok(response) => {
                    info!(status = response.status, body = ?response.body, "operation response");
                }
                Err(err) => {
                    warn!(?command, error = %err, "operation request failed");
                }
            }

            self.commit(&token).await;
            return Ok(CommandOutcome::Committed);
        }
    }

    fn operation(&self, command: Command) -> OperationRequest {
        match command {
            Command::Mode(mode) => OperationRequest::new(mode, self.reserve_percent()),
            Command::Reserve(reserve) => {
                self.reserve.store(reserve.value(), Ordering::Relaxed);
                OperationRequest::new(OperatingMode::SelfConsumption, reserve)
            }
        }
    }

    async fn commit(&self, token: &AuthToken) {
        match self
            .transport
            .get(paths::CONFIG_COMPLETED, RequestAuth::Cookie(token))
            .await
        {
            Ok(response) => info!(status = response.status, body = ?response.body, "commit response"),
            Err(err) => warn!(error = %err, "commit request failed"),
        }
    }
}
