use std::fmt;
use std::sync::Arc;

use metrics::counter;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use gateway_client::{GatewayTransport, RequestAuth, TransportError};
use gateway_types::{paths, AuthToken, LoginRequest, LoginResponse};

/// Account used to log in to the gateway.
#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("login request failed: {0}")]
    Transport(#[from] TransportError),
    #[error("gateway rejected login (status {status}): {reason}")]
    Rejected { status: u16, reason: String },
    #[error("login response did not contain a token")]
    MissingToken,
    #[error("login payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Read-only view of the current session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    token: watch::Receiver<Option<AuthToken>>,
}

impl SessionHandle {
    pub fn token(&self) -> Option<AuthToken> {
        self.token.borrow().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.borrow().is_some()
    }

    /// Resolves once a token is held. `None` if the session manager is gone.
    pub async fn wait_authenticated(&mut self) -> Option<AuthToken> {
        self.token
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|token| token.clone())
    }
}

/// Owns the gateway token. Only this type ever writes it.
///
/// Overlapping `authenticate` calls are allowed; whichever login finishes
/// last decides the stored token.
pub struct SessionManager<T> {
    transport: Arc<T>,
    credentials: Credentials,
    token: watch::Sender<Option<AuthToken>>,
}

impl<T: GatewayTransport> SessionManager<T> {
    pub fn new(transport: Arc<T>, credentials: Credentials) -> Self {
        let (token, _) = watch::channel(None);
        Self {
            transport,
            credentials,
            token,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            token: self.token.subscribe(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.borrow().is_some()
    }

    /// Logs in, then asks the gateway to run its sitemaster.
    ///
    /// A failed login keeps whatever token was held before. The sitemaster
    /// call is made either way, and the login result is returned after it so
    /// that awaiting this method orders follow-up work behind the refresh.
    pub async fn authenticate(&self) -> Result<(), AuthError> {
        counter!("gateway_auth_attempts_total").increment(1);
        let result = self.login().await;
        match &result {
            Ok(token) => info!(
                email = %self.credentials.email,
                token = %token.fingerprint(),
                "authenticated with gateway"
            ),
            Err(err) => {
                counter!("gateway_auth_failures_total").increment(1);
                warn!(email = %self.credentials.email, error = %err, "gateway login failed");
            }
        }

        self.run_sitemaster().await;
        result.map(|_| ())
    }

    async fn login(&self) -> Result<AuthToken, AuthError> {
        let request = LoginRequest::customer(&self.credentials.email, &self.credentials.password);
        let body = serde_json::to_value(&request)?;
        let response = self
            .transport
            .post_json(paths::LOGIN, &body, RequestAuth::None)
            .await?;
        debug!(status = response.status, "login response received");

        if let Some(error) = response.error() {
            return Err(AuthError::Rejected {
                status: response.status,
                reason: error.to_string(),
            });
        }
        if !response.is_success() {
            return Err(AuthError::Rejected {
                status: response.status,
                reason: "unexpected http status".to_string(),
            });
        }

        let token = response
            .decode::<LoginResponse>()?
            .and_then(|login| login.token)
            .filter(|token| !token.is_empty())
            .map(AuthToken::new)
            .ok_or(AuthError::MissingToken)?;

        self.token.send_replace(Some(token.clone()));
        Ok(token)
    }

    async fn run_sitemaster(&self) {
        let current = self.token.borrow().clone();
        let Some(token) = current else {
            info!(path = paths::SITEMASTER_RUN, "not yet authenticated, skipping request");
            return;
        };

        match self
            .transport
            .get(paths::SITEMASTER_RUN, RequestAuth::Cookie(&token))
            .await
        {
            Ok(response) => {
                if let Some(error) = response.error() {
                    warn!(status = response.status, error = %error, "sitemaster run reported an error");
                } else {
                    debug!(status = response.status, body = ?response.body, "sitemaster run response");
                }
            }
            Err(err) => warn!(error = %err, "sitemaster run failed"),
        }
    }
}
