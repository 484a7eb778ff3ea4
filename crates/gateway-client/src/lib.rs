use std::future::Future;
use std::time::Duration;

use gateway_types::{AuthToken, GatewayEndpoint};
use reqwest::header::COOKIE;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace, warn};

#[cfg(feature = "mock")]
pub mod mock;

const DEFAULT_USER_AGENT: &str = concat!("gateway-bridge/", env!("CARGO_PKG_VERSION"));
const AUTH_COOKIE: &str = "AuthCookie";

/// Options for the HTTPS connection to the gateway.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Gateways ship with a self-signed certificate.
    pub accept_invalid_certs: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            accept_invalid_certs: true,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("failed to build http client: {0}")]
    Build(String),
    #[error("request to {path} timed out after {timeout_ms}ms")]
    Timeout { path: String, timeout_ms: u64 },
    #[error("request to {path} failed: {message}")]
    Request { path: String, message: String },
    #[error("failed to read response from {path}: {message}")]
    Body { path: String, message: String },
}

/// How a request proves it belongs to the current session.
#[derive(Debug, Clone, Copy)]
pub enum RequestAuth<'a> {
    None,
    /// Session cookie, used by reads.
    Cookie(&'a AuthToken),
    /// Authorization header sent up front, used by mutations.
    Bearer(&'a AuthToken),
}

/// Status and decoded body of a gateway reply.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayResponse {
    pub status: u16,
    pub body: Option<Value>,
}

impl GatewayResponse {
    pub fn new(status: u16, body: Option<Value>) -> Self {
        Self { status, body }
    }

    pub fn ok(body: Value) -> Self {
        Self::new(200, Some(body))
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The gateway reports expired sessions either as an HTTP 401 or as
    /// `{"code": 401}` in the body.
    pub fn is_auth_rejected(&self) -> bool {
        self.status == 401 || self.body_code() == Some(401)
    }

    pub fn body_code(&self) -> Option<i64> {
        self.body.as_ref()?.get("code")?.as_i64()
    }

    /// The `error` member the gateway includes on failed calls.
    pub fn error(&self) -> Option<&Value> {
        self.body
            .as_ref()?
            .get("error")
            .filter(|value| !value.is_null())
    }

    /// Decodes the body, `Ok(None)` when there is none.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        match &self.body {
            None | Some(Value::Null) => Ok(None),
            Some(value) => T::deserialize(value).map(Some),
        }
    }
}

/// The two request shapes the bridge needs from the gateway.
pub trait GatewayTransport: Send + Sync {
    fn get(
        &self,
        path: &str,
        auth: RequestAuth<'_>,
    ) -> impl Future<Output = Result<GatewayResponse, TransportError>> + Send;

    fn post_json(
        &self,
        path: &str,
        body: &Value,
        auth: RequestAuth<'_>,
    ) -> impl Future<Output = Result<GatewayResponse, TransportError>> + Send;
}

/// reqwest-backed transport bound to a single gateway endpoint.
#[derive(Debug, Clone)]
pub struct HttpGatewayClient {
    endpoint: GatewayEndpoint,
    config: ClientConfig,
    client: reqwest::Client,
}

impl HttpGatewayClient {
    pub fn new(endpoint: GatewayEndpoint, config: ClientConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .user_agent(DEFAULT_USER_AGENT)
            .build()
            .map_err(|err| TransportError::Build(err.to_string()))?;

        Ok(Self {
            endpoint,
            config,
            client,
        })
    }

    pub fn endpoint(&self) -> &GatewayEndpoint {
        &self.endpoint
    }

    async fn send(
        &self,
        path: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<GatewayResponse, TransportError> {
        let response = request.send().await.map_err(|err| {
            warn!(
                path,
                error = %err,
                is_connect = err.is_connect(),
                is_timeout = err.is_timeout(),
                "gateway request failed"
            );
            self.request_error(path, err)
        })?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(|err| TransportError::Body {
            path: path.to_string(),
            message: err.to_string(),
        })?;
        debug!(path, status, bytes = text.len(), "gateway response received");

        Ok(GatewayResponse::new(status, parse_body(path, &text)))
    }

    fn request_error(&self, path: &str, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout {
                path: path.to_string(),
                timeout_ms: self.config.timeout_ms,
            }
        } else {
            TransportError::Request {
                path: path.to_string(),
                message: err.to_string(),
            }
        }
    }
}

impl GatewayTransport for HttpGatewayClient {
    async fn get(
        &self,
        path: &str,
        auth: RequestAuth<'_>,
    ) -> Result<GatewayResponse, TransportError> {
        trace!(path, "gateway GET");
        let request = authorize(self.client.get(self.endpoint.url(path)), auth);
        self.send(path, request).await
    }

    async fn post_json(
        &self,
        path: &str,
        body: &Value,
        auth: RequestAuth<'_>,
    ) -> Result<GatewayResponse, TransportError> {
        trace!(path, "gateway POST");
        let request = authorize(self.client.post(self.endpoint.url(path)).json(body), auth);
        self.send(path, request).await
    }
}

fn authorize(request: reqwest::RequestBuilder, auth: RequestAuth<'_>) -> reqwest::RequestBuilder {
    match auth {
        RequestAuth::None => request,
        RequestAuth::Cookie(token) => {
            request.header(COOKIE, format!("{AUTH_COOKIE}={}", token.as_str()))
        }
        RequestAuth::Bearer(token) => request.bearer_auth(token.as_str()),
    }
}

/// Non-JSON bodies are kept as a string so callers can still log them.
fn parse_body(path: &str, text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str(trimmed) {
        Ok(value) => Some(value),
        Err(err) => {
            debug!(path, error = %err, "gateway returned a non-json body");
            Some(Value::String(trimmed.to_string()))
        }
    }
}
