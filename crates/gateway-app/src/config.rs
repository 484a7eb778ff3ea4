use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use commands::CommandConfig;
use gateway_client::ClientConfig;
use gateway_types::{GatewayEndpoint, ReservePercent};
use poller_actor::SchedulerConfig;
use session::Credentials;
use telemetry::DEFAULT_EVENT_CAPACITY;

pub const HOST_ENV: &str = "CONTROLLER_IP";
pub const EMAIL_ENV: &str = "TESLA_USERNAME";
pub const PASSWORD_ENV: &str = "TESLA_PASSWORD";

const DEFAULT_RESERVE_PERCENT: i64 = 20;
const DEFAULT_MAX_AUTH_RETRIES: u32 = 1;

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub host: String,
    pub base_path: String,
    pub credentials: Credentials,
    pub client: ClientConfig,
    pub scheduler: SchedulerConfig,
    pub reserve_percent: i64,
    pub max_auth_retries: u32,
    pub event_capacity: usize,
    pub control_listen: Option<String>,
    pub metrics_listen: Option<String>,
}

impl GatewayConfig {
    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    pub fn load_with_path(config_path: Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(file_config) = load_file_config(config_path.as_deref())? {
            apply_file_config(&mut config, file_config);
        }

        apply_env_overrides(&mut config);
        Ok(config)
    }

    /// Missing gateway address or account details are fatal.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            anyhow::bail!("{HOST_ENV} not set, not starting");
        }
        if self.credentials.email.trim().is_empty() {
            anyhow::bail!("{EMAIL_ENV} not set, not starting");
        }
        if self.credentials.password.is_empty() {
            anyhow::bail!("{PASSWORD_ENV} not set, not starting");
        }
        if self.client.timeout_ms == 0 {
            anyhow::bail!("client.timeout_ms must be >= 1");
        }
        if self.scheduler.poll_interval.is_zero() {
            anyhow::bail!("poller.poll_interval_ms must be >= 1");
        }
        if self.scheduler.reauth_interval.is_zero() {
            anyhow::bail!("poller.reauth_interval_ms must be >= 1");
        }
        ReservePercent::new(self.reserve_percent).context("commands.reserve_percent")?;
        if self.event_capacity == 0 {
            anyhow::bail!("events.capacity must be >= 1");
        }
        if let Some(ref listen) = self.control_listen {
            parse_listen(listen).context("control.listen")?;
        }
        if let Some(ref listen) = self.metrics_listen {
            parse_listen(listen).context("metrics.listen")?;
        }

        Ok(())
    }

    pub fn endpoint(&self) -> GatewayEndpoint {
        GatewayEndpoint::new(self.host.trim(), self.base_path.clone())
    }

    pub fn command_config(&self) -> Result<CommandConfig> {
        Ok(CommandConfig {
            max_auth_retries: self.max_auth_retries,
            initial_reserve: ReservePercent::new(self.reserve_percent)?,
        })
    }

    pub fn control_addr(&self) -> Result<Option<SocketAddr>> {
        self.control_listen.as_deref().map(parse_listen).transpose()
    }

    pub fn metrics_addr(&self) -> Result<Option<SocketAddr>> {
        self.metrics_listen.as_deref().map(parse_listen).transpose()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            base_path: String::new(),
            credentials: Credentials::new("", ""),
            client: ClientConfig::default(),
            scheduler: SchedulerConfig::default(),
            reserve_percent: DEFAULT_RESERVE_PERCENT,
            max_auth_retries: DEFAULT_MAX_AUTH_RETRIES,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            control_listen: None,
            metrics_listen: None,
        }
    }
}

fn apply_env_overrides(config: &mut GatewayConfig) {
    if let Ok(value) = env::var(HOST_ENV) {
        config.host = value;
    }

    if let Ok(value) = env::var(EMAIL_ENV) {
        config.credentials.email = value;
    }

    if let Ok(value) = env::var(PASSWORD_ENV) {
        config.credentials.password = value;
    }

    if let Ok(value) = env::var("GATEWAY_BASE_PATH") {
        config.base_path = value;
    }

    let scheduler = &mut config.scheduler;
    scheduler.poll_interval =
        parse_env_millis("GATEWAY_POLL_INTERVAL_MS").unwrap_or(scheduler.poll_interval);
    scheduler.reauth_interval =
        parse_env_millis("GATEWAY_REAUTH_INTERVAL_MS").unwrap_or(scheduler.reauth_interval);
    scheduler.initial_auth_delay =
        parse_env_millis("GATEWAY_INITIAL_AUTH_DELAY_MS").unwrap_or(scheduler.initial_auth_delay);

    config.client.timeout_ms =
        parse_env("GATEWAY_REQUEST_TIMEOUT_MS").unwrap_or(config.client.timeout_ms);
    config.client.accept_invalid_certs = parse_env_flag("GATEWAY_ACCEPT_INVALID_CERTS")
        .unwrap_or(config.client.accept_invalid_certs);

    config.reserve_percent = parse_env("GATEWAY_RESERVE_PERCENT").unwrap_or(config.reserve_percent);
    config.max_auth_retries =
        parse_env("GATEWAY_MAX_AUTH_RETRIES").unwrap_or(config.max_auth_retries);
    config.event_capacity = parse_env("GATEWAY_EVENT_CAPACITY").unwrap_or(config.event_capacity);

    config.control_listen = env::var("GATEWAY_CONTROL_LISTEN")
        .ok()
        .or(config.control_listen.take());
    config.metrics_listen = env::var("GATEWAY_METRICS_LISTEN")
        .ok()
        .or(config.metrics_listen.take());
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    gateway: Option<FileGatewayConfig>,
    client: Option<FileClientConfig>,
    poller: Option<FilePollerConfig>,
    commands: Option<FileCommandsConfig>,
    events: Option<FileEventsConfig>,
    control: Option<FileListenConfig>,
    metrics: Option<FileListenConfig>,
}

#[derive(Debug, Deserialize)]
struct FileGatewayConfig {
    host: Option<String>,
    base_path: Option<String>,
    email: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileClientConfig {
    timeout_ms: Option<u64>,
    accept_invalid_certs: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct FilePollerConfig {
    poll_interval_ms: Option<u64>,
    reauth_interval_ms: Option<u64>,
    initial_auth_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileCommandsConfig {
    reserve_percent: Option<i64>,
    max_auth_retries: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct FileEventsConfig {
    capacity: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct FileListenConfig {
    listen: Option<String>,
}

fn load_file_config(config_path: Option<&str>) -> Result<Option<FileConfig>> {
    let path = match config_path {
        Some(path) => path.to_string(),
        None => match env::var("GATEWAY_CONFIG") {
            Ok(value) => value,
            Err(_) => return Ok(None),
        },
    };

    let content = fs::read_to_string(&path)
        .with_context(|| format!("read config file {path}"))?;
    let ext = Path::new(&path).extension().and_then(|value| value.to_str());

    let config = match ext {
        Some("json") => serde_json::from_str(&content).context("parse json config")?,
        _ => toml::from_str(&content).context("parse toml config")?,
    };

    Ok(Some(config))
}

fn apply_file_config(config: &mut GatewayConfig, file: FileConfig) {
    if let Some(gateway) = file.gateway {
        if let Some(host) = gateway.host {
            config.host = host;
        }
        if let Some(base_path) = gateway.base_path {
            config.base_path = base_path;
        }
        if let Some(email) = gateway.email {
            config.credentials.email = email;
        }
        if let Some(password) = gateway.password {
            config.credentials.password = password;
        }
    }

    if let Some(client) = file.client {
        if let Some(timeout_ms) = client.timeout_ms {
            config.client.timeout_ms = timeout_ms;
        }
        if let Some(accept) = client.accept_invalid_certs {
            config.client.accept_invalid_certs = accept;
        }
    }

    if let Some(poller) = file.poller {
        if let Some(interval_ms) = poller.poll_interval_ms {
            config.scheduler.poll_interval = Duration::from_millis(interval_ms);
        }
        if let Some(interval_ms) = poller.reauth_interval_ms {
            config.scheduler.reauth_interval = Duration::from_millis(interval_ms);
        }
        if let Some(delay_ms) = poller.initial_auth_delay_ms {
            config.scheduler.initial_auth_delay = Duration::from_millis(delay_ms);
        }
    }

    if let Some(commands) = file.commands {
        if let Some(reserve) = commands.reserve_percent {
            config.reserve_percent = reserve;
        }
        if let Some(retries) = commands.max_auth_retries {
            config.max_auth_retries = retries;
        }
    }

    if let Some(capacity) = file.events.and_then(|events| events.capacity) {
        config.event_capacity = capacity;
    }

    if let Some(listen) = file.control.and_then(|control| control.listen) {
        config.control_listen = Some(listen);
    }

    if let Some(listen) = file.metrics.and_then(|metrics| metrics.listen) {
        config.metrics_listen = Some(listen);
    }
}

fn parse_listen(value: &str) -> Result<SocketAddr> {
    value
        .trim()
        .parse::<SocketAddr>()
        .map_err(|_| anyhow::anyhow!("listen address must be host:port, got {value:?}"))
}

fn parse_env<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

fn parse_env_millis(key: &str) -> Option<Duration> {
    parse_env::<u64>(key).map(Duration::from_millis)
}

/// Accepts `true`/`false` as well as the `1`/`0` style used in unit files.
fn parse_env_flag(key: &str) -> Option<bool> {
    match env::var(key).ok()?.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}
