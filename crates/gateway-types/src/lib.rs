use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Request paths exposed by the gateway, relative to the endpoint base.
pub mod paths {
    pub const LOGIN: &str = "api/login/Basic";
    pub const SITEMASTER_RUN: &str = "api/sitemaster/run";
    pub const STATE_OF_ENERGY: &str = "api/system_status/soe";
    pub const AGGREGATES: &str = "api/meters/aggregates";
    pub const OPERATION: &str = "api/operation";
    pub const CONFIG_COMPLETED: &str = "api/config/completed";
}

/// Where the gateway lives. Resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayEndpoint {
    pub host: String,
    pub base_path: String,
}

impl GatewayEndpoint {
    pub fn new(host: impl Into<String>, base_path: impl Into<String>) -> Self {
        let base_path = base_path.into();
        let trimmed = base_path.trim_matches('/');
        let base_path = if trimmed.is_empty() {
            String::new()
        } else {
            format!("{trimmed}/")
        };
        Self {
            host: host.into(),
            base_path,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!(
            "https://{}/{}{}",
            self.host,
            self.base_path,
            path.trim_start_matches('/')
        )
    }
}

/// Opaque bearer credential returned by login.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix that is safe to put in logs.
    pub fn fingerprint(&self) -> String {
        let prefix: String = self.0.chars().take(6).collect();
        format!("{prefix}…")
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AuthToken").field(&self.fingerprint()).finish()
    }
}

/// One observed metric, published as soon as it is decoded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TelemetryEvent {
    StateOfEnergy(f64),
    Solar(f64),
    Grid(f64),
    Battery(f64),
    Load(f64),
}

impl TelemetryEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StateOfEnergy(_) => "soe-updated",
            Self::Solar(_) => "solar-updated",
            Self::Grid(_) => "grid-updated",
            Self::Battery(_) => "battery-updated",
            Self::Load(_) => "load-updated",
        }
    }

    pub fn value(&self) -> f64 {
        match *self {
            Self::StateOfEnergy(value)
            | Self::Solar(value)
            | Self::Grid(value)
            | Self::Battery(value)
            | Self::Load(value) => value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    #[error("unknown operating mode {0:?}")]
    UnknownMode(String),
    #[error("reserve percent {0} is outside 0..=100")]
    ReserveOutOfRange(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    SelfConsumption,
    Backup,
    Autonomous,
}

impl OperatingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SelfConsumption => "self_consumption",
            Self::Backup => "backup",
            Self::Autonomous => "autonomous",
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperatingMode {
    type Err = ValueError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "self_consumption" => Ok(Self::SelfConsumption),
            // "reserve" is the name callers use; the gateway only knows "backup".
            "backup" | "reserve" => Ok(Self::Backup),
            "autonomous" => Ok(Self::Autonomous),
            other => Err(ValueError::UnknownMode(other.to_string())),
        }
    }
}

/// Minimum battery charge the gateway should keep, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ReservePercent(u8);

impl ReservePercent {
    pub const FULL: Self = Self(100);
    pub const DEFAULT: Self = Self(20);

    pub fn new(value: i64) -> Result<Self, ValueError> {
        u8::try_from(value)
            .ok()
            .filter(|percent| *percent <= 100)
            .map(Self)
            .ok_or(ValueError::ReserveOutOfRange(value))
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for ReservePercent {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub force_sm_off: bool,
}

impl LoginRequest {
    pub fn customer(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: "customer".to_string(),
            email: email.into(),
            password: password.into(),
            force_sm_off: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    #[serde(default)]
    pub token: Option<String>,
}

/// Body posted to the operation endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationRequest {
    pub mode: OperatingMode,
    pub real_mode: OperatingMode,
    pub backup_reserve_percent: ReservePercent,
}

impl OperationRequest {
    /// Backup always keeps a full battery regardless of the configured reserve.
    pub fn new(mode: OperatingMode, reserve: ReservePercent) -> Self {
        let backup_reserve_percent = match mode {
            OperatingMode::Backup => ReservePercent::FULL,
            _ => reserve,
        };
        Self {
            mode,
            real_mode: mode,
            backup_reserve_percent,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateOfEnergyResponse {
    #[serde(default, deserialize_with = "lenient_number")]
    pub percentage: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MeterReading {
    #[serde(default, deserialize_with = "lenient_number")]
    pub instant_power: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AggregatesResponse {
    #[serde(default)]
    pub site: Option<MeterReading>,
    #[serde(default)]
    pub battery: Option<MeterReading>,
    #[serde(default)]
    pub load: Option<MeterReading>,
    #[serde(default)]
    pub solar: Option<MeterReading>,
}

impl AggregatesResponse {
    /// Missing meters report zero power.
    pub fn events(&self) -> [TelemetryEvent; 4] {
        [
            TelemetryEvent::Solar(instant_power(&self.solar)),
            TelemetryEvent::Grid(instant_power(&self.site)),
            TelemetryEvent::Battery(instant_power(&self.battery)),
            TelemetryEvent::Load(instant_power(&self.load)),
        ]
    }
}

fn instant_power(reading: &Option<MeterReading>) -> f64 {
    reading
        .as_ref()
        .and_then(|reading| reading.instant_power)
        .unwrap_or(0.0)
}

/// Accepts a JSON number, a numeric string, or null.
fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(value)) => Ok(Some(value)),
        Some(Raw::Text(text)) => text
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| de::Error::custom(format!("expected a number, got {text:?}"))),
    }
}
