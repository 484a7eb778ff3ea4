mod bridge;
mod config;
pub mod control;

pub use bridge::{announce_session, log_telemetry, Bridge};
pub use config::GatewayConfig;
pub use control::{ControlHandle, ControlServer};
