use std::sync::Arc;

use anyhow::Result;
use metrics::gauge;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use commands::CommandDispatcher;
use gateway_client::GatewayTransport;
use gateway_types::TelemetryEvent;
use poller_actor::{PollScheduler, SchedulerError};
use session::{SessionHandle, SessionManager};
use telemetry::TelemetryFetcher;

use crate::config::GatewayConfig;
use crate::control::ControlHandle;

/// Components for one gateway, all sharing a transport and a session.
pub struct Bridge<T> {
    pub sessions: Arc<SessionManager<T>>,
    pub fetcher: Arc<TelemetryFetcher<T>>,
    pub commands: Arc<CommandDispatcher<T>>,
}

impl<T: GatewayTransport + 'static> Bridge<T> {
    pub fn new(transport: Arc<T>, config: &GatewayConfig) -> Result<Self> {
        let sessions = Arc::new(SessionManager::new(
            transport.clone(),
            config.credentials.clone(),
        ));
        let fetcher = Arc::new(TelemetryFetcher::new(
            transport.clone(),
            sessions.handle(),
            config.event_capacity,
        ));
        let commands = Arc::new(CommandDispatcher::new(
            transport,
            sessions.clone(),
            config.command_config()?,
        ));

        Ok(Self {
            sessions,
            fetcher,
            commands,
        })
    }

    pub fn control(&self) -> ControlHandle<T> {
        ControlHandle::new(self.commands.clone(), self.sessions.handle())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.fetcher.subscribe()
    }

    pub fn scheduler(
        &self,
        config: &GatewayConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<PollScheduler<T>, SchedulerError> {
        PollScheduler::new(
            self.sessions.clone(),
            self.fetcher.clone(),
            config.scheduler.clone(),
            shutdown,
        )
    }
}

/// Logs once the first login succeeds. Returns early if the session owner is
/// dropped before that.
pub async fn announce_session(mut session: SessionHandle) {
    if let Some(token) = session.wait_authenticated().await {
        info!(token = %token.fingerprint(), "gateway session established");
    }
}

/// Logs every telemetry event and mirrors it into a gauge.
pub async fn log_telemetry(
    mut events: broadcast::Receiver<TelemetryEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            received = events.recv() => {
                match received {
                    Ok(event) => {
                        gauge!(gauge_name(&event)).set(event.value());
                        info!(event = event.name(), value = event.value(), "telemetry");
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "telemetry logger fell behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("telemetry logger shutdown requested");
                    break;
                }
            }
        }
    }
}

fn gauge_name(event: &TelemetryEvent) -> &'static str {
    match event {
        TelemetryEvent::StateOfEnergy(_) => "gateway_state_of_energy_percent",
        TelemetryEvent::Solar(_) => "gateway_solar_power_watts",
        TelemetryEvent::Grid(_) => "gateway_grid_power_watts",
        TelemetryEvent::Battery(_) => "gateway_battery_power_watts",
        TelemetryEvent::Load(_) => "gateway_load_power_watts",
    }
}
