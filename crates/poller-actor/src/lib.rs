use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use gateway_client::GatewayTransport;
use session::SessionManager;
use telemetry::TelemetryFetcher;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub reauth_interval: Duration,
    /// Delay before the first login, giving the gateway time to settle.
    pub initial_auth_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            reauth_interval: Duration::from_secs(30 * 60),
            initial_auth_delay: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

/// Drives telemetry polls and session refreshes for one gateway.
///
/// Every tick runs as its own task and is never awaited by the next one, so a
/// slow gateway can have several polls in flight at once.
pub struct PollScheduler<T> {
    sessions: Arc<SessionManager<T>>,
    fetcher: Arc<TelemetryFetcher<T>>,
    config: SchedulerConfig,
    shutdown: watch::Receiver<bool>,
}

impl<T: GatewayTransport + 'static> PollScheduler<T> {
    pub fn new(
        sessions: Arc<SessionManager<T>>,
        fetcher: Arc<TelemetryFetcher<T>>,
        config: SchedulerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, SchedulerError> {
        if config.poll_interval.is_zero() {
            return Err(SchedulerError::ZeroInterval("poll_interval"));
        }
        if config.reauth_interval.is_zero() {
            return Err(SchedulerError::ZeroInterval("reauth_interval"));
        }

        Ok(Self {
            sessions,
            fetcher,
            config,
            shutdown,
        })
    }

    pub async fn run(mut self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis(),
            reauth_interval_ms = self.config.reauth_interval.as_millis(),
            initial_auth_delay_ms = self.config.initial_auth_delay.as_millis(),
            "starting poll"
        );

        let start = Instant::now();
        let mut poll = interval_at(start + self.config.poll_interval, self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut reauth = interval_at(
            start + self.config.reauth_interval,
            self.config.reauth_interval,
        );
        reauth.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let initial_auth = sleep(self.config.initial_auth_delay);
        tokio::pin!(initial_auth);
        let mut initial_auth_done = false;

        let mut in_flight = JoinSet::new();
        let mut iteration = 0u64;

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    iteration = iteration.wrapping_add(1);
                    counter!("gateway_poll_ticks_total").increment(1);
                    debug!(iteration, in_flight = in_flight.len(), "poll tick");
                    let fetcher = self.fetcher.clone();
                    in_flight.spawn(async move {
                        fetcher.poll_once().await;
                    });
                }
                _ = reauth.tick() => {
                    info!("scheduled re-authentication");
                    self.spawn_authenticate(&mut in_flight);
                }
                _ = &mut initial_auth, if !initial_auth_done => {
                    initial_auth_done = true;
                    info!("initial authentication");
                    self.spawn_authenticate(&mut in_flight);
                }
                Some(result) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(err) = result {
                        warn!(error = %err, "scheduled task failed");
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!("poll scheduler shutdown requested");
                        break;
                    }
                }
            }
        }

        in_flight.abort_all();
        while in_flight.join_next().await.is_some() {}
    }

    fn spawn_authenticate(&self, in_flight: &mut JoinSet<()>) {
        let sessions = self.sessions.clone();
        in_flight.spawn(async move {
            // Failures are logged by the session manager; the next tick retries.
            let _ = sessions.authenticate().await;
        });
    }
}
