use std::sync::Arc;

use metrics::counter;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use gateway_client::{GatewayResponse, GatewayTransport, RequestAuth, TransportError};
use gateway_types::{paths, AggregatesResponse, AuthToken, StateOfEnergyResponse, TelemetryEvent};
use session::SessionHandle;

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("{path} answered with http status {status}")]
    Status { path: &'static str, status: u16 },
    #[error("{path} reported an error: {error}")]
    Gateway { path: &'static str, error: String },
    #[error("{path} returned an unexpected payload: {source}")]
    Decode {
        path: &'static str,
        source: serde_json::Error,
    },
    #[error("{path} response is missing {field}")]
    MissingField {
        path: &'static str,
        field: &'static str,
    },
}

/// Reads telemetry from the gateway and publishes one event per metric.
///
/// Holds no per-cycle state, so overlapping polls are harmless.
pub struct TelemetryFetcher<T> {
    transport: Arc<T>,
    session: SessionHandle,
    events: broadcast::Sender<TelemetryEvent>,
}

impl<T: GatewayTransport> TelemetryFetcher<T> {
    pub fn new(transport: Arc<T>, session: SessionHandle, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            transport,
            session,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.events.subscribe()
    }

    /// Runs both read queries concurrently and returns how many events were
    /// published. A failing query only suppresses its own events.
    pub async fn poll_once(&self) -> usize {
        let Some(token) = self.session.token() else {
            info!("not yet authenticated, skipping telemetry poll");
            return 0;
        };

        let state_of_energy = async {
            let result = self.state_of_energy(&token).await;
            self.publish_all(paths::STATE_OF_ENERGY, result)
        };
        let aggregates = async {
            let result = self.aggregates(&token).await;
            self.publish_all(paths::AGGREGATES, result)
        };

        let (soe_count, aggregate_count) = tokio::join!(state_of_energy, aggregates);
        soe_count + aggregate_count
    }

    async fn state_of_energy(&self, token: &AuthToken) -> Result<Vec<TelemetryEvent>, FetchError> {
        let response = self.query(paths::STATE_OF_ENERGY, token).await?;
        let Some(soe) = decode::<StateOfEnergyResponse>(paths::STATE_OF_ENERGY, &response)? else {
            return Ok(Vec::new());
        };
        let percentage = soe.percentage.ok_or(FetchError::MissingField {
            path: paths::STATE_OF_ENERGY,
            field: "percentage",
        })?;
        Ok(vec![TelemetryEvent::StateOfEnergy(percentage)])
    }

    async fn aggregates(&self, token: &AuthToken) -> Result<Vec<TelemetryEvent>, FetchError> {
        let response = self.query(paths::AGGREGATES, token).await?;
        Ok(decode::<AggregatesResponse>(paths::AGGREGATES, &response)?
            .map(|aggregates| aggregates.events().to_vec())
            .unwrap_or_default())
    }

    async fn query(&self, path: &'static str, token: &AuthToken) -> Result<GatewayResponse, FetchError> {
        let response = self.transport.get(path, RequestAuth::Cookie(token)).await?;
        debug!(path, status = response.status, body = ?response.body, "telemetry response");

        if let Some(error) = response.error() {
            return Err(FetchError::Gateway {
                path,
                error: error.to_string(),
            });
        }
        if !response.is_success() {
            return Err(FetchError::Status {
                path,
                status: response.status,
            });
        }
        Ok(response)
    }

    fn publish_all(
        &self,
        path: &'static str,
        result: Result<Vec<TelemetryEvent>, FetchError>,
    ) -> usize {
        match result {
            Ok(events) => {
                if events.is_empty() {
                    debug!(path, "empty telemetry response");
                }
                let count = events.len();
                for event in events {
                    self.publish(event);
                }
                count
            }
            Err(err) => {
                counter!("gateway_telemetry_failures_total").increment(1);
                warn!(path, error = %err, "telemetry query failed");
                0
            }
        }
    }

    fn publish(&self, event: TelemetryEvent) {
        counter!("gateway_telemetry_events_total").increment(1);
        debug!(event = event.name(), value = event.value(), "telemetry event");
        if self.events.send(event).is_err() {
            debug!(event = event.name(), "no telemetry subscribers");
        }
    }
}

fn decode<D: DeserializeOwned>(
    path: &'static str,
    response: &GatewayResponse,
) -> Result<Option<D>, FetchError> {
    response
        .decode()
        .map_err(|source| FetchError::Decode { path, source })
}
