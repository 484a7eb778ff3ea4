use std::env;
use std::sync::Arc;
#[cfg(target_os = "linux")]
use std::time::Duration;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;
#[cfg(target_os = "linux")]
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gateway_app::{announce_session, log_telemetry, Bridge, ControlServer, GatewayConfig};
use gateway_client::HttpGatewayClient;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = parse_config_arg();
    let config = GatewayConfig::load_with_path(config_path).context("load config failed")?;
    config.validate().context("config validation failed")?;

    if let Some(addr) = config.metrics_addr()? {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("metrics exporter init failed")?;
        info!(address = %addr, "metrics exporter listening");
    }

    let endpoint = config.endpoint();
    info!(host = %endpoint.host, base_path = %endpoint.base_path, "using gateway");
    let transport = HttpGatewayClient::new(endpoint, config.client.clone())
        .context("http client init failed")?;
    let bridge = Bridge::new(Arc::new(transport), &config).context("bridge init failed")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(announce_session(bridge.sessions.handle()));
    let logger_handle = tokio::spawn(log_telemetry(bridge.subscribe(), shutdown_rx.clone()));
    let scheduler = bridge
        .scheduler(&config, shutdown_rx.clone())
        .context("scheduler init failed")?;
    let scheduler_handle = tokio::spawn(scheduler.run());

    let control_server = match config.control_addr()? {
        Some(addr) => Some(
            ControlServer::spawn(addr, bridge.control())
                .await
                .context("control api init failed")?,
        ),
        None => None,
    };

    notify_ready();
    let watchdog_handle = start_watchdog(shutdown_rx.clone());

    tokio::signal::ctrl_c()
        .await
        .context("listen for shutdown signal failed")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    if let Some(server) = control_server {
        server.shutdown().await;
    }
    if let Err(err) = scheduler_handle.await {
        warn!(error = %err, "scheduler task join failed");
    }
    let _ = logger_handle.await;
    if let Some(handle) = watchdog_handle {
        let _ = handle.await;
    }
    Ok(())
}

fn parse_config_arg() -> Option<String> {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn notify_ready() {
    if let Err(err) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %err, "systemd ready notify failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn notify_ready() {}

#[cfg(target_os = "linux")]
fn start_watchdog(
    mut shutdown: watch::Receiver<bool>,
) -> Option<tokio::task::JoinHandle<()>> {
    let period = watchdog_interval()?;
    info!(period_ms = period.as_millis(), "systemd watchdog enabled");
    Some(tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = sd_notify::notify(false, &[sd_notify::NotifyState::Watchdog]) {
                        warn!(error = %err, "systemd watchdog notify failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }))
}

#[cfg(not(target_os = "linux"))]
fn start_watchdog(_shutdown: watch::Receiver<bool>) -> Option<tokio::task::JoinHandle<()>> {
    None
}

#[cfg(target_os = "linux")]
fn watchdog_interval() -> Option<Duration> {
    let watchdog_usec = env::var("WATCHDOG_USEC").ok()?.parse::<u64>().ok()?;
    if let Some(pid) = env::var("WATCHDOG_PID")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
    {
        if pid != std::process::id() {
            return None;
        }
    }

    let interval = watchdog_usec.saturating_div(2).max(100_000);
    Some(Duration::from_micros(interval))
}
