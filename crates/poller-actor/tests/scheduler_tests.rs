use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gateway_client::mock::{Method, MockTransport};
use gateway_client::{GatewayResponse, GatewayTransport, RequestAuth, TransportError};
use gateway_types::paths;
use poller_actor::{PollScheduler, SchedulerConfig, SchedulerError};
use serde_json::{json, Value};
use session::{Credentials, SessionManager};
use telemetry::{TelemetryFetcher, DEFAULT_EVENT_CAPACITY};
use tokio::sync::watch;
use tokio::time::sleep;

struct Harness {
    transport: Arc<MockTransport>,
    shutdown: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

fn start(config: SchedulerConfig) -> Harness {
    let transport = Arc::new(MockTransport::new());
    transport.set_default(
        Method::Post,
        paths::LOGIN,
        Ok(GatewayResponse::ok(json!({ "token": "tok-1" }))),
    );
    transport.set_default(
        Method::Get,
        paths::STATE_OF_ENERGY,
        Ok(GatewayResponse::ok(json!({ "percentage": 64 }))),
    );

    let sessions = Arc::new(SessionManager::new(
        transport.clone(),
        Credentials::new("owner@example.com", "pw"),
    ));
    let fetcher = Arc::new(TelemetryFetcher::new(
        transport.clone(),
        sessions.handle(),
        DEFAULT_EVENT_CAPACITY,
    ));
    let (shutdown, shutdown_rx) = watch::channel(false);
    let scheduler =
        PollScheduler::new(sessions, fetcher, config, shutdown_rx).expect("scheduler");
    let handle = tokio::spawn(scheduler.run());

    Harness {
        transport,
        shutdown,
        handle,
    }
}

impl Harness {
    fn logins(&self) -> usize {
        self.transport.requests_to(Method::Post, paths::LOGIN).len()
    }

    fn soe_reads(&self) -> usize {
        self.transport
            .requests_to(Method::Get, paths::STATE_OF_ENERGY)
            .len()
    }

    async fn stop(self) {
        self.shutdown.send(true).expect("shutdown");
        self.handle.await.expect("join");
    }
}

#[tokio::test(start_paused = true)]
async fn polls_wait_for_initial_authentication() {
    let harness = start(SchedulerConfig::default());

    sleep(Duration::from_millis(9_900)).await;
    assert_eq!(harness.logins(), 0);
    assert_eq!(harness.soe_reads(), 0);

    sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.logins(), 1);

    sleep(Duration::from_secs(6)).await;
    assert!(harness.soe_reads() >= 1);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn reauthenticates_on_the_slow_timer() {
    let harness = start(SchedulerConfig::default());

    sleep(Duration::from_secs(29 * 60)).await;
    assert_eq!(harness.logins(), 1);

    sleep(Duration::from_secs(2 * 60)).await;
    assert_eq!(harness.logins(), 2);
    // one poll every five seconds once the session exists
    assert!(harness.soe_reads() >= 300);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_further_ticks() {
    let harness = start(SchedulerConfig {
        poll_interval: Duration::from_secs(1),
        reauth_interval: Duration::from_secs(3_600),
        initial_auth_delay: Duration::ZERO,
    });

    sleep(Duration::from_millis(3_500)).await;
    let transport = harness.transport.clone();
    harness.stop().await;
    let reads = transport.requests_to(Method::Get, paths::STATE_OF_ENERGY).len();

    sleep(Duration::from_secs(10)).await;
    assert_eq!(
        transport.requests_to(Method::Get, paths::STATE_OF_ENERGY).len(),
        reads
    );
}

/// Holds every state-of-energy read open for `delay` after recording it.
struct SlowSoe {
    inner: MockTransport,
    delay: Duration,
    finished: AtomicUsize,
}

impl GatewayTransport for SlowSoe {
    async fn get(
        &self,
        path: &str,
        auth: RequestAuth<'_>,
    ) -> Result<GatewayResponse, TransportError> {
        let reply = self.inner.get(path, auth).await;
        if path == paths::STATE_OF_ENERGY {
            sleep(self.delay).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
        reply
    }

    async fn post_json(
        &self,
        path: &str,
        body: &Value,
        auth: RequestAuth<'_>,
    ) -> Result<GatewayResponse, TransportError> {
        self.inner.post_json(path, body, auth).await
    }
}

#[tokio::test(start_paused = true)]
async fn slow_polls_do_not_hold_back_the_next_tick() {
    let transport = Arc::new(SlowSoe {
        inner: MockTransport::new(),
        delay: Duration::from_secs(12),
        finished: AtomicUsize::new(0),
    });
    transport.inner.set_default(
        Method::Post,
        paths::LOGIN,
        Ok(GatewayResponse::ok(json!({ "token": "tok-1" }))),
    );

    let sessions = Arc::new(SessionManager::new(
        transport.clone(),
        Credentials::new("owner@example.com", "pw"),
    ));
    let fetcher = Arc::new(TelemetryFetcher::new(
        transport.clone(),
        sessions.handle(),
        DEFAULT_EVENT_CAPACITY,
    ));
    let (shutdown, shutdown_rx) = watch::channel(false);
    let scheduler = PollScheduler::new(
        sessions,
        fetcher,
        SchedulerConfig {
            initial_auth_delay: Duration::ZERO,
            ..SchedulerConfig::default()
        },
        shutdown_rx,
    )
    .expect("scheduler");
    let handle = tokio::spawn(scheduler.run());

    // ticks at 5s, 10s and 15s; the first read is still held until 17s
    sleep(Duration::from_millis(16_000)).await;
    let started = transport
        .inner
        .requests_to(Method::Get, paths::STATE_OF_ENERGY)
        .len();
    assert_eq!(started, 3);
    assert_eq!(transport.finished.load(Ordering::SeqCst), 0);

    sleep(Duration::from_millis(4_100)).await;
    let started = transport
        .inner
        .requests_to(Method::Get, paths::STATE_OF_ENERGY)
        .len();
    assert_eq!(started, 4);
    assert_eq!(transport.finished.load(Ordering::SeqCst), 1);

    shutdown.send(true).expect("shutdown");
    handle.await.expect("join");
}

#[test]
fn zero_poll_interval_is_rejected() {
    let transport = Arc::new(MockTransport::new());
    let sessions = Arc::new(SessionManager::new(
        transport.clone(),
        Credentials::new("owner@example.com", "pw"),
    ));
    let fetcher = Arc::new(TelemetryFetcher::new(
        transport,
        sessions.handle(),
        DEFAULT_EVENT_CAPACITY,
    ));
    let (_shutdown, shutdown_rx) = watch::channel(false);

    let result = PollScheduler::new(
        sessions,
        fetcher,
        SchedulerConfig {
            poll_interval: Duration::ZERO,
            ..SchedulerConfig::default()
        },
        shutdown_rx,
    );
    assert!(matches!(result, Err(SchedulerError::ZeroInterval("poll_interval"))));
}
