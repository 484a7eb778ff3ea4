use std::sync::Arc;

use commands::{CommandConfig, CommandDispatcher, CommandError, CommandOutcome};
use gateway_client::mock::{Method, MockTransport, RecordedAuth};
use gateway_client::{GatewayResponse, TransportError};
use gateway_types::paths;
use serde_json::{json, Value};
use session::{Credentials, SessionManager};

fn dispatcher(transport: &Arc<MockTransport>) -> CommandDispatcher<MockTransport> {
    let sessions = Arc::new(SessionManager::new(
        transport.clone(),
        Credentials::new("owner@example.com", "pw"),
    ));
    CommandDispatcher::new(transport.clone(), sessions, CommandConfig::default())
}

async fn logged_in(transport: &Arc<MockTransport>) -> CommandDispatcher<MockTransport> {
    transport.enqueue(
        Method::Post,
        paths::LOGIN,
        Ok(GatewayResponse::ok(json!({ "token": "tok-1" }))),
    );
    let sessions = Arc::new(SessionManager::new(
        transport.clone(),
        Credentials::new("owner@example.com", "pw"),
    ));
    sessions.authenticate().await.expect("login");
    transport.clear_requests();
    CommandDispatcher::new(transport.clone(), sessions, CommandConfig::default())
}

fn posted_operations(transport: &MockTransport) -> Vec<Value> {
    transport
        .requests_to(Method::Post, paths::OPERATION)
        .into_iter()
        .filter_map(|request| request.body)
        .collect()
}

fn unauthorized() -> Result<GatewayResponse, TransportError> {
    Ok(GatewayResponse::ok(json!({ "code": 401, "error": "token expired" })))
}

#[tokio::test]
async fn reserve_alias_posts_backup_with_full_reserve() {
    let transport = Arc::new(MockTransport::new());
    let commands = logged_in(&transport).await;

    let outcome = commands.set_mode("reserve").await.expect("set mode");

    assert_eq!(outcome, CommandOutcome::Committed);
    assert_eq!(
        posted_operations(&transport),
        vec![json!({ "mode": "backup", "real_mode": "backup", "backup_reserve_percent": 100 })]
    );
    assert_eq!(transport.requests_to(Method::Get, paths::CONFIG_COMPLETED).len(), 1);
}

#[tokio::test]
async fn backup_overrides_stored_reserve() {
    let transport = Arc::new(MockTransport::new());
    let commands = logged_in(&transport).await;

    commands.set_reserve_percent(35).await.expect("set reserve");
    commands.set_mode("backup").await.expect("backup");
    commands.set_mode("self_consumption").await.expect("self consumption");

    assert_eq!(commands.reserve_percent().value(), 35);
    assert_eq!(
        posted_operations(&transport),
        vec![
            json!({ "mode": "self_consumption", "real_mode": "self_consumption", "backup_reserve_percent": 35 }),
            json!({ "mode": "backup", "real_mode": "backup", "backup_reserve_percent": 100 }),
            json!({ "mode": "self_consumption", "real_mode": "self_consumption", "backup_reserve_percent": 35 }),
        ]
    );
}

#[tokio::test]
async fn operation_uses_bearer_and_commit_uses_cookie() {
    let transport = Arc::new(MockTransport::new());
    let commands = logged_in(&transport).await;

    commands.set_mode("autonomous").await.expect("set mode");

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].path, paths::OPERATION);
    assert_eq!(requests[0].auth, RecordedAuth::Bearer("tok-1".to_string()));
    assert_eq!(requests[1].path, paths::CONFIG_COMPLETED);
    assert_eq!(requests[1].auth, RecordedAuth::Cookie("tok-1".to_string()));
}

#[tokio::test]
async fn rejected_token_reauthenticates_then_resends() {
    let transport = Arc::new(MockTransport::new());
    let commands = logged_in(&transport).await;
    transport.enqueue(Method::Post, paths::OPERATION, unauthorized());
    transport.enqueue(
        Method::Post,
        paths::LOGIN,
        Ok(GatewayResponse::ok(json!({ "token": "tok-2" }))),
    );

    let outcome = commands.set_mode("backup").await.expect("set mode");
    assert_eq!(outcome, CommandOutcome::Committed);

    let sequence: Vec<(Method, String)> = transport
        .requests()
        .into_iter()
        .map(|request| (request.method, request.path))
        .collect();
    assert_eq!(
        sequence,
        vec![
            (Method::Post, paths::OPERATION.to_string()),
            (Method::Post, paths::LOGIN.to_string()),
            (Method::Get, paths::SITEMASTER_RUN.to_string()),
            (Method::Post, paths::OPERATION.to_string()),
            (Method::Get, paths::CONFIG_COMPLETED.to_string()),
        ]
    );

    let operations = transport.requests_to(Method::Post, paths::OPERATION);
    assert_eq!(operations[0].body, operations[1].body);
    assert_eq!(operations[1].auth, RecordedAuth::Bearer("tok-2".to_string()));
}

#[tokio::test]
async fn http_401_status_is_treated_as_rejection() {
    let transport = Arc::new(MockTransport::new());
    let commands = logged_in(&transport).await;
    transport.enqueue(Method::Post, paths::OPERATION, Ok(GatewayResponse::new(401, None)));
    transport.enqueue(
        Method::Post,
        paths::LOGIN,
        Ok(GatewayResponse::ok(json!({ "token": "tok-2" }))),
    );

    commands.set_reserve_percent(50).await.expect("set reserve");

    assert_eq!(transport.requests_to(Method::Post, paths::LOGIN).len(), 1);
    assert_eq!(transport.requests_to(Method::Post, paths::OPERATION).len(), 2);
    assert_eq!(transport.requests_to(Method::Get, paths::CONFIG_COMPLETED).len(), 1);
}

#[tokio::test]
async fn persistent_rejection_stops_after_one_retry() {
    let transport = Arc::new(MockTransport::new());
    let commands = logged_in(&transport).await;
    transport.set_default(Method::Post, paths::OPERATION, unauthorized());
    transport.set_default(
        Method::Post,
        paths::LOGIN,
        Ok(GatewayResponse::ok(json!({ "token": "tok-stale" }))),
    );

    let err = commands.set_mode("self_consumption").await.expect_err("rejected");

    assert!(matches!(err, CommandError::RepeatedAuthFailure { attempts: 2 }));
    assert_eq!(transport.requests_to(Method::Post, paths::OPERATION).len(), 2);
    assert_eq!(transport.requests_to(Method::Post, paths::LOGIN).len(), 1);
    assert!(transport
        .requests_to(Method::Get, paths::CONFIG_COMPLETED)
        .is_empty());
}

#[tokio::test]
async fn other_failures_still_commit_once() {
    let transport = Arc::new(MockTransport::new());
    let commands = logged_in(&transport).await;
    transport.enqueue(
        Method::Post,
        paths::OPERATION,
        Ok(GatewayResponse::new(500, Some(json!({ "code": 500, "error": "busy" })))),
    );
    transport.enqueue(
        Method::Post,
        paths::OPERATION,
        Err(TransportError::Request {
            path: paths::OPERATION.to_string(),
            message: "connection reset".to_string(),
        }),
    );

    commands.set_mode("backup").await.expect("first");
    commands.set_mode("backup").await.expect("second");

    assert_eq!(transport.requests_to(Method::Get, paths::CONFIG_COMPLETED).len(), 2);
    assert!(transport.requests_to(Method::Post, paths::LOGIN).is_empty());
}

#[tokio::test]
async fn unauthenticated_commands_send_nothing() {
    let transport = Arc::new(MockTransport::new());
    let commands = dispatcher(&transport);

    let err = commands.set_reserve_percent(35).await.expect_err("mode");
    assert!(matches!(err, CommandError::NotAuthenticated));
    let err = commands.set_mode("backup").await.expect_err("mode");
    assert!(matches!(err, CommandError::NotAuthenticated));

    assert!(transport.requests().is_empty());
    assert_eq!(commands.reserve_percent().value(), 20);
}

#[tokio::test]
async fn invalid_values_are_rejected_before_sending() {
    let transport = Arc::new(MockTransport::new());
    let commands = logged_in(&transport).await;

    assert!(matches!(
        commands.set_mode("turbo").await,
        Err(CommandError::InvalidValue(_))
    ));
    assert!(matches!(
        commands.set_reserve_percent(120).await,
        Err(CommandError::InvalidValue(_))
    ));
    assert!(transport.requests().is_empty());
}
