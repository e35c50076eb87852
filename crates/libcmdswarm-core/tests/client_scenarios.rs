//! Protocol client behavior against stub servers

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use libcmdswarm_core::{
    ClientError, Command, ConnectionState, Expectation, FailureKind, MetricsSink, Protocol,
    ProtocolClient, TargetConfig,
};

use common::{closed_port, closing_server, command_server, spawn_server, WELCOME};

const TIMEOUT: Duration = Duration::from_millis(500);

#[tokio::test]
async fn test_ping_records_one_successful_sample() {
    let server = spawn_server(WELCOME, |line| {
        line.starts_with("ping").then(|| "pong\n".to_string())
    })
    .await;
    let metrics = Arc::new(MetricsSink::new());
    let mut client = ProtocolClient::new(0, server.target(TIMEOUT), metrics.clone());

    let welcome_len = client.connect().await.unwrap();
    assert_eq!(welcome_len, WELCOME.len());
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(client.welcome(), Some(WELCOME));

    let response = client.send_command(&Command::new("ping").unwrap()).await.unwrap();
    assert_eq!(response, "pong\n");

    let snapshot = metrics.snapshot();
    let ping = snapshot.operation(Protocol::Cmd, "ping").unwrap();
    assert_eq!(ping.requests, 1);
    assert_eq!(ping.failures, 0);
    assert_eq!(ping.response_size.total_bytes, 5);
    assert!(ping.latency.max_ms > 0.0);

    let connect = snapshot.operation(Protocol::Tcp, "connect").unwrap();
    assert_eq!(connect.requests, 1);
    assert_eq!(connect.response_size.total_bytes, WELCOME.len() as u64);
    assert_eq!(snapshot.suspect_framing, 0);
}

#[tokio::test]
async fn test_server_closing_immediately_still_connects() {
    let addr = closing_server().await;
    let metrics = Arc::new(MetricsSink::new());
    let target = TargetConfig::new("127.0.0.1", addr.port());
    let mut client = ProtocolClient::new(0, target, metrics.clone());

    let welcome_len = client.connect().await.unwrap();
    assert_eq!(welcome_len, 0);

    let snapshot = metrics.snapshot();
    let connect = snapshot.operation(Protocol::Tcp, "connect").unwrap();
    assert_eq!(connect.requests, 1);
    assert_eq!(connect.failures, 0);
    assert_eq!(connect.response_size.total_bytes, 0);
}

#[tokio::test]
async fn test_silent_server_times_out() {
    let server = spawn_server(WELCOME, |_| None).await;
    let metrics = Arc::new(MetricsSink::new());
    let target = server.target(Duration::from_millis(200));
    let mut client = ProtocolClient::new(0, target, metrics.clone());
    client.connect().await.unwrap();

    let start = Instant::now();
    let err = client
        .send_command(&Command::new("ping").unwrap())
        .await
        .unwrap_err();
    let elapsed = start.elapsed();

    assert_eq!(err.kind(), FailureKind::CommandFailure);
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(5));
    // The client leaves the connection as it was
    assert_eq!(client.state(), ConnectionState::Connected);

    let snapshot = metrics.snapshot();
    let ping = snapshot.operation(Protocol::Cmd, "ping").unwrap();
    assert_eq!(ping.failures, 1);
    assert_eq!(ping.failures_by_kind.get(&FailureKind::CommandFailure), Some(&1));
}

#[tokio::test]
async fn test_connection_refused() {
    let port = closed_port().await;
    let metrics = Arc::new(MetricsSink::new());
    let mut client = ProtocolClient::new(7, TargetConfig::new("127.0.0.1", port), metrics.clone());

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, ClientError::Connect { .. }));
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let err = client.send_command(&Command::new("ping").unwrap()).await.unwrap_err();
    assert_eq!(err, ClientError::NotConnected);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.total_requests(), 2);
    assert_eq!(snapshot.total_failures(), 2);
    let connect = snapshot.operation(Protocol::Tcp, "connect").unwrap();
    assert_eq!(connect.failures_by_kind.get(&FailureKind::ConnectFailure), Some(&1));
    let ping = snapshot.operation(Protocol::Cmd, "ping").unwrap();
    assert_eq!(ping.failures_by_kind.get(&FailureKind::NotConnected), Some(&1));
}

#[tokio::test]
async fn test_double_disconnect_is_silent() {
    let server = command_server().await;
    let metrics = Arc::new(MetricsSink::new());
    let mut client = ProtocolClient::new(0, server.target(TIMEOUT), metrics.clone());
    client.connect().await.unwrap();

    client.disconnect().await;
    client.disconnect().await;

    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(metrics.total_requests(), 1);
}

#[tokio::test]
async fn test_reconnect_replaces_stream() {
    let server = command_server().await;
    let metrics = Arc::new(MetricsSink::new());
    let mut client = ProtocolClient::new(0, server.target(TIMEOUT), metrics.clone());

    client.connect().await.unwrap();
    client.connect().await.unwrap();
    assert_eq!(server.accepted(), 2);

    let response = client.send_command(&Command::new("echo again").unwrap()).await.unwrap();
    assert_eq!(response, "again\n");
}

#[tokio::test]
async fn test_validation_failure_is_recorded() {
    let server = spawn_server(WELCOME, |_| Some("nope\n".to_string())).await;
    let metrics = Arc::new(MetricsSink::new());
    let mut client = ProtocolClient::new(0, server.target(TIMEOUT), metrics.clone());
    client.connect().await.unwrap();

    let ping = Command::new("ping")
        .unwrap()
        .expecting(Expectation::ContainsIgnoreCase("pong".to_string()));
    let err = client.send_command(&ping).await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::ValidationFailure);

    // The connection is still usable afterwards
    let echo = Command::new("echo x").unwrap();
    assert!(client.send_command(&echo).await.is_ok());

    let snapshot = metrics.snapshot();
    let stats = snapshot.operation(Protocol::Cmd, "ping").unwrap();
    assert_eq!(stats.requests, 1);
    assert_eq!(stats.failures, 1);
    assert_eq!(stats.failures_by_kind.get(&FailureKind::ValidationFailure), Some(&1));
}

#[tokio::test]
async fn test_response_without_newline_is_flagged() {
    let server = spawn_server(WELCOME, |_| Some("partial".to_string())).await;
    let metrics = Arc::new(MetricsSink::new());
    let mut client = ProtocolClient::new(0, server.target(TIMEOUT), metrics.clone());
    client.connect().await.unwrap();

    let response = client.send_command(&Command::new("ping").unwrap()).await.unwrap();
    assert_eq!(response, "partial");

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.suspect_framing, 1);
    assert_eq!(snapshot.operation(Protocol::Cmd, "ping").unwrap().failures, 0);
}

#[tokio::test]
async fn test_reported_size_matches_received_bytes() {
    let server = command_server().await;
    let metrics = Arc::new(MetricsSink::new());
    let mut client = ProtocolClient::new(0, server.target(TIMEOUT), metrics.clone());
    client.connect().await.unwrap();

    let payload = "z".repeat(300);
    let command = Command::named(format!("echo {}", payload), "big").unwrap();
    let response = client.send_command(&command).await.unwrap();

    let snapshot = metrics.snapshot();
    let stats = snapshot.operation(Protocol::Cmd, "big").unwrap();
    assert_eq!(stats.response_size.total_bytes, response.len() as u64);
    assert_eq!(response.len(), 301);
}
