//! Protocol client for newline-delimited command servers
//!
//! One client owns at most one TCP connection. Every connect and every
//! command ends in exactly one sample recorded into the shared sink.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::command::Command;
use crate::config::{TargetConfig, Timeouts};
use crate::error::ClientError;
use crate::metrics::{MetricsSink, Protocol, Sample};
use crate::{RESPONSE_BUFFER_SIZE, WELCOME_BUFFER_SIZE};

/// Operation name of connection samples
pub const CONNECT_OPERATION: &str = "connect";

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// Client for a single connection to the target server
pub struct ProtocolClient {
    user_id: usize,
    target: TargetConfig,
    metrics: Arc<MetricsSink>,
    stream: Option<TcpStream>,
    state: ConnectionState,
    welcome: Option<String>,
}

impl ProtocolClient {
    pub fn new(user_id: usize, target: TargetConfig, metrics: Arc<MetricsSink>) -> Self {
        Self {
            user_id,
            target,
            metrics,
            stream: None,
            state: ConnectionState::Disconnected,
            welcome: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Welcome message read right after the last successful connect
    pub fn welcome(&self) -> Option<&str> {
        self.welcome.as_deref()
    }

    pub fn target(&self) -> &TargetConfig {
        &self.target
    }

    /// Open the connection and read the server's welcome message.
    ///
    /// Returns the welcome length in bytes. The recorded latency covers the
    /// dial only; the welcome read is bounded by the read timeout.
    pub async fn connect(&mut self) -> Result<usize, ClientError> {
        if self.stream.is_some() {
            self.disconnect().await;
        }

        let addr = self.target.addr();
        self.state = ConnectionState::Connecting;

        match dial(&self.target, &addr).await {
            Ok((stream, latency, welcome)) => {
                let len = welcome.len();
                debug!(user = self.user_id, addr = %addr, welcome_len = len, "Connected");
                self.metrics.record(Sample::success(
                    self.user_id,
                    Protocol::Tcp,
                    CONNECT_OPERATION,
                    latency,
                    len,
                ));
                self.welcome = Some(String::from_utf8_lossy(&welcome).into_owned());
                self.stream = Some(stream);
                self.state = ConnectionState::Connected;
                Ok(len)
            }
            Err(err) => {
                warn!(user = self.user_id, "{}", err);
                self.metrics.record(Sample::failure(
                    self.user_id,
                    Protocol::Tcp,
                    CONNECT_OPERATION,
                    &err,
                ));
                self.state = ConnectionState::Disconnected;
                Err(err)
            }
        }
    }

    /// Send one command line and treat a single bounded read as its response.
    ///
    /// Responses split across several reads are not reassembled; a response
    /// that looks cut short is logged and counted as suspect framing.
    pub async fn send_command(&mut self, command: &Command) -> Result<String, ClientError> {
        let name = command.name();
        let timeouts = self.target.timeouts;

        let stream = match self.stream.as_mut() {
            Some(stream) if self.state == ConnectionState::Connected => stream,
            _ => {
                let err = ClientError::NotConnected;
                self.metrics.record(Sample::failure(self.user_id, Protocol::Cmd, name, &err));
                return Err(err);
            }
        };

        let line = command.to_line();
        let start = Instant::now();
        let result = round_trip(stream, line.as_bytes(), &timeouts).await;
        let latency = start.elapsed();

        let buf = match result {
            Ok(buf) => buf,
            Err(reason) => {
                let err = ClientError::Command {
                    name: name.to_string(),
                    reason,
                };
                warn!(user = self.user_id, "{}", err);
                self.metrics.record(Sample::failure(self.user_id, Protocol::Cmd, name, &err));
                return Err(err);
            }
        };

        if looks_truncated(&buf) {
            warn!(
                user = self.user_id,
                operation = name,
                bytes = buf.len(),
                "Response may be incomplete (single-read framing)"
            );
            self.metrics.record_suspect_framing();
        }

        let response = String::from_utf8_lossy(&buf).into_owned();
        if let Err(detail) = command.expectation().check(&response) {
            let err = ClientError::Validation {
                name: name.to_string(),
                detail,
            };
            warn!(user = self.user_id, "{}", err);
            self.metrics.record(Sample::failure(self.user_id, Protocol::Cmd, name, &err));
            return Err(err);
        }

        self.metrics.record(Sample::success(
            self.user_id,
            Protocol::Cmd,
            name,
            latency,
            buf.len(),
        ));
        Ok(response)
    }

    /// Close the connection. Safe to call any number of times; close errors
    /// are logged and otherwise ignored.
    pub async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                warn!(user = self.user_id, "Error closing socket: {}", e);
            }
            debug!(user = self.user_id, "Disconnected");
        }
        if self.state != ConnectionState::Disconnected {
            self.state = ConnectionState::Closed;
        }
    }
}

/// Dial the target and read the welcome message
async fn dial(
    target: &TargetConfig,
    addr: &str,
) -> Result<(TcpStream, Duration, Vec<u8>), ClientError> {
    let timeouts = target.timeouts;
    let connect_error = |reason: String| ClientError::Connect {
        addr: addr.to_string(),
        reason,
    };

    let start = Instant::now();
    let mut stream = match timeout(
        timeouts.connect,
        TcpStream::connect((target.host.as_str(), target.port)),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(connect_error(e.to_string())),
        Err(_) => {
            return Err(connect_error(format!(
                "timed out after {}ms",
                timeouts.connect.as_millis()
            )))
        }
    };
    let latency = start.elapsed();

    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }

    let mut welcome = vec![0u8; WELCOME_BUFFER_SIZE];
    let n = match timeout(timeouts.read, stream.read(&mut welcome)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Err(connect_error(format!("welcome read failed: {}", e))),
        Err(_) => {
            return Err(connect_error(format!(
                "welcome read timed out after {}ms",
                timeouts.read.as_millis()
            )))
        }
    };
    welcome.truncate(n);

    Ok((stream, latency, welcome))
}

/// Write one line, then perform exactly one bounded read
async fn round_trip(
    stream: &mut TcpStream,
    line: &[u8],
    timeouts: &Timeouts,
) -> Result<Vec<u8>, String> {
    match timeout(timeouts.write, stream.write_all(line)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(format!("write failed: {}", e)),
        Err(_) => {
            return Err(format!(
                "write timed out after {}ms",
                timeouts.write.as_millis()
            ))
        }
    }

    let mut buf = vec![0u8; RESPONSE_BUFFER_SIZE];
    let n = match timeout(timeouts.read, stream.read(&mut buf)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Err(format!("read failed: {}", e)),
        Err(_) => {
            return Err(format!(
                "read timed out after {}ms",
                timeouts.read.as_millis()
            ))
        }
    };
    buf.truncate(n);
    Ok(buf)
}

fn looks_truncated(buf: &[u8]) -> bool {
    buf.is_empty() || buf.len() >= RESPONSE_BUFFER_SIZE || !buf.ends_with(b"\n")
}
