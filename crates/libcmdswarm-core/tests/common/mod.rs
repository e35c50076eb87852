//! Stub line servers for integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use libcmdswarm_core::{TargetConfig, Timeouts};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

pub const WELCOME: &str = "welcome\n";

/// A running stub server and the number of connections it has accepted
pub struct StubServer {
    pub addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
}

impl StubServer {
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn target(&self, timeout: Duration) -> TargetConfig {
        TargetConfig::new(self.addr.ip().to_string(), self.addr.port()).with_timeouts(Timeouts {
            connect: timeout,
            read: timeout,
            write: timeout,
        })
    }
}

/// Sends `welcome`, then answers each line with `respond(line)`; `None`
/// means the line gets no answer at all
pub async fn spawn_server<F>(welcome: &'static str, respond: F) -> StubServer
where
    F: Fn(&str) -> Option<String> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let respond = Arc::new(respond);

    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            counter.fetch_add(1, Ordering::SeqCst);

            let respond = Arc::clone(&respond);
            tokio::spawn(async move {
                let (reader, mut writer) = stream.into_split();
                if writer.write_all(welcome.as_bytes()).await.is_err() {
                    return;
                }
                let mut lines = BufReader::new(reader).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(reply) = respond(&line) {
                        if writer.write_all(reply.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });

    StubServer { addr, accepted }
}

/// Reply the reference command server gives to `line`
pub fn command_reply(line: &str) -> String {
    let line = line.trim();
    if line.starts_with("ping") {
        "pong\n".to_string()
    } else if line == "time" {
        "Current time: Mon Jan  1 00:00:00 2024\n".to_string()
    } else if line == "help" {
        "Available commands: ping, echo <msg>, time, help, quit\n".to_string()
    } else if line == "quit" {
        "Goodbye!\n".to_string()
    } else if let Some(msg) = line.strip_prefix("echo ") {
        format!("{}\n", msg)
    } else {
        format!("Unknown command: {}\n", line)
    }
}

/// Server modelled on the reference command server
pub async fn command_server() -> StubServer {
    spawn_server(WELCOME, |line| Some(command_reply(line))).await
}

/// Command server whose very first reply (across all connections) is sent
/// only after `lag`
pub async fn lagging_server(lag: Duration) -> StubServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let lagged = Arc::new(AtomicBool::new(false));

    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);

            let lagged = Arc::clone(&lagged);
            tokio::spawn(async move {
                let (reader, mut writer) = stream.into_split();
                if writer.write_all(WELCOME.as_bytes()).await.is_err() {
                    return;
                }
                let mut lines = BufReader::new(reader).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !lagged.swap(true, Ordering::SeqCst) {
                        tokio::time::sleep(lag).await;
                    }
                    if writer.write_all(command_reply(&line).as_bytes()).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    StubServer { addr, accepted }
}

/// Accepts connections and closes them without sending anything
pub async fn closing_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    });
    addr
}

/// A port nothing listens on
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}
