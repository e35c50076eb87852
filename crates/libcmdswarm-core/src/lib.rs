//! Virtual-user engine for load testing line-based TCP command servers
//!
//! This crate provides:
//! - A protocol client for newline-delimited request/response servers (ProtocolClient)
//! - Weighted task tables and named load profiles (UserProfile, ProfileMix)
//! - The per-user behavior loop (VirtualUser)
//! - A scheduler that ramps up, runs and gracefully stops a population of users
//! - A thread-safe metrics sink with point-in-time snapshots (MetricsSink)

pub mod client;
pub mod command;
pub mod config;
pub mod error;
pub mod metrics;
pub mod profile;
pub mod scheduler;
pub mod user;

pub use client::{ConnectionState, ProtocolClient};
pub use command::{Command, Expectation};
pub use config::{RunConfig, TargetConfig, Timeouts};
pub use error::{ClientError, FailureKind, Result, SwarmError};
pub use metrics::{
    MetricsSink, MetricsSnapshot, OperationStats, Protocol, RecentError, Sample, UserMetrics,
    UserStatus,
};
pub use profile::{ConnectionMode, ProfileMix, Task, UserProfile, WeightedTask};
pub use scheduler::{
    ProfileAllocation, RunInfo, RunObserver, RunSummary, Scheduler, StopHandle, StopReason,
    StopSignal,
};
pub use user::{UserOutcome, UserReport, VirtualUser};

/// Default TCP port when the target host omits one
pub const DEFAULT_PORT: u16 = 8080;

/// Default connect timeout in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Default read/write timeout in milliseconds
pub const DEFAULT_IO_TIMEOUT_MS: u64 = 10_000;

/// Default grace period for users to finish after a stop signal
pub const DEFAULT_GRACE_TIMEOUT_MS: u64 = 10_000;

/// Upper bound for the single read of the server welcome message
pub const WELCOME_BUFFER_SIZE: usize = 1024;

/// Upper bound for the single read of a command response
pub const RESPONSE_BUFFER_SIZE: usize = 4096;

/// Command asking the server to end the session
pub const QUIT_COMMAND: &str = "quit";
