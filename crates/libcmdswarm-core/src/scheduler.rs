//! Population scheduler
//!
//! Ramps the virtual-user population up at the configured spawn rate, keeps
//! it running until a stop is requested (or the run time elapses, or every
//! user has exited), then broadcasts a cooperative stop and waits up to the
//! grace timeout before aborting whatever is still running.

use std::future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{serde_duration, RunConfig};
use crate::error::Result;
use crate::metrics::{MetricsSink, MetricsSnapshot, UserStatus, UserTracker};
use crate::profile::UserProfile;
use crate::user::{UserOutcome, UserReport, VirtualUser};

/// Receiving side of the global stop broadcast
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once a stop is requested (or the handle is gone)
    pub async fn stopped(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Cloneable trigger for the cooperative shutdown
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StopHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request shutdown. Idempotent.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Lifecycle hooks invoked synchronously by the scheduler
pub trait RunObserver: Send + Sync {
    fn on_run_start(&self, _info: &RunInfo) {}

    fn on_run_stop(&self, _summary: &RunSummary) {}
}

/// Users allotted to one profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileAllocation {
    pub profile: String,
    pub weight: u32,
    pub users: usize,
}

/// Run parameters, reported when the run starts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub target: String,
    pub users: usize,
    pub spawn_rate: f64,
    pub run_time_secs: Option<f64>,
    pub profiles: Vec<ProfileAllocation>,
}

/// Why the main phase of a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Stop requested through a [`StopHandle`]
    Requested,
    /// Configured run time elapsed
    RunTimeElapsed,
    /// Every user was spawned and has already exited
    AllUsersExited,
}

/// Outcome of a finished run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    #[serde(with = "serde_duration")]
    pub elapsed: Duration,
    pub stop_reason: StopReason,
    pub users_spawned: usize,
    /// Users whose start-up connection failed
    pub spawn_failures: usize,
    pub users_stopped: usize,
    /// Users still running after the grace timeout
    pub users_aborted: usize,
    pub users_panicked: usize,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Default)]
struct Tally {
    spawn_failures: usize,
    stopped: usize,
    aborted: usize,
    panicked: usize,
}

impl Tally {
    fn record(&mut self, joined: std::result::Result<UserReport, JoinError>) {
        match joined {
            Ok(report) => match report.outcome {
                UserOutcome::Stopped => self.stopped += 1,
                UserOutcome::ConnectFailed(_) => self.spawn_failures += 1,
            },
            Err(e) if e.is_cancelled() => self.aborted += 1,
            Err(e) => {
                error!("User task panicked: {}", e);
                self.panicked += 1;
            }
        }
    }
}

/// Marks a user Aborted or Failed when its task is dropped before the user
/// reached a terminal status
struct StatusGuard(Arc<UserTracker>);

impl Drop for StatusGuard {
    fn drop(&mut self) {
        match self.0.status() {
            UserStatus::Stopped | UserStatus::Failed => {}
            _ if std::thread::panicking() => self.0.set_status(UserStatus::Failed),
            _ => self.0.set_status(UserStatus::Aborted),
        }
    }
}

/// Owns one run: the population, its stop broadcast and its observers
pub struct Scheduler {
    config: RunConfig,
    metrics: Arc<MetricsSink>,
    observers: Vec<Arc<dyn RunObserver>>,
    stop: StopHandle,
}

impl Scheduler {
    pub fn new(config: RunConfig, metrics: Arc<MetricsSink>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            metrics,
            observers: Vec::new(),
            stop: StopHandle::new(),
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn metrics(&self) -> &Arc<MetricsSink> {
        &self.metrics
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Run the load test to completion
    pub async fn run(self) -> RunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();

        let order = self.config.profiles.spawn_order(self.config.users);
        let info = self.run_info(run_id, started_at);
        for observer in &self.observers {
            observer.on_run_start(&info);
        }
        info!(
            run_id = %run_id,
            target = %info.target,
            users = self.config.users,
            spawn_rate = self.config.spawn_rate,
            "Load test starting"
        );

        let mut stop_signal = self.stop.signal();
        let run_timer = async {
            match self.config.run_time {
                Some(run_time) => sleep(run_time).await,
                None => future::pending::<()>().await,
            }
        };
        tokio::pin!(run_timer);

        let mut users: JoinSet<UserReport> = JoinSet::new();
        let mut tally = Tally::default();
        let mut spawned = 0usize;

        let stop_reason = loop {
            let due = spawn_due(start.elapsed(), self.config.spawn_rate, order.len());
            while spawned < due {
                self.spawn_user(&mut users, spawned, &order[spawned]);
                spawned += 1;
            }
            if spawned == order.len() && users.is_empty() {
                break StopReason::AllUsersExited;
            }

            let next_spawn = (spawned < order.len())
                .then(|| spawn_time(start, spawned, self.config.spawn_rate))
                .flatten();

            tokio::select! {
                _ = stop_signal.stopped() => break StopReason::Requested,
                _ = &mut run_timer => break StopReason::RunTimeElapsed,
                Some(joined) = users.join_next(), if !users.is_empty() => tally.record(joined),
                _ = sleep_until(next_spawn.unwrap_or(start)), if next_spawn.is_some() => {}
            }
        };

        self.stop.stop();
        info!(reason = ?stop_reason, running = users.len(), "Stopping users");

        let grace = sleep(self.config.grace_timeout);
        tokio::pin!(grace);
        loop {
            tokio::select! {
                joined = users.join_next() => match joined {
                    Some(joined) => tally.record(joined),
                    None => break,
                },
                _ = &mut grace => {
                    warn!(remaining = users.len(), "Grace period elapsed, aborting users");
                    users.abort_all();
                    break;
                }
            }
        }
        while let Some(joined) = users.join_next().await {
            tally.record(joined);
        }

        self.metrics.close_subscribers();

        let summary = RunSummary {
            run_id,
            started_at,
            elapsed: start.elapsed(),
            stop_reason,
            users_spawned: spawned,
            spawn_failures: tally.spawn_failures,
            users_stopped: tally.stopped,
            users_aborted: tally.aborted,
            users_panicked: tally.panicked,
            metrics: self.metrics.snapshot(),
        };
        info!(
            run_id = %run_id,
            elapsed_secs = summary.elapsed.as_secs_f64(),
            requests = summary.metrics.total_requests(),
            failures = summary.metrics.total_failures(),
            "Load test finished"
        );

        for observer in &self.observers {
            observer.on_run_stop(&summary);
        }
        summary
    }

    fn spawn_user(&self, users: &mut JoinSet<UserReport>, id: usize, profile: &Arc<UserProfile>) {
        let user = VirtualUser::new(
            id,
            Arc::clone(profile),
            self.config.target.clone(),
            Arc::clone(&self.metrics),
        );
        let guard = StatusGuard(user.tracker());
        let signal = self.stop.signal();

        users.spawn(async move {
            let _guard = guard;
            user.run(signal).await
        });
        debug!(user = id, profile = %profile.name(), "Spawned user");
    }

    fn run_info(&self, run_id: Uuid, started_at: DateTime<Utc>) -> RunInfo {
        let counts = self.config.profiles.allocate(self.config.users);
        let profiles = self
            .config
            .profiles
            .entries()
            .zip(counts)
            .map(|((profile, weight), users)| ProfileAllocation {
                profile: profile.name().to_string(),
                weight,
                users,
            })
            .collect();

        RunInfo {
            run_id,
            started_at,
            target: self.config.target.addr(),
            users: self.config.users,
            spawn_rate: self.config.spawn_rate,
            run_time_secs: self.config.run_time.map(|d| d.as_secs_f64()),
            profiles,
        }
    }
}

/// Users that should exist after `elapsed`: `floor(rate * t) + 1`, capped
fn spawn_due(elapsed: Duration, rate: f64, total: usize) -> usize {
    if total == 0 {
        return 0;
    }
    let due = (elapsed.as_secs_f64() * rate).floor();
    if due >= total as f64 {
        total
    } else {
        (due as usize + 1).min(total)
    }
}

/// When user number `index` (0-based) becomes due
fn spawn_time(start: Instant, index: usize, rate: f64) -> Option<Instant> {
    let offset = Duration::try_from_secs_f64(index as f64 / rate).ok()?;
    start.checked_add(offset)
}
