//! Virtual users
//!
//! A virtual user drives its own protocol client through the loop
//! `on_start -> (select, pace, run)* -> on_stop`. The stop signal is only
//! checked between tasks and while pacing, never in the middle of a command.
//!
//! A persistent connection whose command failed is dropped, since a late
//! reply would otherwise be read as the answer to the next command. The next
//! task dials again.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, warn};

use crate::client::ProtocolClient;
use crate::command::Command;
use crate::config::TargetConfig;
use crate::error::{ClientError, FailureKind};
use crate::metrics::{MetricsSink, UserMetrics, UserStatus, UserTracker};
use crate::profile::{ConnectionMode, Task, UserProfile};
use crate::scheduler::StopSignal;
use crate::QUIT_COMMAND;

/// How a virtual user's run ended
#[derive(Debug, Clone, PartialEq)]
pub enum UserOutcome {
    /// Ran until the stop signal and shut down gracefully
    Stopped,
    /// The start-up connection failed; the user never entered its loop
    ConnectFailed(ClientError),
}

/// Final report of one virtual user
#[derive(Debug, Clone)]
pub struct UserReport {
    pub user_id: usize,
    pub profile: String,
    pub outcome: UserOutcome,
    pub metrics: UserMetrics,
}

/// One simulated client bound to a profile
pub struct VirtualUser {
    id: usize,
    profile: Arc<UserProfile>,
    target: TargetConfig,
    metrics: Arc<MetricsSink>,
    tracker: Arc<UserTracker>,
    /// Long-lived connection (Persistent mode only)
    client: ProtocolClient,
    rng: StdRng,
}

impl VirtualUser {
    pub fn new(
        id: usize,
        profile: Arc<UserProfile>,
        target: TargetConfig,
        metrics: Arc<MetricsSink>,
    ) -> Self {
        let tracker = metrics.register_user(id, profile.name());
        let client = ProtocolClient::new(id, target.clone(), Arc::clone(&metrics));

        Self {
            id,
            profile,
            target,
            metrics,
            tracker,
            client,
            rng: StdRng::from_entropy(),
        }
    }

    /// Use a deterministic random stream
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn profile(&self) -> &UserProfile {
        &self.profile
    }

    pub fn tracker(&self) -> Arc<UserTracker> {
        Arc::clone(&self.tracker)
    }

    /// Connect up front in Persistent mode. No retry: a failure here ends
    /// the user's run.
    pub async fn on_start(&mut self) -> Result<(), ClientError> {
        if self.profile.connection_mode() == ConnectionMode::Persistent {
            self.client.connect().await?;
            self.tracker.connection_opened();
        }
        Ok(())
    }

    /// Run the behavior loop until `stop` fires
    pub async fn run(mut self, mut stop: StopSignal) -> UserReport {
        if stop.is_stopped() {
            self.tracker.set_status(UserStatus::Stopped);
            return self.report(UserOutcome::Stopped);
        }

        if let Err(err) = self.on_start().await {
            warn!(
                user = self.id,
                profile = %self.profile.name(),
                "User failed to start: {}",
                err
            );
            self.tracker.set_status(UserStatus::Failed);
            return self.report(UserOutcome::ConnectFailed(err));
        }

        self.tracker.set_status(UserStatus::Running);
        debug!(user = self.id, profile = %self.profile.name(), "User started");

        let profile = Arc::clone(&self.profile);
        loop {
            if stop.is_stopped() {
                break;
            }

            let task = profile.select_task(&mut self.rng);
            let wait = profile.think_time(&mut self.rng);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = stop.stopped() => break,
            }

            if stop.is_stopped() {
                break;
            }
            // Failures are already recorded as samples; keep going
            let _ = self.run_task(task).await;
        }

        self.tracker.set_status(UserStatus::Stopping);
        self.on_stop().await;
        self.tracker.set_status(UserStatus::Stopped);
        debug!(user = self.id, "User stopped");

        self.report(UserOutcome::Stopped)
    }

    /// Execute one task and update the user's counters
    pub async fn run_task(&mut self, task: &Task) -> Result<(), ClientError> {
        let result = match self.profile.connection_mode() {
            ConnectionMode::Persistent => self.run_persistent(task).await,
            ConnectionMode::PerRequest => self.run_per_request(task).await,
        };

        match &result {
            Ok(()) => self.tracker.task_completed(),
            Err(err) => {
                self.tracker.task_failed();
                debug!(
                    user = self.id,
                    task = task.name(),
                    kind = err.kind().as_str(),
                    "Task failed"
                );
            }
        }
        result
    }

    /// Best-effort quit, then always close (Persistent mode)
    pub async fn on_stop(&mut self) {
        if self.client.is_connected() {
            let quit = Command::builtin(QUIT_COMMAND, QUIT_COMMAND);
            if let Err(err) = self.client.send_command(&quit).await {
                debug!(user = self.id, "Quit failed during shutdown: {}", err);
            }
        }
        self.client.disconnect().await;
    }

    async fn run_persistent(&mut self, task: &Task) -> Result<(), ClientError> {
        if !self.client.is_connected() {
            self.client.connect().await?;
            self.tracker.connection_opened();
            debug!(user = self.id, "Reconnected");
        }

        let result = if task.is_single_command() {
            self.run_single(task).await
        } else {
            self.run_sequence().await
        };

        if let Err(ref err) = result {
            if err.kind() == FailureKind::CommandFailure {
                debug!(user = self.id, "Dropping connection after failed command");
                self.client.disconnect().await;
            }
        }
        result
    }

    async fn run_single(&mut self, task: &Task) -> Result<(), ClientError> {
        match task.command(&mut self.rng) {
            Some(command) => self.client.send_command(&command).await.map(|_| ()),
            None => Ok(()),
        }
    }

    async fn run_sequence(&mut self) -> Result<(), ClientError> {
        let commands = Task::sequence(&mut self.rng);
        for (step, command) in commands.iter().enumerate() {
            if let Err(err) = self.client.send_command(command).await {
                warn!(user = self.id, step = step + 1, "Random sequence aborted: {}", err);
                return Err(err);
            }
            tokio::time::sleep(Task::sequence_pause(&mut self.rng)).await;
        }
        Ok(())
    }

    /// Fresh connection, one command, quit, disconnect
    async fn run_per_request(&mut self, task: &Task) -> Result<(), ClientError> {
        let command = match task.command(&mut self.rng) {
            Some(command) => command,
            None => return Ok(()),
        };

        let target = self.target.clone();
        let mut client = ProtocolClient::new(self.id, target, Arc::clone(&self.metrics));
        client.connect().await?;
        self.tracker.connection_opened();

        let result = client.send_command(&command).await.map(|_| ());
        if result.is_ok() {
            let quit = Command::builtin(QUIT_COMMAND, &format!("{}_quit", command.name()));
            if let Err(err) = client.send_command(&quit).await {
                debug!(user = self.id, "Quit failed: {}", err);
            }
        }
        client.disconnect().await;
        result
    }

    fn report(&self, outcome: UserOutcome) -> UserReport {
        UserReport {
            user_id: self.id,
            profile: self.profile.name().to_string(),
            outcome,
            metrics: self.tracker.snapshot(),
        }
    }
}
