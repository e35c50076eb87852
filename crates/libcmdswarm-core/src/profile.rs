//! Load profiles: weighted task tables, pacing and connection mode

use std::sync::Arc;
use std::time::Duration;

use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::command::{Command, Expectation};
use crate::error::{Result, SwarmError};

/// Commands picked from by the random-sequence task
const SEQUENCE_COMMANDS: [&str; 7] = [
    "ping",
    "time",
    "help",
    "echo hello",
    "echo world",
    "echo test message",
    "echo locust performance testing",
];

/// Commands picked from by the short-connection task
const SHORT_CONNECTION_COMMANDS: [&str; 3] = ["ping", "time", "echo short_test"];

/// How a virtual user holds its connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// One connection for the user's whole lifetime
    Persistent,
    /// A fresh connection per task: connect, one command, quit, disconnect
    PerRequest,
}

impl ConnectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionMode::Persistent => "persistent",
            ConnectionMode::PerRequest => "per_request",
        }
    }
}

/// One unit of user behavior
#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    Ping,
    Time,
    Echo,
    Help,
    /// Two to five random commands in quick succession
    RandomSequence,
    RapidPing,
    RapidEcho,
    PeriodicPing,
    PeriodicTime,
    /// Echo of a 1000-3000 byte payload
    LargeEcho,
    ShortConnection,
    /// Arbitrary command
    Command(Command),
}

impl Task {
    pub fn name(&self) -> &str {
        match self {
            Task::Ping => "ping",
            Task::Time => "time",
            Task::Echo => "echo",
            Task::Help => "help",
            Task::RandomSequence => "random_sequence",
            Task::RapidPing => "rapid_ping",
            Task::RapidEcho => "rapid_echo",
            Task::PeriodicPing => "periodic_ping",
            Task::PeriodicTime => "periodic_time",
            Task::LargeEcho => "large_echo",
            Task::ShortConnection => "short_connection",
            Task::Command(cmd) => cmd.name(),
        }
    }

    /// Whether the task issues exactly one command
    pub fn is_single_command(&self) -> bool {
        !matches!(self, Task::RandomSequence)
    }

    /// Build the command of a single-command task (None for sequences)
    pub fn command<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Command> {
        let cmd = match self {
            Task::Ping => Command::builtin("ping", "ping")
                .expecting(Expectation::ContainsIgnoreCase("pong".to_string())),
            Task::Time => Command::builtin("time", "time")
                .expecting(Expectation::ContainsIgnoreCase("current time".to_string())),
            Task::Echo => {
                let message = echo_message(rng);
                Command::builtin(format!("echo {}", message), "echo")
                    .expecting(Expectation::Contains(message))
            }
            Task::Help => Command::builtin("help", "help")
                .expecting(Expectation::ContainsIgnoreCase("available commands".to_string())),
            Task::RandomSequence => return None,
            Task::RapidPing => Command::builtin("ping", "stress_ping"),
            Task::RapidEcho => Command::builtin(
                format!("echo stress_test_{}", rng.gen_range(1..=1000)),
                "stress_echo",
            ),
            Task::PeriodicPing => Command::builtin("ping", "long_conn_ping"),
            Task::PeriodicTime => Command::builtin("time", "long_conn_time"),
            Task::LargeEcho => {
                let payload = "x".repeat(rng.gen_range(1000..=3000));
                Command::builtin(format!("echo {}", payload), "large_echo")
            }
            Task::ShortConnection => {
                let text = SHORT_CONNECTION_COMMANDS
                    .choose(rng)
                    .copied()
                    .unwrap_or("ping");
                Command::builtin(text, "short_conn")
            }
            Task::Command(cmd) => cmd.clone(),
        };
        Some(cmd)
    }

    /// Commands of the random-sequence task
    pub fn sequence<R: Rng + ?Sized>(rng: &mut R) -> Vec<Command> {
        let len = rng.gen_range(2..=5);
        (0..len)
            .map(|_| {
                let text = SEQUENCE_COMMANDS.choose(rng).copied().unwrap_or("ping");
                Command::builtin(text, "random_sequence")
            })
            .collect()
    }

    /// Pause between two commands of a sequence
    pub fn sequence_pause<R: Rng + ?Sized>(rng: &mut R) -> Duration {
        Duration::from_millis(rng.gen_range(10..=100))
    }
}

fn echo_message<R: Rng + ?Sized>(rng: &mut R) -> String {
    match rng.gen_range(0..5) {
        0 => "short".to_string(),
        1 => "medium length message for testing".to_string(),
        2 => "this is a longer message to test the echo functionality of the epoll server"
            .to_string(),
        3 => "a".repeat(100),
        _ => "b".repeat(500),
    }
}

/// A task and its relative selection weight
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedTask {
    pub task: Task,
    pub weight: u32,
}

/// Named behavior variant of a virtual user
#[derive(Debug, Clone)]
pub struct UserProfile {
    name: String,
    tasks: Vec<WeightedTask>,
    index: WeightedIndex<u32>,
    min_wait: Duration,
    max_wait: Duration,
    connection_mode: ConnectionMode,
}

impl UserProfile {
    pub fn new(
        name: impl Into<String>,
        tasks: Vec<(Task, u32)>,
        min_wait: Duration,
        max_wait: Duration,
        connection_mode: ConnectionMode,
    ) -> Result<Self> {
        let name = name.into();
        let invalid = |reason: String| SwarmError::InvalidProfile {
            name: name.clone(),
            reason,
        };

        if name.trim().is_empty() {
            return Err(invalid("profile name must not be empty".to_string()));
        }
        if min_wait > max_wait {
            return Err(invalid(format!(
                "min wait {:?} exceeds max wait {:?}",
                min_wait, max_wait
            )));
        }
        if connection_mode == ConnectionMode::PerRequest {
            if let Some((task, _)) = tasks.iter().find(|(task, _)| !task.is_single_command()) {
                return Err(invalid(format!(
                    "task '{}' issues several commands and needs a persistent connection",
                    task.name()
                )));
            }
        }

        let index = WeightedIndex::new(tasks.iter().map(|(_, weight)| *weight))
            .map_err(|e| invalid(format!("invalid task weights: {}", e)))?;

        Ok(Self {
            tasks: tasks
                .into_iter()
                .map(|(task, weight)| WeightedTask { task, weight })
                .collect(),
            name,
            index,
            min_wait,
            max_wait,
            connection_mode,
        })
    }

    fn builtin(
        name: &str,
        tasks: Vec<(Task, u32)>,
        wait_ms: (u64, u64),
        connection_mode: ConnectionMode,
    ) -> Self {
        Self::new(
            name,
            tasks,
            Duration::from_millis(wait_ms.0),
            Duration::from_millis(wait_ms.1),
            connection_mode,
        )
        .expect("built-in profiles are valid")
    }

    /// Standard: steady mixed load over one long-lived connection
    pub fn standard() -> Self {
        Self::builtin("standard", standard_tasks(), (100, 2_000), ConnectionMode::Persistent)
    }

    /// Stress: rapid-fire pings and echoes on top of the standard mix
    pub fn stress() -> Self {
        let mut tasks = standard_tasks();
        tasks.push((Task::RapidPing, 20));
        tasks.push((Task::RapidEcho, 10));
        Self::builtin("stress", tasks, (10, 100), ConnectionMode::Persistent)
    }

    /// Long connection: mostly idle connection with periodic traffic and large echoes
    pub fn long_connection() -> Self {
        let mut tasks = standard_tasks();
        tasks.push((Task::PeriodicPing, 5));
        tasks.push((Task::PeriodicTime, 3));
        tasks.push((Task::LargeEcho, 2));
        Self::builtin("long_connection", tasks, (1_000, 5_000), ConnectionMode::Persistent)
    }

    /// Short connection: connect, one command, quit, disconnect per task
    pub fn short_connection() -> Self {
        Self::builtin(
            "short_connection",
            vec![(Task::ShortConnection, 1)],
            (500, 2_000),
            ConnectionMode::PerRequest,
        )
    }

    /// Look up a built-in profile by name
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "standard" => Some(Self::standard()),
            "stress" => Some(Self::stress()),
            "long" | "long_connection" | "long-connection" => Some(Self::long_connection()),
            "short" | "short_connection" | "short-connection" => Some(Self::short_connection()),
            _ => None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tasks(&self) -> &[WeightedTask] {
        &self.tasks
    }

    pub fn connection_mode(&self) -> ConnectionMode {
        self.connection_mode
    }

    pub fn wait_range(&self) -> (Duration, Duration) {
        (self.min_wait, self.max_wait)
    }

    /// Draw a task according to the weight table
    pub fn select_task<R: Rng + ?Sized>(&self, rng: &mut R) -> &Task {
        &self.tasks[self.index.sample(rng)].task
    }

    /// Draw a think time uniformly from the wait range
    pub fn think_time<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.min_wait == self.max_wait {
            return self.min_wait;
        }
        let secs = rng.gen_range(self.min_wait.as_secs_f64()..=self.max_wait.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

fn standard_tasks() -> Vec<(Task, u32)> {
    vec![
        (Task::Ping, 10),
        (Task::Echo, 8),
        (Task::Time, 5),
        (Task::Help, 2),
        (Task::RandomSequence, 3),
    ]
}

/// Profiles making up a population, with relative weights
#[derive(Debug, Clone)]
pub struct ProfileMix {
    entries: Vec<(Arc<UserProfile>, u32)>,
}

impl Default for ProfileMix {
    /// All four built-in profiles, equally weighted
    fn default() -> Self {
        Self::new()
            .with(UserProfile::standard(), 1)
            .with(UserProfile::stress(), 1)
            .with(UserProfile::long_connection(), 1)
            .with(UserProfile::short_connection(), 1)
    }
}

impl ProfileMix {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn single(profile: UserProfile) -> Self {
        Self::new().with(profile, 1)
    }

    pub fn with(mut self, profile: UserProfile, weight: u32) -> Self {
        self.entries.push((Arc::new(profile), weight));
        self
    }

    /// True when no profile has a positive weight
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|(_, weight)| *weight == 0)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&UserProfile, u32)> {
        self.entries.iter().map(|(profile, weight)| (profile.as_ref(), *weight))
    }

    /// Split a population across profiles proportionally to their weights,
    /// using largest-remainder rounding. Counts are in entry order.
    pub fn allocate(&self, total: usize) -> Vec<usize> {
        let total_weight: u64 = self.entries.iter().map(|(_, w)| *w as u64).sum();
        if total_weight == 0 {
            return vec![0; self.entries.len()];
        }

        let mut counts = Vec::with_capacity(self.entries.len());
        let mut remainders = Vec::with_capacity(self.entries.len());
        for (idx, (_, weight)) in self.entries.iter().enumerate() {
            let quota = total as u64 * *weight as u64;
            counts.push((quota / total_weight) as usize);
            remainders.push((quota % total_weight, idx));
        }

        let assigned: usize = counts.iter().sum();
        remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        for (_, idx) in remainders.into_iter().take(total - assigned) {
            counts[idx] += 1;
        }
        counts
    }

    /// Order in which profiles are spawned: a smooth weighted round-robin
    /// over [`ProfileMix::allocate`] so every profile shows up early.
    pub fn spawn_order(&self, total: usize) -> Vec<Arc<UserProfile>> {
        let counts = self.allocate(total);
        let mut emitted = vec![0usize; counts.len()];
        let mut order = Vec::with_capacity(total);

        for _ in 0..total {
            let next = counts
                .iter()
                .enumerate()
                .filter(|(idx, count)| emitted[*idx] < **count)
                .map(|(idx, count)| (idx, (emitted[idx] as f64 + 0.5) / *count as f64))
                .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

            match next {
                Some((idx, _)) => {
                    emitted[idx] += 1;
                    order.push(Arc::clone(&self.entries[idx].0));
                }
                None => break,
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    #[test]
    fn test_weighted_selection_converges() {
        let a = Command::new("a").unwrap();
        let b = Command::new("b").unwrap();
        let profile = UserProfile::new(
            "ratio",
            vec![(Task::Command(a), 10), (Task::Command(b), 5)],
            Duration::ZERO,
            Duration::ZERO,
            ConnectionMode::Persistent,
        )
        .unwrap();

        let mut rng = StdRng::seed_from_u64(7);
        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..30_000 {
            let task = profile.select_task(&mut rng);
            *counts.entry(task.name().to_string()).or_insert(0) += 1;
        }

        let ratio = counts["a"] as f64 / counts["b"] as f64;
        assert!((ratio - 2.0).abs() < 0.1, "observed ratio {}", ratio);
    }

    #[test]
    fn test_zero_weight_task_never_selected() {
        let profile = UserProfile::new(
            "zero",
            vec![(Task::Ping, 0), (Task::Time, 1)],
            Duration::ZERO,
            Duration::ZERO,
            ConnectionMode::Persistent,
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..1_000 {
            assert_eq!(profile.select_task(&mut rng), &Task::Time);
        }
    }

    #[test]
    fn test_profile_validation() {
        let all_zero = UserProfile::new(
            "bad",
            vec![(Task::Ping, 0)],
            Duration::ZERO,
            Duration::ZERO,
            ConnectionMode::Persistent,
        );
        assert!(all_zero.is_err());

        let empty = UserProfile::new(
            "bad",
            vec![],
            Duration::ZERO,
            Duration::ZERO,
            ConnectionMode::Persistent,
        );
        assert!(empty.is_err());

        let inverted = UserProfile::new(
            "bad",
            vec![(Task::Ping, 1)],
            Duration::from_secs(2),
            Duration::from_secs(1),
            ConnectionMode::Persistent,
        );
        assert!(inverted.is_err());

        let sequence_per_request = UserProfile::new(
            "bad",
            vec![(Task::RandomSequence, 1)],
            Duration::ZERO,
            Duration::ZERO,
            ConnectionMode::PerRequest,
        );
        assert!(matches!(
            sequence_per_request,
            Err(SwarmError::InvalidProfile { .. })
        ));
    }

    #[test]
    fn test_builtin_profiles() {
        let standard = UserProfile::standard();
        assert_eq!(standard.tasks().len(), 5);
        assert_eq!(standard.wait_range(), (Duration::from_millis(100), Duration::from_secs(2)));
        assert_eq!(standard.connection_mode(), ConnectionMode::Persistent);

        let stress = UserProfile::stress();
        assert_eq!(stress.tasks().len(), 7);
        assert!(stress.tasks().contains(&WeightedTask { task: Task::RapidPing, weight: 20 }));
        assert!(stress.tasks().contains(&WeightedTask { task: Task::RapidEcho, weight: 10 }));

        let long = UserProfile::long_connection();
        assert!(long.tasks().contains(&WeightedTask { task: Task::LargeEcho, weight: 2 }));
        assert_eq!(long.wait_range().1, Duration::from_secs(5));

        let short = UserProfile::short_connection();
        assert_eq!(short.connection_mode(), ConnectionMode::PerRequest);
        assert_eq!(short.tasks().len(), 1);
    }

    #[test]
    fn test_from_name() {
        assert_eq!(UserProfile::from_name("Stress").unwrap().name(), "stress");
        assert_eq!(UserProfile::from_name("long").unwrap().name(), "long_connection");
        assert_eq!(UserProfile::from_name("short-connection").unwrap().name(), "short_connection");
        assert!(UserProfile::from_name("unknown").is_none());
    }

    #[test]
    fn test_think_time_within_bounds() {
        let profile = UserProfile::stress();
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..1_000 {
            let wait = profile.think_time(&mut rng);
            assert!(wait >= Duration::from_millis(10) && wait <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_task_commands() {
        let mut rng = StdRng::seed_from_u64(11);

        let ping = Task::Ping.command(&mut rng).unwrap();
        assert_eq!(ping.text(), "ping");
        assert!(ping.expectation().check("pong\n").is_ok());

        let echo = Task::Echo.command(&mut rng).unwrap();
        assert_eq!(echo.name(), "echo");
        let message = echo.text().strip_prefix("echo ").unwrap();
        assert!(echo.expectation().check(&format!("{}\n", message)).is_ok());

        let large = Task::LargeEcho.command(&mut rng).unwrap();
        let payload_len = large.text().len() - "echo ".len();
        assert!((1000..=3000).contains(&payload_len));

        let rapid = Task::RapidEcho.command(&mut rng).unwrap();
        assert!(rapid.text().starts_with("echo stress_test_"));
        assert_eq!(rapid.name(), "stress_echo");

        let short = Task::ShortConnection.command(&mut rng).unwrap();
        assert_eq!(short.name(), "short_conn");
        assert!(SHORT_CONNECTION_COMMANDS.contains(&short.text()));

        assert!(Task::RandomSequence.command(&mut rng).is_none());
    }

    #[test]
    fn test_sequence_length_and_names() {
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..200 {
            let seq = Task::sequence(&mut rng);
            assert!((2..=5).contains(&seq.len()));
            assert!(seq.iter().all(|c| c.name() == "random_sequence"));
        }
        let pause = Task::sequence_pause(&mut rng);
        assert!(pause >= Duration::from_millis(10) && pause <= Duration::from_millis(100));
    }

    #[test]
    fn test_allocate_largest_remainder() {
        let mix = ProfileMix::new()
            .with(UserProfile::standard(), 2)
            .with(UserProfile::stress(), 1);
        assert_eq!(mix.allocate(3), vec![2, 1]);
        assert_eq!(mix.allocate(4), vec![3, 1]);
        assert_eq!(mix.allocate(0), vec![0, 0]);

        let even = ProfileMix::default();
        assert_eq!(even.allocate(10), vec![3, 3, 2, 2]);
        assert_eq!(even.allocate(10).iter().sum::<usize>(), 10);
    }

    #[test]
    fn test_spawn_order_interleaves() {
        let mix = ProfileMix::new()
            .with(UserProfile::standard(), 2)
            .with(UserProfile::stress(), 1);
        let names: Vec<String> = mix
            .spawn_order(3)
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(names, vec!["standard", "stress", "standard"]);
    }

    #[test]
    fn test_empty_mix() {
        assert!(ProfileMix::new().is_empty());
        assert!(ProfileMix::new().with(UserProfile::standard(), 0).is_empty());
        assert!(!ProfileMix::default().is_empty());
        assert!(ProfileMix::new().spawn_order(5).is_empty());
    }
}
