//! Thread-safe metrics collection
//!
//! Every operation performed by a virtual user ends in exactly one [`Sample`].
//! Samples are folded into per-`(protocol, operation)` accumulators as they
//! arrive; nothing is buffered or dropped. Writers only take the shared side
//! of the operation map (the exclusive side is needed once per new key) plus
//! the mutex of their own accumulator, so snapshot readers never stop the
//! whole population.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::serde_duration;
use crate::error::{ClientError, FailureKind};

/// Number of recent error messages kept for reporting
const ERROR_LOG_CAPACITY: usize = 100;

/// Number of throughput samples kept (one per second)
const THROUGHPUT_HISTORY: usize = 60;

/// Highest trackable latency: one hour, in microseconds
const MAX_TRACKABLE_LATENCY_US: u64 = 3_600_000_000;

/// Request type of a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Protocol {
    /// Connection establishment
    #[serde(rename = "TCP")]
    Tcp,
    /// Command round trip
    #[serde(rename = "CMD")]
    Cmd,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Cmd => "CMD",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error attached to a failed sample
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleError {
    pub kind: FailureKind,
    pub message: String,
}

/// One measured operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Virtual user that performed the operation
    pub user_id: usize,
    pub protocol: Protocol,
    pub name: String,
    #[serde(with = "serde_duration")]
    pub latency: Duration,
    pub response_len: usize,
    pub error: Option<SampleError>,
}

impl Sample {
    /// A successful operation. Zero latency is reserved for failures, so a
    /// measurement below the clock resolution is raised to one nanosecond.
    pub fn success(
        user_id: usize,
        protocol: Protocol,
        name: impl Into<String>,
        latency: Duration,
        response_len: usize,
    ) -> Self {
        Self {
            user_id,
            protocol,
            name: name.into(),
            latency: latency.max(Duration::from_nanos(1)),
            response_len,
            error: None,
        }
    }

    /// A failed operation: zero latency, zero size
    pub fn failure(
        user_id: usize,
        protocol: Protocol,
        name: impl Into<String>,
        error: &ClientError,
    ) -> Self {
        Self {
            user_id,
            protocol,
            name: name.into(),
            latency: Duration::ZERO,
            response_len: 0,
            error: Some(SampleError {
                kind: error.kind(),
                message: error.to_string(),
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn latency_ms(&self) -> f64 {
        self.latency.as_secs_f64() * 1000.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct OperationKey {
    protocol: Protocol,
    name: String,
}

/// Running totals for one operation
struct OperationAccumulator {
    requests: u64,
    failures: u64,
    // Successful latencies in microseconds
    latency_us: Histogram<u64>,
    latency_sum_us: u64,
    latency_min_us: u64,
    latency_max_us: u64,
    bytes_total: u64,
    bytes_min: u64,
    bytes_max: u64,
    failures_by_kind: BTreeMap<FailureKind, u64>,
}

impl OperationAccumulator {
    fn new() -> Self {
        Self {
            requests: 0,
            failures: 0,
            // 1 microsecond to 1 hour, 3 significant figures
            latency_us: Histogram::new_with_bounds(1, MAX_TRACKABLE_LATENCY_US, 3)
                .expect("static histogram bounds are valid"),
            latency_sum_us: 0,
            latency_min_us: u64::MAX,
            latency_max_us: 0,
            bytes_total: 0,
            bytes_min: u64::MAX,
            bytes_max: 0,
            failures_by_kind: BTreeMap::new(),
        }
    }

    fn record(&mut self, sample: &Sample) {
        self.requests += 1;

        if let Some(ref error) = sample.error {
            self.failures += 1;
            *self.failures_by_kind.entry(error.kind).or_insert(0) += 1;
            return;
        }

        let us = (sample.latency.as_micros() as u64).max(1);
        self.latency_us.saturating_record(us);
        self.latency_sum_us = self.latency_sum_us.saturating_add(us);
        self.latency_min_us = self.latency_min_us.min(us);
        self.latency_max_us = self.latency_max_us.max(us);

        let bytes = sample.response_len as u64;
        self.bytes_total = self.bytes_total.saturating_add(bytes);
        self.bytes_min = self.bytes_min.min(bytes);
        self.bytes_max = self.bytes_max.max(bytes);
    }

    fn merge(&mut self, other: &OperationAccumulator) {
        self.requests += other.requests;
        self.failures += other.failures;
        // Same bounds on both sides, so the addition cannot go out of range
        let _ = self.latency_us.add(&other.latency_us);
        self.latency_sum_us = self.latency_sum_us.saturating_add(other.latency_sum_us);
        self.latency_min_us = self.latency_min_us.min(other.latency_min_us);
        self.latency_max_us = self.latency_max_us.max(other.latency_max_us);
        self.bytes_total = self.bytes_total.saturating_add(other.bytes_total);
        self.bytes_min = self.bytes_min.min(other.bytes_min);
        self.bytes_max = self.bytes_max.max(other.bytes_max);
        for (kind, count) in &other.failures_by_kind {
            *self.failures_by_kind.entry(*kind).or_insert(0) += count;
        }
    }

    fn successes(&self) -> u64 {
        self.requests - self.failures
    }

    fn stats(&self, protocol: Option<Protocol>, name: &str) -> OperationStats {
        let successes = self.successes();
        let (latency, response_size) = if successes == 0 {
            (LatencySummary::default(), SizeSummary::default())
        } else {
            let hist = &self.latency_us;
            (
                LatencySummary {
                    avg_ms: us_to_ms(self.latency_sum_us) / successes as f64,
                    min_ms: us_to_ms(self.latency_min_us),
                    max_ms: us_to_ms(self.latency_max_us),
                    p50_ms: us_to_ms(hist.value_at_quantile(0.50)),
                    p90_ms: us_to_ms(hist.value_at_quantile(0.90)),
                    p95_ms: us_to_ms(hist.value_at_quantile(0.95)),
                    p99_ms: us_to_ms(hist.value_at_quantile(0.99)),
                },
                SizeSummary {
                    avg_bytes: self.bytes_total as f64 / successes as f64,
                    min_bytes: self.bytes_min,
                    max_bytes: self.bytes_max,
                    total_bytes: self.bytes_total,
                },
            )
        };

        OperationStats {
            protocol,
            name: name.to_string(),
            requests: self.requests,
            failures: self.failures,
            latency,
            response_size,
            failures_by_kind: self.failures_by_kind.clone(),
        }
    }
}

fn us_to_ms(us: u64) -> f64 {
    us as f64 / 1000.0
}

/// Lifecycle state of a virtual user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UserStatus {
    #[default]
    Pending,
    Running,
    Stopping,
    Stopped,
    Failed,
    Aborted,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Pending => "Pending",
            UserStatus::Running => "Running",
            UserStatus::Stopping => "Stopping",
            UserStatus::Stopped => "Stopped",
            UserStatus::Failed => "Failed",
            UserStatus::Aborted => "Aborted",
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            UserStatus::Pending => 0,
            UserStatus::Running => 1,
            UserStatus::Stopping => 2,
            UserStatus::Stopped => 3,
            UserStatus::Failed => 4,
            UserStatus::Aborted => 5,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => UserStatus::Running,
            2 => UserStatus::Stopping,
            3 => UserStatus::Stopped,
            4 => UserStatus::Failed,
            5 => UserStatus::Aborted,
            _ => UserStatus::Pending,
        }
    }
}

/// Live counters owned by one virtual user
#[derive(Debug)]
pub struct UserTracker {
    user_id: usize,
    profile: String,
    status: AtomicU8,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    connections_opened: AtomicU64,
}

impl UserTracker {
    pub fn new(user_id: usize, profile: impl Into<String>) -> Self {
        Self {
            user_id,
            profile: profile.into(),
            status: AtomicU8::new(UserStatus::Pending.to_u8()),
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            connections_opened: AtomicU64::new(0),
        }
    }

    pub fn user_id(&self) -> usize {
        self.user_id
    }

    pub fn status(&self) -> UserStatus {
        UserStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: UserStatus) {
        self.status.store(status.to_u8(), Ordering::Release);
    }

    pub fn task_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> UserMetrics {
        UserMetrics {
            user_id: self.user_id,
            profile: self.profile.clone(),
            status: self.status(),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
        }
    }
}

/// Per-user metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserMetrics {
    pub user_id: usize,
    pub profile: String,
    pub status: UserStatus,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub connections_opened: u64,
}

/// Throughput history for progress reporting
pub struct ThroughputHistory {
    rates: VecDeque<f64>,
    max_samples: usize,
    last_count: u64,
    last_at: Instant,
}

impl ThroughputHistory {
    pub fn new(max_samples: usize) -> Self {
        Self {
            rates: VecDeque::with_capacity(max_samples),
            max_samples,
            last_count: 0,
            last_at: Instant::now(),
        }
    }

    pub fn add_sample(&mut self, current_count: u64) {
        let now = Instant::now();
        let secs = now.duration_since(self.last_at).as_secs_f64();
        let delta = current_count.saturating_sub(self.last_count) as f64;
        let rate = if secs > 0.0 { delta / secs } else { 0.0 };
        self.last_count = current_count;
        self.last_at = now;

        self.rates.push_back(rate);
        if self.rates.len() > self.max_samples {
            self.rates.pop_front();
        }
    }

    pub fn current_rate(&self) -> f64 {
        self.rates.back().copied().unwrap_or(0.0)
    }

    pub fn peak_rate(&self) -> f64 {
        self.rates.iter().copied().fold(0.0, f64::max)
    }

    pub fn rates(&self) -> Vec<f64> {
        self.rates.iter().copied().collect()
    }
}

/// A failed operation kept for the error report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentError {
    pub user_id: usize,
    pub protocol: Protocol,
    pub operation: String,
    pub error: SampleError,
}

impl fmt::Display for RecentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} {}] user #{} {}: {}",
            self.protocol,
            self.operation,
            self.user_id,
            self.error.kind.as_str(),
            self.error.message
        )
    }
}

/// Bounded ring of the latest failures; the oldest entry is evicted first
struct ErrorRing {
    entries: VecDeque<RecentError>,
    capacity: usize,
}

impl ErrorRing {
    fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Keep the failure of `sample`; successes are ignored
    fn push(&mut self, sample: &Sample) {
        let Some(ref error) = sample.error else {
            return;
        };
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        if self.capacity > 0 {
            self.entries.push_back(RecentError {
                user_id: sample.user_id,
                protocol: sample.protocol,
                operation: sample.name.clone(),
                error: error.clone(),
            });
        }
    }

    /// Oldest first
    fn entries(&self) -> Vec<RecentError> {
        self.entries.iter().cloned().collect()
    }
}

/// Shared sink for samples from every virtual user
pub struct MetricsSink {
    total_requests: AtomicU64,
    total_failures: AtomicU64,
    suspect_framing: AtomicU64,
    operations: RwLock<HashMap<OperationKey, Arc<Mutex<OperationAccumulator>>>>,
    users: RwLock<Vec<Arc<UserTracker>>>,
    throughput_history: Mutex<ThroughputHistory>,
    error_log: Mutex<ErrorRing>,
    has_subscribers: AtomicBool,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Sample>>>,
    start_time: Instant,
}

impl Default for MetricsSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink {
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            suspect_framing: AtomicU64::new(0),
            operations: RwLock::new(HashMap::new()),
            users: RwLock::new(Vec::new()),
            throughput_history: Mutex::new(ThroughputHistory::new(THROUGHPUT_HISTORY)),
            error_log: Mutex::new(ErrorRing::new(ERROR_LOG_CAPACITY)),
            has_subscribers: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
            start_time: Instant::now(),
        }
    }

    /// Record one sample
    pub fn record(&self, sample: Sample) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if !sample.is_success() {
            self.total_failures.fetch_add(1, Ordering::Relaxed);
            lock(&self.error_log).push(&sample);
        }

        let slot = self.operation_slot(sample.protocol, &sample.name);
        lock(&slot).record(&sample);

        if self.has_subscribers.load(Ordering::Acquire) {
            let mut subscribers = lock(&self.subscribers);
            subscribers.retain(|tx| tx.send(sample.clone()).is_ok());
            if subscribers.is_empty() {
                self.has_subscribers.store(false, Ordering::Release);
            }
        }
    }

    fn operation_slot(&self, protocol: Protocol, name: &str) -> Arc<Mutex<OperationAccumulator>> {
        let key = OperationKey {
            protocol,
            name: name.to_string(),
        };

        if let Some(slot) = read(&self.operations).get(&key) {
            return Arc::clone(slot);
        }

        let mut operations = write(&self.operations);
        Arc::clone(
            operations
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(OperationAccumulator::new()))),
        )
    }

    /// Note a response that looked incomplete (empty, buffer-filling, or
    /// missing its newline terminator)
    pub fn record_suspect_framing(&self) {
        self.suspect_framing.fetch_add(1, Ordering::Relaxed);
    }

    /// Register a virtual user and get its live counters
    pub fn register_user(&self, user_id: usize, profile: &str) -> Arc<UserTracker> {
        let tracker = Arc::new(UserTracker::new(user_id, profile));
        write(&self.users).push(Arc::clone(&tracker));
        tracker
    }

    /// Receive every sample recorded from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Sample> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = lock(&self.subscribers);
        subscribers.push(tx);
        self.has_subscribers.store(true, Ordering::Release);
        rx
    }

    /// End all sample streams handed out by [`MetricsSink::subscribe`]
    pub fn close_subscribers(&self) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.clear();
        // Flag flips under the lock so a concurrent subscribe() cannot be lost
        self.has_subscribers.store(false, Ordering::Release);
    }

    /// Update throughput sample (call once per second)
    pub fn update_throughput_sample(&self) {
        let current = self.total_requests.load(Ordering::Relaxed);
        lock(&self.throughput_history).add_sample(current);
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Take a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let slots: Vec<(OperationKey, Arc<Mutex<OperationAccumulator>>)> = read(&self.operations)
            .iter()
            .map(|(key, slot)| (key.clone(), Arc::clone(slot)))
            .collect();

        let mut aggregate = OperationAccumulator::new();
        let mut operations = Vec::with_capacity(slots.len());
        for (key, slot) in slots {
            let acc = lock(&slot);
            aggregate.merge(&acc);
            operations.push(acc.stats(Some(key.protocol), &key.name));
        }
        operations.sort_by(|a, b| (a.protocol, &a.name).cmp(&(b.protocol, &b.name)));

        let mut users: Vec<UserMetrics> = read(&self.users).iter().map(|u| u.snapshot()).collect();
        users.sort_by_key(|u| u.user_id);

        let (throughput_history, current_rps, peak_rps) = {
            let history = lock(&self.throughput_history);
            (history.rates(), history.current_rate(), history.peak_rate())
        };

        MetricsSnapshot {
            aggregated: aggregate.stats(None, "Aggregated"),
            operations,
            users,
            throughput_history,
            current_rps,
            peak_rps,
            suspect_framing: self.suspect_framing.load(Ordering::Relaxed),
            recent_errors: lock(&self.error_log).entries(),
            elapsed: self.elapsed(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(rw: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rw.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(rw: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rw.write().unwrap_or_else(PoisonError::into_inner)
}

/// Latency over successful samples, in milliseconds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

/// Response sizes over successful samples
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SizeSummary {
    pub avg_bytes: f64,
    pub min_bytes: u64,
    pub max_bytes: u64,
    pub total_bytes: u64,
}

/// Aggregated statistics for one `(protocol, operation)` pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStats {
    /// None for the aggregated row
    pub protocol: Option<Protocol>,
    pub name: String,
    pub requests: u64,
    pub failures: u64,
    pub latency: LatencySummary,
    pub response_size: SizeSummary,
    pub failures_by_kind: BTreeMap<FailureKind, u64>,
}

impl OperationStats {
    pub fn successes(&self) -> u64 {
        self.requests - self.failures
    }

    pub fn failure_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            (self.failures as f64 / self.requests as f64) * 100.0
        }
    }
}

/// Point-in-time view of all metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub operations: Vec<OperationStats>,
    pub aggregated: OperationStats,
    pub users: Vec<UserMetrics>,
    pub throughput_history: Vec<f64>,
    pub current_rps: f64,
    pub peak_rps: f64,
    pub suspect_framing: u64,
    /// Latest failures, oldest first
    pub recent_errors: Vec<RecentError>,
    #[serde(with = "serde_duration")]
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    pub fn total_requests(&self) -> u64 {
        self.aggregated.requests
    }

    pub fn total_failures(&self) -> u64 {
        self.aggregated.failures
    }

    pub fn operation(&self, protocol: Protocol, name: &str) -> Option<&OperationStats> {
        self.operations
            .iter()
            .find(|op| op.protocol == Some(protocol) && op.name == name)
    }

    pub fn users_with_status(&self, status: UserStatus) -> usize {
        self.users.iter().filter(|u| u.status == status).count()
    }

    /// Average requests per second over the whole run
    pub fn average_rps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.total_requests() as f64 / secs
        } else {
            0.0
        }
    }
}
