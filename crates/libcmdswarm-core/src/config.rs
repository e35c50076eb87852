//! Run configuration
//!
//! All values are supplied by the caller (usually the CLI); nothing here
//! reads files or environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SwarmError};
use crate::profile::ProfileMix;
use crate::{
    DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_GRACE_TIMEOUT_MS, DEFAULT_IO_TIMEOUT_MS, DEFAULT_PORT,
};

/// Per-call timeouts applied by every protocol client
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Timeouts {
    #[serde(with = "serde_duration")]
    pub connect: Duration,
    #[serde(with = "serde_duration")]
    pub read: Duration,
    #[serde(with = "serde_duration")]
    pub write: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            read: Duration::from_millis(DEFAULT_IO_TIMEOUT_MS),
            write: Duration::from_millis(DEFAULT_IO_TIMEOUT_MS),
        }
    }
}

impl Timeouts {
    /// Longest single blocking call a user can be stuck in
    pub fn max_per_call(&self) -> Duration {
        self.connect.max(self.read).max(self.write)
    }
}

/// The server under test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub host: String,
    pub port: u16,
    pub timeouts: Timeouts,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            timeouts: Timeouts::default(),
        }
    }
}

impl TargetConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeouts: Timeouts::default(),
        }
    }

    /// Parse `host`, `host:port`, `[ipv6]` or `[ipv6]:port`; the port
    /// defaults to 8080. A bare IPv6 address is ambiguous and rejected.
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(SwarmError::InvalidConfig("empty target host".to_string()));
        }

        let (host, port) = match spec.strip_prefix('[') {
            Some(rest) => {
                let (host, tail) = rest.split_once(']').ok_or_else(|| {
                    SwarmError::InvalidConfig(format!("unclosed '[' in '{}'", spec))
                })?;
                let port = match tail {
                    "" => None,
                    _ => Some(tail.strip_prefix(':').ok_or_else(|| {
                        SwarmError::InvalidConfig(format!(
                            "expected ':port' after ']' in '{}'",
                            spec
                        ))
                    })?),
                };
                (host, port)
            }
            None => match spec.split_once(':') {
                Some((_, port)) if port.contains(':') => {
                    return Err(SwarmError::InvalidConfig(format!(
                        "IPv6 target '{}' must be written as [address]:port",
                        spec
                    )));
                }
                Some((host, port)) => (host, Some(port)),
                None => (spec, None),
            },
        };

        if host.is_empty() {
            return Err(SwarmError::InvalidConfig(format!("missing host in '{}'", spec)));
        }
        let port = match port {
            Some(port) => port.parse().map_err(|_| {
                SwarmError::InvalidConfig(format!("invalid port in '{}'", spec))
            })?,
            None => DEFAULT_PORT,
        };
        Ok(Self::new(host, port))
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Dialable `host:port`; IPv6 literals get their brackets back
    pub fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Everything the scheduler needs for one run
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub target: TargetConfig,
    /// Target population of concurrent virtual users
    pub users: usize,
    /// Users spawned per second during ramp-up
    pub spawn_rate: f64,
    /// Stop automatically after this long (None = until stopped)
    pub run_time: Option<Duration>,
    /// How long stopping users get to finish before they are aborted
    pub grace_timeout: Duration,
    pub profiles: ProfileMix,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            target: TargetConfig::default(),
            users: 10,
            spawn_rate: 1.0,
            run_time: None,
            grace_timeout: Duration::from_millis(DEFAULT_GRACE_TIMEOUT_MS),
            profiles: ProfileMix::default(),
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.users == 0 {
            return Err(SwarmError::InvalidConfig(
                "user count must be at least 1".to_string(),
            ));
        }
        if !self.spawn_rate.is_finite() || self.spawn_rate <= 0.0 {
            return Err(SwarmError::InvalidConfig(format!(
                "spawn rate must be positive, got {}",
                self.spawn_rate
            )));
        }
        if self.profiles.is_empty() {
            return Err(SwarmError::InvalidConfig(
                "at least one profile with positive weight is required".to_string(),
            ));
        }
        if self.target.port == 0 {
            return Err(SwarmError::InvalidConfig(
                "target port must not be 0".to_string(),
            ));
        }
        Ok(())
    }
}

pub(crate) mod serde_duration {
    use std::fmt;
    use std::time::Duration;

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        deserializer.deserialize_any(SecondsVisitor)
    }

    /// Accepts whole or fractional seconds
    struct SecondsVisitor;

    impl<'de> Visitor<'de> for SecondsVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a non-negative number of seconds")
        }

        fn visit_u64<E: de::Error>(self, secs: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(secs))
        }

        fn visit_i64<E: de::Error>(self, secs: i64) -> Result<Duration, E> {
            u64::try_from(secs)
                .map(Duration::from_secs)
                .map_err(|_| E::invalid_value(de::Unexpected::Signed(secs), &self))
        }

        fn visit_f64<E: de::Error>(self, secs: f64) -> Result<Duration, E> {
            Duration::try_from_secs_f64(secs)
                .map_err(|_| E::invalid_value(de::Unexpected::Float(secs), &self))
        }
    }
}
