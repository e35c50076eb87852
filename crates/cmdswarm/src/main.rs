//! cmdswarm - headless load generator for line-based TCP command servers

mod app;
mod error;
mod report;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use app::HeadlessOptions;
use error::{AppError, Result};
use libcmdswarm_core::{ProfileMix, RunConfig, TargetConfig, Timeouts, UserProfile};

#[derive(Parser)]
#[command(name = "cmdswarm")]
#[command(about = "Drive a line-based TCP command server with concurrent virtual users")]
#[command(version)]
struct Cli {
    /// Target server as host or host:port (port defaults to 8080)
    #[arg(long, default_value = "localhost:8080")]
    host: String,

    /// Number of concurrent virtual users
    #[arg(short = 'u', long, default_value = "10")]
    users: usize,

    /// Users spawned per second during ramp-up
    #[arg(short = 'r', long, default_value = "1.0")]
    spawn_rate: f64,

    /// Stop after this long (90, 90s, 5m, 1h, 1h30m); runs until Ctrl+C if omitted
    #[arg(short = 't', long, value_parser = parse_run_time)]
    run_time: Option<Duration>,

    /// Profile to include as name[=weight]: standard, stress, long, short (repeatable)
    #[arg(short = 'p', long = "profile", value_parser = parse_profile_spec)]
    profiles: Vec<ProfileSpec>,

    /// Seconds users get to finish after a stop before they are aborted
    #[arg(long, default_value = "10", value_parser = parse_seconds)]
    grace: Duration,

    /// Connect timeout in seconds
    #[arg(long, default_value = "10", value_parser = parse_seconds)]
    connect_timeout: Duration,

    /// Read/write timeout in seconds
    #[arg(long, default_value = "10", value_parser = parse_seconds)]
    io_timeout: Duration,

    /// Output JSON report to file
    #[arg(short = 'j', long)]
    json_report: Option<PathBuf>,

    /// Write every sample as a JSON line to file
    #[arg(long)]
    sample_log: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

/// A `--profile` argument
#[derive(Debug, Clone, PartialEq)]
struct ProfileSpec {
    name: String,
    weight: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = build_config(&cli)?;
    let options = HeadlessOptions {
        json_report: cli.json_report,
        sample_log: cli.sample_log,
    };

    app::run_headless(config, options).await?;
    Ok(())
}

fn build_config(cli: &Cli) -> Result<RunConfig> {
    let timeouts = Timeouts {
        connect: cli.connect_timeout,
        read: cli.io_timeout,
        write: cli.io_timeout,
    };
    let target = TargetConfig::parse(&cli.host)?.with_timeouts(timeouts);

    let profiles = if cli.profiles.is_empty() {
        ProfileMix::default()
    } else {
        let mut mix = ProfileMix::new();
        for spec in &cli.profiles {
            let profile = UserProfile::from_name(&spec.name).ok_or_else(|| {
                AppError::Config(format!(
                    "Unknown profile: '{}'. Use: standard, stress, long, or short",
                    spec.name
                ))
            })?;
            mix = mix.with(profile, spec.weight);
        }
        mix
    };

    let config = RunConfig {
        target,
        users: cli.users,
        spawn_rate: cli.spawn_rate,
        run_time: cli.run_time,
        grace_timeout: cli.grace,
        profiles,
    };
    config.validate()?;
    Ok(config)
}

/// Parse `90`, `90s`, `5m`, `1h` or combinations such as `1h30m`
fn parse_run_time(value: &str) -> std::result::Result<Duration, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("empty run time".to_string());
    }
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = 0u64;
    let mut digits = String::new();
    for c in value.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit = match c {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => return Err(format!("invalid unit '{}' in run time '{}'", c, value)),
        };
        let amount: u64 = digits
            .parse()
            .map_err(|_| format!("missing number before '{}' in '{}'", c, value))?;
        total = amount
            .checked_mul(unit)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(|| format!("run time '{}' is too large", value))?;
        digits.clear();
    }
    if !digits.is_empty() {
        return Err(format!("trailing number without unit in '{}'", value));
    }
    Ok(Duration::from_secs(total))
}

/// Parse non-negative fractional seconds
fn parse_seconds(value: &str) -> std::result::Result<Duration, String> {
    let secs: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("invalid number of seconds: '{}'", value))?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid duration '{}': {}", value, e))
}

/// Parse `name` or `name=weight`
fn parse_profile_spec(value: &str) -> std::result::Result<ProfileSpec, String> {
    let (name, weight) = match value.split_once('=') {
        Some((name, weight)) => {
            let weight = weight
                .trim()
                .parse()
                .map_err(|_| format!("invalid weight in '{}'", value))?;
            (name, weight)
        }
        None => (value, 1),
    };

    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing profile name in '{}'", value));
    }
    Ok(ProfileSpec {
        name: name.to_string(),
        weight,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_time() {
        assert_eq!(parse_run_time("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_run_time("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_run_time("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_run_time("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_run_time("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_run_time("2m10s").unwrap(), Duration::from_secs(130));
    }

    #[test]
    fn test_parse_run_time_rejects_garbage() {
        assert!(parse_run_time("").is_err());
        assert!(parse_run_time("10x").is_err());
        assert!(parse_run_time("m").is_err());
        assert!(parse_run_time("1h30").is_err());
    }

    #[test]
    fn test_parse_profile_spec() {
        assert_eq!(
            parse_profile_spec("stress=3").unwrap(),
            ProfileSpec { name: "stress".to_string(), weight: 3 }
        );
        assert_eq!(parse_profile_spec("short").unwrap().weight, 1);
        assert!(parse_profile_spec("=2").is_err());
        assert!(parse_profile_spec("standard=x").is_err());
    }

    #[test]
    fn test_parse_seconds() {
        assert_eq!(parse_seconds("1.5").unwrap(), Duration::from_millis(1500));
        assert!(parse_seconds("-1").is_err());
        assert!(parse_seconds("abc").is_err());
    }

    #[test]
    fn test_build_config_from_args() {
        let cli = Cli::parse_from([
            "cmdswarm", "--host", "127.0.0.1:9000", "-u", "20", "-r", "5", "-t", "1m",
            "--profile", "standard=2", "--profile", "short",
        ]);
        let config = build_config(&cli).unwrap();

        assert_eq!(config.target.port, 9000);
        assert_eq!(config.users, 20);
        assert_eq!(config.run_time, Some(Duration::from_secs(60)));
        let names: Vec<(String, u32)> = config
            .profiles
            .entries()
            .map(|(p, w)| (p.name().to_string(), w))
            .collect();
        assert_eq!(
            names,
            vec![("standard".to_string(), 2), ("short_connection".to_string(), 1)]
        );
    }

    #[test]
    fn test_build_config_rejects_unknown_profile() {
        let cli = Cli::parse_from(["cmdswarm", "--profile", "turbo"]);
        assert!(matches!(build_config(&cli), Err(AppError::Config(_))));
    }

    #[test]
    fn test_default_mix_uses_all_profiles() {
        let cli = Cli::parse_from(["cmdswarm"]);
        let config = build_config(&cli).unwrap();
        assert_eq!(config.profiles.entries().count(), 4);
        assert_eq!(config.target.addr(), "localhost:8080");
    }
}
