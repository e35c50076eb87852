//! Summary output and on-disk reports

use std::io::Write;
use std::path::Path;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;

use libcmdswarm_core::{OperationStats, RunConfig, RunSummary, Sample};

use crate::error::Result;

/// Number of recent errors shown in the summary
const SUMMARY_ERRORS: usize = 10;

/// Run parameters stored alongside the summary in the JSON report
#[derive(Debug, Serialize)]
struct ReportConfig {
    target: String,
    users: usize,
    spawn_rate: f64,
    run_time_secs: Option<f64>,
    grace_timeout_secs: f64,
    profiles: Vec<ReportProfile>,
}

#[derive(Debug, Serialize)]
struct ReportProfile {
    name: String,
    weight: u32,
}

#[derive(Debug, Serialize)]
struct JsonReport<'a> {
    config: ReportConfig,
    summary: &'a RunSummary,
}

impl ReportConfig {
    fn from_config(config: &RunConfig) -> Self {
        Self {
            target: config.target.addr(),
            users: config.users,
            spawn_rate: config.spawn_rate,
            run_time_secs: config.run_time.map(|d| d.as_secs_f64()),
            grace_timeout_secs: config.grace_timeout.as_secs_f64(),
            profiles: config
                .profiles
                .entries()
                .map(|(profile, weight)| ReportProfile {
                    name: profile.name().to_string(),
                    weight,
                })
                .collect(),
        }
    }
}

/// Write the pretty-printed JSON report
pub fn write_json_report(path: &Path, config: &RunConfig, summary: &RunSummary) -> Result<()> {
    let report = JsonReport {
        config: ReportConfig::from_config(config),
        summary,
    };
    std::fs::write(path, serde_json::to_string_pretty(&report)?)?;
    Ok(())
}

/// Write each sample as one JSON line until the stream ends. Blocks, so run
/// it off the async workers.
pub fn write_samples<W: Write>(
    out: &mut W,
    samples: &mut UnboundedReceiver<Sample>,
) -> Result<u64> {
    let mut written = 0;
    while let Some(sample) = samples.blocking_recv() {
        serde_json::to_writer(&mut *out, &sample)?;
        out.write_all(b"\n")?;
        written += 1;
    }
    out.flush()?;
    Ok(written)
}

fn table_header() -> String {
    format!(
        "{:<5} {:<20} {:>8} {:>8} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9} {:>10}",
        "Type", "Name", "# reqs", "# fails", "Avg", "Min", "Max", "P50", "P95", "P99", "Avg size"
    )
}

fn table_row(stats: &OperationStats) -> String {
    let protocol = stats.protocol.map(|p| p.as_str()).unwrap_or("");
    format!(
        concat!(
            "{:<5} {:<20} {:>8} {:>8} ",
            "{:>7.2}ms {:>7.2}ms {:>7.2}ms {:>7.2}ms {:>7.2}ms {:>7.2}ms {:>9.1}B"
        ),
        protocol,
        stats.name,
        stats.requests,
        stats.failures,
        stats.latency.avg_ms,
        stats.latency.min_ms,
        stats.latency.max_ms,
        stats.latency.p50_ms,
        stats.latency.p95_ms,
        stats.latency.p99_ms,
        stats.response_size.avg_bytes,
    )
}

/// Print the end-of-run summary
pub fn print_summary(config: &RunConfig, summary: &RunSummary) {
    let snapshot = &summary.metrics;

    println!("=== CMDSWARM RESULTS ===\n");
    println!("Target:           {}", config.target.addr());
    println!("Run ID:           {}", summary.run_id);
    println!("Elapsed Time:     {:.2}s", summary.elapsed.as_secs_f64());
    println!("Stop Reason:      {:?}", summary.stop_reason);
    println!();
    println!("Users Spawned:    {}/{}", summary.users_spawned, config.users);
    println!("Failed to Start:  {}", summary.spawn_failures);
    println!("Stopped:          {}", summary.users_stopped);
    println!("Aborted:          {}", summary.users_aborted);
    if summary.users_panicked > 0 {
        println!("Panicked:         {}", summary.users_panicked);
    }
    println!();

    println!("{}", table_header());
    for stats in &snapshot.operations {
        println!("{}", table_row(stats));
    }
    println!("{}", "-".repeat(table_header().len()));
    println!("{}", table_row(&snapshot.aggregated));
    println!();

    println!(
        "Total Requests:   {} ({:.1}% failed)",
        snapshot.total_requests(),
        snapshot.aggregated.failure_rate()
    );
    println!("Average RPS:      {:.1} req/sec", snapshot.average_rps());
    println!("Peak RPS:         {:.0} req/sec", snapshot.peak_rps);
    if snapshot.suspect_framing > 0 {
        println!(
            "Suspect Framing:  {} responses looked incomplete",
            snapshot.suspect_framing
        );
    }

    if !snapshot.recent_errors.is_empty() {
        println!();
        println!("Recent Errors:");
        let skip = snapshot.recent_errors.len().saturating_sub(SUMMARY_ERRORS);
        for error in snapshot.recent_errors.iter().skip(skip) {
            println!("  {}", error);
        }
    }
}
