//! Headless run: wiring signals, progress output and reports around a scheduler

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use libcmdswarm_core::{
    MetricsSink, RunConfig, RunInfo, RunObserver, RunSummary, Scheduler, StopHandle, UserStatus,
};

use crate::error::Result;
use crate::report;

/// Output options of a headless run
#[derive(Debug, Clone, Default)]
pub struct HeadlessOptions {
    pub json_report: Option<PathBuf>,
    pub sample_log: Option<PathBuf>,
}

/// Prints the start and stop banners
struct BannerObserver;

impl RunObserver for BannerObserver {
    fn on_run_start(&self, info: &RunInfo) {
        println!("{}", "=".repeat(50));
        println!("Starting load test");
        println!("Target server: {}", info.target);
        println!(
            "Users: {} (spawn rate {}/s)",
            info.users, info.spawn_rate
        );
        for allocation in &info.profiles {
            println!(
                "  {:<18} weight {:>3}  users {}",
                allocation.profile, allocation.weight, allocation.users
            );
        }
        println!("{}", "=".repeat(50));
    }

    fn on_run_stop(&self, _summary: &RunSummary) {
        println!("\n{}", "=".repeat(50));
        println!("Load test finished");
        println!("{}", "=".repeat(50));
    }
}

/// Run a load test without any interactive UI
pub async fn run_headless(config: RunConfig, options: HeadlessOptions) -> Result<RunSummary> {
    let metrics = Arc::new(MetricsSink::new());

    let sample_writer = match options.sample_log {
        Some(ref path) => {
            let file = File::create(path)?;
            let mut samples = metrics.subscribe();
            let handle: JoinHandle<Result<u64>> = tokio::task::spawn_blocking(move || {
                let mut out = BufWriter::new(file);
                report::write_samples(&mut out, &mut samples)
            });
            Some(handle)
        }
        None => None,
    };

    let scheduler = Scheduler::new(config.clone(), Arc::clone(&metrics))?
        .with_observer(Arc::new(BannerObserver));
    let stop = scheduler.stop_handle();

    let signals = {
        let stop = stop.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Received shutdown signal");
            println!("\nStopping users...");
            stop.stop();
        })
    };
    let progress = tokio::spawn(progress_loop(Arc::clone(&metrics), stop, config.users));

    let summary = scheduler.run().await;
    signals.abort();
    progress.await?;

    if let Some(handle) = sample_writer {
        let written = handle.await??;
        if let Some(ref path) = options.sample_log {
            println!("Wrote {} samples to {}", written, path.display());
        }
    }

    println!();
    report::print_summary(&config, &summary);

    if let Some(ref path) = options.json_report {
        report::write_json_report(path, &config, &summary)?;
        println!("\nReport saved to {}", path.display());
    }

    Ok(summary)
}

/// Print a status line once per second until the run stops
async fn progress_loop(metrics: Arc<MetricsSink>, stop: StopHandle, target_users: usize) {
    let mut signal = stop.signal();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = signal.stopped() => break,
        }

        metrics.update_throughput_sample();
        let snapshot = metrics.snapshot();
        print!(
            "\rUsers: {}/{} | Requests: {} | Failures: {} ({:.1}%) | {:.0} req/s    ",
            snapshot.users_with_status(UserStatus::Running),
            target_users,
            snapshot.total_requests(),
            snapshot.total_failures(),
            snapshot.aggregated.failure_rate(),
            snapshot.current_rps
        );
        std::io::stdout().flush().ok();
    }
}

/// Resolve on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
