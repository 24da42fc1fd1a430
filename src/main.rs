use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratelock::config::RateLockConfig;
use ratelock::control::Controller;
use ratelock::driver;
use ratelock::ratelimit::RateLimiter;

/// Drive a rate limited lock under contention.
#[derive(Debug, Parser)]
#[command(name = "ratelock", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of worker threads (overrides the configuration)
    #[arg(long)]
    workers: Option<usize>,

    /// Acquire/release pairs per worker (overrides the configuration)
    #[arg(long)]
    iterations: Option<usize>,

    /// Token cost for odd-numbered workers (overrides the configuration)
    #[arg(long)]
    cost: Option<u64>,

    /// Disable the adaptive control loop
    #[arg(long)]
    no_control: bool,

    /// Log filter, e.g. "info" or "ratelock=debug"
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    if args.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting ratelock");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => RateLockConfig::from_file(path)?,
        None => RateLockConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.driver.workers = workers;
    }
    if let Some(iterations) = args.iterations {
        config.driver.iterations = iterations;
    }
    if let Some(cost) = args.cost {
        config.driver.cost = cost;
    }
    if args.no_control {
        config.control.enabled = false;
    }
    config.validate()?;

    let limiter = Arc::new(RateLimiter::from_config(&config.limiter));
    info!(
        tokens = config.limiter.initial_tokens,
        max_tokens = config.limiter.max_tokens,
        wait_limit_ms = config.limiter.wait_limit_ms,
        unit_ms = config.limiter.unit_ms,
        "Rate limiter initialized"
    );

    // Start the control loop
    let (stop_control, mut control_stopped) = watch::channel(false);
    let mut control = if config.control.enabled {
        let controller = Controller::new(Arc::clone(&limiter), config.control.clone());
        Some(tokio::spawn(controller.run(async move {
            let _ = control_stopped.changed().await;
        })))
    } else {
        None
    };

    // Run the workers off the async runtime
    let stop = Arc::new(AtomicBool::new(false));
    let mut workers = {
        let limiter = Arc::clone(&limiter);
        let stop = Arc::clone(&stop);
        let driver_config = config.driver.clone();
        tokio::task::spawn_blocking(move || driver::run(limiter.as_ref(), &driver_config, &stop))
    };

    let report = tokio::select! {
        report = &mut workers => report?,
        _ = shutdown_signal() => {
            stop.store(true, Ordering::SeqCst);
            // Stop tuning first so nothing raises the limit while draining
            let _ = stop_control.send(true);
            if let Some(control) = control.take() {
                control.await?;
            }
            driver::drain(limiter.as_ref());
            warn!("Waiting for workers to finish their current iteration");
            workers.await?
        }
    };

    let _ = stop_control.send(true);
    if let Some(control) = control {
        control.await?;
    }

    let snapshot = limiter.snapshot();
    info!(
        completed = report.completed,
        max_concurrent = report.max_concurrent,
        elapsed_ms = report.elapsed.as_millis() as u64,
        stopped = report.stopped,
        final_wait_limit_ms = snapshot.wait_limit.as_secs_f64() * 1000.0,
        tokens = snapshot.tokens,
        "Ratelock run complete"
    );

    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping workers");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping workers");
        }
    }
}
