//! Contention driver.
//!
//! Runs a pool of worker threads that repeatedly take and release a limiter,
//! recording how many of them were ever inside the lock at once.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info};

use crate::config::DriverConfig;
use crate::ratelimit::Limiter;

/// Outcome of a driver run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverReport {
    /// Acquire/release pairs that completed
    pub completed: usize,
    /// Highest number of workers observed inside the lock at once
    pub max_concurrent: usize,
    /// Wall time of the whole run
    pub elapsed: Duration,
    /// Whether the run was cut short by the stop flag
    pub stopped: bool,
}

/// Cost paid by a worker: even workers pay one token, odd workers pay
/// `config.cost`.
fn worker_cost(worker: usize, config: &DriverConfig) -> u64 {
    if worker % 2 == 0 {
        1
    } else {
        config.cost
    }
}

/// Drive `limiter` with `config.workers` threads until every worker has done
/// `config.iterations` acquire/release pairs or `stop` is set.
///
/// `stop` is checked between iterations; a worker already waiting for the
/// lock finishes that iteration first.
pub fn run<L: Limiter>(limiter: &L, config: &DriverConfig, stop: &AtomicBool) -> DriverReport {
    let inside = AtomicUsize::new(0);
    let max_concurrent = AtomicUsize::new(0);
    let completed = AtomicUsize::new(0);
    let started = Instant::now();

    info!(
        workers = config.workers,
        iterations = config.iterations,
        cost = config.cost,
        "Starting contention driver"
    );

    thread::scope(|scope| {
        for worker in 0..config.workers {
            let inside = &inside;
            let max_concurrent = &max_concurrent;
            let completed = &completed;
            let cost = worker_cost(worker, config);

            scope.spawn(move || {
                let mut rng = rand::thread_rng();

                for iteration in 0..config.iterations {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }

                    limiter.acquire_with_cost(cost);
                    let now_inside = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_concurrent.fetch_max(now_inside, Ordering::SeqCst);

                    debug!(worker, iteration, cost, "Worker inside");
                    if config.hold_ms > 0 {
                        thread::sleep(Duration::from_millis(rng.gen_range(0..=config.hold_ms)));
                    }

                    inside.fetch_sub(1, Ordering::SeqCst);
                    limiter.release();
                    completed.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
    });

    let report = DriverReport {
        completed: completed.load(Ordering::SeqCst),
        max_concurrent: max_concurrent.load(Ordering::SeqCst),
        elapsed: started.elapsed(),
        stopped: stop.load(Ordering::SeqCst),
    };

    info!(
        completed = report.completed,
        max_concurrent = report.max_concurrent,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Contention driver finished"
    );

    report
}

/// Let every worker parked for tokens through so a stopped run can finish.
///
/// Drops the refill interval to zero, which refills the bucket on each pass
/// and wakes parked waiters. Pair with setting the stop flag, or the workers
/// will carry on unthrottled.
pub fn drain<L: Limiter>(limiter: &L) {
    info!("Draining workers waiting for tokens");
    limiter.set_limit(Duration::ZERO);
}
