//! Adaptive control of a limiter's refill interval.
//!
//! The controller samples how many callers are waiting for tokens and nudges
//! the wait limit: up when waiters pile up, down when nobody is waiting.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::ControlConfig;
use crate::ratelimit::{AdjustError, LimitChange, LimitChanger, LimiterSettings, RateLimiter};

/// What a control step did to the wait limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    /// The wait limit was increased because of contention
    SlowDown(Duration),
    /// The wait limit was decreased because nobody was waiting
    SpeedUp(Duration),
    /// Contention was moderate, or the wait limit is already at its ceiling
    Hold,
}

/// Caps the increases of another changer at a ceiling.
struct Capped<'a> {
    inner: &'a dyn LimitChanger,
    ceiling: Duration,
}

impl LimitChanger for Capped<'_> {
    fn increase(
        &self,
        limit: Duration,
        settings: &dyn LimiterSettings,
    ) -> Result<Duration, AdjustError> {
        let next = self.inner.increase(limit, settings)?;
        Ok(next.min(self.ceiling.max(limit)))
    }

    fn decrease(
        &self,
        limit: Duration,
        settings: &dyn LimiterSettings,
    ) -> Result<Duration, AdjustError> {
        self.inner.decrease(limit, settings)
    }
}

/// Periodically adjusts a [`RateLimiter`] with a [`LimitChanger`].
pub struct Controller {
    limiter: Arc<RateLimiter>,
    changer: Box<dyn LimitChanger>,
    config: ControlConfig,
}

impl Controller {
    /// Create a controller using the built-in [`LimitChange`] policy.
    pub fn new(limiter: Arc<RateLimiter>, config: ControlConfig) -> Self {
        Self::with_changer(limiter, config, Box::new(LimitChange))
    }

    /// Create a controller using a custom policy.
    pub fn with_changer(
        limiter: Arc<RateLimiter>,
        config: ControlConfig,
        changer: Box<dyn LimitChanger>,
    ) -> Self {
        Self {
            limiter,
            changer,
            config,
        }
    }

    /// Sample contention once and adjust.
    ///
    /// Increases never take the wait limit past `max_wait_limit`; once it is
    /// reached, pressure only holds the limit where it is.
    pub fn step(&self) -> Adjustment {
        let waiting = self.limiter.waiting();
        let ceiling = self.config.max_wait_limit();

        let adjustment = if waiting >= self.config.pressure_threshold.max(1) {
            if self.limiter.snapshot().wait_limit >= ceiling {
                Adjustment::Hold
            } else {
                let capped = Capped {
                    inner: self.changer.as_ref(),
                    ceiling,
                };
                Adjustment::SlowDown(self.limiter.increase_limit(&capped))
            }
        } else if waiting == 0 {
            Adjustment::SpeedUp(self.limiter.decrease_limit(self.changer.as_ref()))
        } else {
            Adjustment::Hold
        };

        debug!(waiting, adjustment = ?adjustment, "Control step");
        adjustment
    }

    /// Run control steps every configured interval until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(interval_ms = self.config.interval_ms, "Control loop started");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    self.step();
                }
            }
        }

        info!(
            wait_limit_ms = self.limiter.snapshot().wait_limit.as_millis() as u64,
            "Control loop stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn limiter(tokens: u64, wait: Duration) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(tokens, 10, wait, Duration::from_secs(1)))
    }

    fn config(pressure_threshold: usize) -> ControlConfig {
        ControlConfig {
            enabled: true,
            interval_ms: 10,
            pressure_threshold,
            max_wait_limit_ms: 7_200_000,
        }
    }

    #[test]
    fn test_idle_limiter_speeds_up() {
        let limiter = limiter(5, Duration::from_secs(5));
        let controller = Controller::new(Arc::clone(&limiter), config(2));

        assert_eq!(controller.step(), Adjustment::SpeedUp(Duration::from_secs(4)));
        assert_eq!(limiter.snapshot().wait_limit, Duration::from_secs(4));
    }

    #[test]
    fn test_contended_limiter_slows_down() {
        let limiter = limiter(0, Duration::from_secs(3600));
        let controller = Controller::new(Arc::clone(&limiter), config(1));

        let waiter = {
            let limiter = Arc::clone(&limiter);
            thread::spawn(move || limiter.lock().release())
        };
        while limiter.waiting() == 0 {
            thread::yield_now();
        }

        assert_eq!(
            controller.step(),
            Adjustment::SlowDown(Duration::from_secs(5400))
        );

        limiter.add_tokens(1);
        waiter.join().unwrap();
    }

    #[test]
    fn test_sustained_pressure_stops_at_ceiling() {
        let limiter = limiter(0, Duration::from_millis(100));
        let config = ControlConfig {
            max_wait_limit_ms: 1000,
            ..config(1)
        };
        let controller = Controller::new(Arc::clone(&limiter), config);

        let waiter = {
            let limiter = Arc::clone(&limiter);
            thread::spawn(move || limiter.lock().release())
        };
        while limiter.waiting() == 0 {
            thread::yield_now();
        }

        let mut slowed = 0;
        for _ in 0..200 {
            if limiter.waiting() == 0 {
                break;
            }
            if let Adjustment::SlowDown(limit) = controller.step() {
                assert!(limit <= Duration::from_secs(1));
                slowed += 1;
            }
            assert!(limiter.snapshot().wait_limit <= Duration::from_secs(1));
        }
        assert!(slowed >= 1);

        limiter.add_tokens(1);
        waiter.join().unwrap();
        assert!(limiter.snapshot().wait_limit <= Duration::from_secs(1));
    }

    #[test]
    fn test_ceiling_below_current_limit_holds() {
        let limiter = limiter(0, Duration::from_secs(3600));
        let config = ControlConfig {
            max_wait_limit_ms: 1000,
            ..config(1)
        };
        let controller = Controller::new(Arc::clone(&limiter), config);

        let waiter = {
            let limiter = Arc::clone(&limiter);
            thread::spawn(move || limiter.lock().release())
        };
        while limiter.waiting() == 0 {
            thread::yield_now();
        }

        assert_eq!(controller.step(), Adjustment::Hold);
        assert_eq!(limiter.snapshot().wait_limit, Duration::from_secs(3600));

        limiter.add_tokens(1);
        waiter.join().unwrap();
    }

    #[test]
    fn test_moderate_contention_holds() {
        let limiter = limiter(0, Duration::from_secs(3600));
        let controller = Controller::new(Arc::clone(&limiter), config(5));

        let waiter = {
            let limiter = Arc::clone(&limiter);
            thread::spawn(move || limiter.lock().release())
        };
        while limiter.waiting() == 0 {
            thread::yield_now();
        }

        assert_eq!(controller.step(), Adjustment::Hold);
        assert_eq!(limiter.snapshot().wait_limit, Duration::from_secs(3600));

        limiter.add_tokens(1);
        waiter.join().unwrap();
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let limiter = limiter(5, Duration::from_secs(5));
        let controller = Controller::new(Arc::clone(&limiter), config(2));

        controller
            .run(tokio::time::sleep(Duration::from_millis(35)))
            .await;

        // At least the immediate first tick ran
        assert!(limiter.snapshot().wait_limit < Duration::from_secs(5));
    }

    #[test]
    fn test_run_with_immediate_shutdown() {
        let limiter = limiter(5, Duration::from_secs(5));
        let controller = Controller::new(Arc::clone(&limiter), config(2));

        tokio_test::block_on(controller.run(async {}));
    }
}
