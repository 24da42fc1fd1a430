//! The rate-limited exclusive lock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use super::bucket::Bucket;
use super::changer::{AdjustError, LimitChange, LimitChanger};
use crate::config::LimiterConfig;

/// The abstract surface of a rate-limited lock.
///
/// This allows callers such as the contention driver to be generic over the
/// limiter implementation.
pub trait Limiter: Send + Sync {
    /// Block until one token is available and the lock is free, then take it.
    fn acquire(&self) {
        self.acquire_with_cost(1);
    }

    /// Block until `cost` tokens are available and the lock is free, then take it.
    fn acquire_with_cost(&self, cost: u64);

    /// Release a lock taken with `acquire` or `acquire_with_cost`.
    fn release(&self);

    /// Top up the token pool, capped at capacity.
    fn add_tokens(&self, tokens: u64);

    /// Replace the refill interval.
    fn set_limit(&self, limit: Duration);

    /// Grow the refill interval with `changer`, returning the resulting limit.
    fn increase_limit(&self, changer: &dyn LimitChanger) -> Duration;

    /// Shrink the refill interval with `changer`, returning the resulting limit.
    fn decrease_limit(&self, changer: &dyn LimitChanger) -> Duration;
}

/// Point-in-time view of a limiter's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterSnapshot {
    pub tokens: u64,
    pub max_tokens: u64,
    pub wait_limit: Duration,
    pub unit: Duration,
}

/// A mutual-exclusion lock whose acquisition rate is throttled by a token
/// bucket.
///
/// Two locks are involved. The bookkeeping lock guards the token state and
/// is only held for a single pass; token waiters park on a condition
/// variable, which releases it. The exclusion lock is the lock callers
/// observe: it is taken while the bookkeeping lock is still held, and
/// released independently by [`RateLimiter::release`]. Nothing takes them in
/// the opposite order.
///
/// The built-in [`LimitChange`] policy requires `unit` to be at least 1000ns
/// when growing a limit of one unit or more; smaller units make
/// [`RateLimiter::increase`] log an error and leave the limit unchanged.
pub struct RateLimiter {
    /// Token and refill state
    bucket: Mutex<Bucket>,
    /// Signalled whenever tokens or the refill interval change out of band
    refilled: Condvar,
    /// Whether the exclusion lock is currently held
    held: Mutex<bool>,
    /// Signalled when the exclusion lock is released
    released: Condvar,
    /// Callers currently waiting for tokens
    waiting: AtomicUsize,
}

impl RateLimiter {
    /// Create a limiter with `tokens` available out of `max_tokens`, earning
    /// one token per `wait_limit`.
    pub fn new(tokens: u64, max_tokens: u64, wait_limit: Duration, unit: Duration) -> Self {
        Self {
            bucket: Mutex::new(Bucket::new(
                tokens,
                max_tokens,
                wait_limit,
                unit,
                Instant::now(),
            )),
            refilled: Condvar::new(),
            held: Mutex::new(false),
            released: Condvar::new(),
            waiting: AtomicUsize::new(0),
        }
    }

    /// Create a limiter from configuration.
    pub fn from_config(config: &LimiterConfig) -> Self {
        Self::new(
            config.initial_tokens,
            config.max_tokens,
            config.wait_limit(),
            config.unit(),
        )
    }

    /// Acquire at a cost of one token.
    pub fn acquire(&self) {
        self.acquire_with_cost(1);
    }

    /// Block until `cost` tokens can be spent and the lock is free.
    ///
    /// Requests costing more than the capacity are admitted once the bucket
    /// is full and spend the whole bucket. A cost of zero still needs one
    /// token to be available but spends none.
    pub fn acquire_with_cost(&self, cost: u64) {
        let mut bucket = self.bucket.lock();
        let mut parked = false;

        loop {
            let now = Instant::now();
            if bucket.try_take(cost, now) {
                trace!(cost, remaining = bucket.tokens(), "Tokens spent");
                break;
            }

            if !parked {
                parked = true;
                self.waiting.fetch_add(1, Ordering::SeqCst);
            }

            let wait = bucket.time_to_next_token(now);
            trace!(
                cost,
                available = bucket.tokens(),
                wait_ms = wait.as_millis() as u64,
                "Waiting for tokens"
            );
            self.refilled.wait_for(&mut bucket, wait);
        }

        if parked {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
        }

        // Take the exclusion lock before letting go of the bookkeeping lock
        let mut held = self.held.lock();
        while *held {
            self.released.wait(&mut held);
        }
        *held = true;
        drop(held);
        drop(bucket);

        debug!(cost, "Rate limited lock acquired");
    }

    /// Acquire at a cost of one token, returning a guard that releases on drop.
    pub fn lock(&self) -> RateLimitGuard<'_> {
        self.lock_with_cost(1)
    }

    /// Acquire at `cost`, returning a guard that releases on drop.
    pub fn lock_with_cost(&self, cost: u64) -> RateLimitGuard<'_> {
        self.acquire_with_cost(cost);
        RateLimitGuard { limiter: self }
    }

    /// Take the lock without blocking.
    ///
    /// Succeeds only when `cost` tokens are available and nobody holds the
    /// lock; on failure no tokens are spent.
    pub fn try_lock_with_cost(&self, cost: u64) -> Option<RateLimitGuard<'_>> {
        let mut bucket = self.bucket.lock();
        let mut held = self.held.lock();

        if *held || !bucket.try_take(cost, Instant::now()) {
            return None;
        }
        *held = true;

        Some(RateLimitGuard { limiter: self })
    }

    /// Release the exclusion lock. Token state is untouched.
    pub fn release(&self) {
        let mut held = self.held.lock();
        if !*held {
            warn!("Release called on a rate limited lock that is not held");
        }
        *held = false;
        drop(held);

        self.released.notify_one();
    }

    /// Top up the token pool, capped at capacity.
    pub fn add_tokens(&self, tokens: u64) {
        let mut bucket = self.bucket.lock();
        bucket.add_tokens(tokens);
        debug!(added = tokens, available = bucket.tokens(), "Tokens added");
        drop(bucket);

        self.refilled.notify_all();
    }

    /// Replace the refill interval. Tokens and the last acquisition time are
    /// left alone.
    pub fn set_limit(&self, limit: Duration) {
        self.bucket.lock().set_wait_limit(limit);
        self.refilled.notify_all();
    }

    /// Replace the unit the adjustment policy scales against.
    pub fn set_unit(&self, unit: Duration) {
        self.bucket.lock().set_unit(unit);
    }

    /// Grow the refill interval using `changer`.
    ///
    /// A failing changer is logged and the interval is kept.
    pub fn increase_limit(&self, changer: &dyn LimitChanger) -> Duration {
        self.adjust_limit("increase", |bucket| {
            changer.increase(bucket.wait_limit(), bucket)
        })
    }

    /// Shrink the refill interval using `changer`.
    ///
    /// A failing changer is logged and the interval is kept.
    pub fn decrease_limit(&self, changer: &dyn LimitChanger) -> Duration {
        self.adjust_limit("decrease", |bucket| {
            changer.decrease(bucket.wait_limit(), bucket)
        })
    }

    /// Grow the refill interval with the built-in [`LimitChange`] policy.
    pub fn increase(&self) -> Duration {
        self.increase_limit(&LimitChange)
    }

    /// Shrink the refill interval with the built-in [`LimitChange`] policy.
    pub fn decrease(&self) -> Duration {
        self.decrease_limit(&LimitChange)
    }

    fn adjust_limit<F>(&self, direction: &'static str, change: F) -> Duration
    where
        F: FnOnce(&Bucket) -> Result<Duration, AdjustError>,
    {
        let mut bucket = self.bucket.lock();
        let previous = bucket.wait_limit();

        let limit = match change(&bucket) {
            Ok(limit) => {
                bucket.set_wait_limit(limit);
                debug!(
                    direction,
                    previous_ms = previous.as_secs_f64() * 1000.0,
                    limit_ms = limit.as_secs_f64() * 1000.0,
                    "Wait limit adjusted"
                );
                limit
            }
            Err(e) => {
                warn!(direction, error = %e, "Failed to adjust wait limit");
                previous
            }
        };
        drop(bucket);

        self.refilled.notify_all();
        limit
    }

    /// Current bookkeeping, with elapsed time credited.
    pub fn snapshot(&self) -> LimiterSnapshot {
        let mut bucket = self.bucket.lock();
        bucket.refresh(Instant::now());

        LimiterSnapshot {
            tokens: bucket.tokens(),
            max_tokens: bucket.max_tokens(),
            wait_limit: bucket.wait_limit(),
            unit: bucket.unit(),
        }
    }

    /// When the last successful acquisition happened.
    pub fn last_acquire(&self) -> Instant {
        self.bucket.lock().last_acquire()
    }

    /// Number of callers currently waiting for tokens.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Whether some caller holds the exclusion lock.
    pub fn is_locked(&self) -> bool {
        *self.held.lock()
    }
}

impl Limiter for RateLimiter {
    fn acquire_with_cost(&self, cost: u64) {
        RateLimiter::acquire_with_cost(self, cost)
    }

    fn release(&self) {
        RateLimiter::release(self)
    }

    fn add_tokens(&self, tokens: u64) {
        RateLimiter::add_tokens(self, tokens)
    }

    fn set_limit(&self, limit: Duration) {
        RateLimiter::set_limit(self, limit)
    }

    fn increase_limit(&self, changer: &dyn LimitChanger) -> Duration {
        RateLimiter::increase_limit(self, changer)
    }

    fn decrease_limit(&self, changer: &dyn LimitChanger) -> Duration {
        RateLimiter::decrease_limit(self, changer)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("snapshot", &self.snapshot())
            .field("locked", &self.is_locked())
            .field("waiting", &self.waiting())
            .finish()
    }
}

/// Holds a [`RateLimiter`]'s exclusion lock until dropped.
#[must_use = "if unused the lock is released immediately"]
pub struct RateLimitGuard<'a> {
    limiter: &'a RateLimiter,
}

impl RateLimitGuard<'_> {
    /// Release the lock now.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for RateLimitGuard<'_> {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::LimiterSettings;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    struct Refuse;

    impl LimitChanger for Refuse {
        fn increase(
            &self,
            _limit: Duration,
            _settings: &dyn LimiterSettings,
        ) -> Result<Duration, AdjustError> {
            Err(AdjustError::Rejected("not today".to_string()))
        }

        fn decrease(
            &self,
            _limit: Duration,
            _settings: &dyn LimiterSettings,
        ) -> Result<Duration, AdjustError> {
            Err(AdjustError::Rejected("not today".to_string()))
        }
    }

    #[test]
    fn test_lock_and_release() {
        let limiter = RateLimiter::new(2, 2, Duration::from_secs(1), Duration::from_secs(1));

        let guard = limiter.lock();
        assert!(limiter.is_locked());
        assert_eq!(limiter.snapshot().tokens, 1);

        guard.release();
        assert!(!limiter.is_locked());
        // Release leaves token state alone
        assert_eq!(limiter.snapshot().tokens, 1);
    }

    #[test]
    fn test_try_lock_fails_while_held() {
        let limiter = RateLimiter::new(5, 5, Duration::from_secs(1), Duration::from_secs(1));

        let guard = limiter.try_lock_with_cost(1).expect("tokens available");
        assert!(limiter.try_lock_with_cost(1).is_none());
        // The failed attempt spent nothing
        assert_eq!(limiter.snapshot().tokens, 4);
        drop(guard);

        assert!(limiter.try_lock_with_cost(1).is_some());
    }

    #[test]
    fn test_try_lock_fails_without_tokens() {
        let limiter = RateLimiter::new(0, 5, Duration::from_secs(3600), Duration::from_secs(1));
        assert!(limiter.try_lock_with_cost(1).is_none());
        assert!(!limiter.is_locked());
    }

    #[test]
    fn test_set_limit_keeps_tokens() {
        let limiter = RateLimiter::new(3, 5, Duration::from_secs(3600), Duration::from_secs(1));
        limiter.set_limit(Duration::from_secs(7200));

        let snapshot = limiter.snapshot();
        assert_eq!(snapshot.wait_limit, Duration::from_secs(7200));
        assert_eq!(snapshot.tokens, 3);
    }

    #[test]
    fn test_increase_and_decrease_use_builtin_policy() {
        let limiter = RateLimiter::new(1, 10, Duration::from_secs(1), Duration::from_secs(1));

        assert_eq!(limiter.increase(), Duration::from_millis(1500));
        assert_eq!(limiter.decrease(), Duration::from_millis(1000));
        assert_eq!(limiter.decrease(), Duration::from_millis(900));
        assert_eq!(limiter.snapshot().wait_limit, Duration::from_millis(900));
    }

    #[test]
    fn test_failed_adjustment_keeps_limit() {
        let limiter = RateLimiter::new(1, 10, Duration::from_secs(2), Duration::from_secs(1));

        assert_eq!(limiter.increase_limit(&Refuse), Duration::from_secs(2));
        assert_eq!(limiter.decrease_limit(&Refuse), Duration::from_secs(2));
        assert_eq!(limiter.snapshot().wait_limit, Duration::from_secs(2));
    }

    #[test]
    fn test_tiny_unit_keeps_limit() {
        let limiter = RateLimiter::new(1, 10, Duration::from_secs(1), Duration::from_nanos(10));
        assert_eq!(limiter.increase(), Duration::from_secs(1));
    }

    #[test]
    fn test_set_unit_changes_policy_scale() {
        let limiter = RateLimiter::new(1, 10, Duration::ZERO, Duration::from_secs(1));
        limiter.set_unit(Duration::from_secs(2));
        assert_eq!(limiter.increase(), Duration::from_secs(2));
    }

    #[test]
    fn test_add_tokens_wakes_waiter() {
        let limiter = Arc::new(RateLimiter::new(
            0,
            10,
            Duration::from_secs(3600),
            Duration::from_secs(1),
        ));
        let done = Arc::new(AtomicBool::new(false));

        let handle = {
            let limiter = Arc::clone(&limiter);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                limiter.lock().release();
                done.store(true, Ordering::SeqCst);
            })
        };

        while limiter.waiting() == 0 {
            thread::yield_now();
        }
        assert!(!done.load(Ordering::SeqCst));

        limiter.add_tokens(1);
        handle.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(limiter.waiting(), 0);
    }

    #[test]
    fn test_second_locker_waits_for_release() {
        let limiter = Arc::new(RateLimiter::new(1, 1, Duration::from_millis(10), Duration::from_secs(1)));
        let order = Arc::new(Mutex::new(Vec::new()));

        let guard = limiter.lock();
        let handle = {
            let limiter = Arc::clone(&limiter);
            let order = Arc::clone(&order);
            thread::spawn(move || {
                let _guard = limiter.lock();
                order.lock().push("second");
            })
        };

        thread::sleep(Duration::from_millis(100));
        order.lock().push("first");
        drop(guard);
        handle.join().unwrap();

        assert_eq!(*order.lock(), vec!["first", "second"]);
    }
}
