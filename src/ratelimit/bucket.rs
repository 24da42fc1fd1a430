//! Token bucket bookkeeping for the rate-limited lock.

use std::time::{Duration, Instant};

use super::changer::LimiterSettings;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Build a `Duration` from a nanosecond count, saturating at `Duration::MAX`.
pub(crate) fn duration_from_nanos(nanos: u128) -> Duration {
    let secs = nanos / NANOS_PER_SEC;
    match u64::try_from(secs) {
        Ok(secs) => Duration::new(secs, (nanos % NANOS_PER_SEC) as u32),
        Err(_) => Duration::MAX,
    }
}

/// Token and refill state protected by the limiter's bookkeeping lock.
///
/// The clock is always passed in, so every transition can be exercised
/// deterministically.
#[derive(Debug, Clone)]
pub struct Bucket {
    /// Currently available tokens
    tokens: u64,
    /// Capacity ceiling for `tokens`
    max_tokens: u64,
    /// Time that must elapse to earn one token
    wait_limit: Duration,
    /// Scale reference for limit adjustments
    unit: Duration,
    /// When the last successful acquisition happened
    last_acquire: Instant,
    /// Start of the elapsed time that has not been credited as tokens yet
    refill_anchor: Instant,
}

impl Bucket {
    /// Create a bucket. Initial tokens above `max_tokens` are capped.
    pub fn new(
        tokens: u64,
        max_tokens: u64,
        wait_limit: Duration,
        unit: Duration,
        now: Instant,
    ) -> Self {
        Self {
            tokens: tokens.min(max_tokens),
            max_tokens,
            wait_limit,
            unit,
            last_acquire: now,
            refill_anchor: now,
        }
    }

    /// Credit every whole refill interval elapsed since the anchor.
    ///
    /// The anchor advances by exactly the credited intervals, so repeated
    /// passes within one interval never count the same time twice. A full
    /// bucket discards the elapsed time.
    pub fn refresh(&mut self, now: Instant) {
        if self.wait_limit.is_zero() {
            self.tokens = self.max_tokens;
            self.refill_anchor = now;
            return;
        }

        let elapsed = now.saturating_duration_since(self.refill_anchor);
        let accrued = elapsed.as_nanos() / self.wait_limit.as_nanos();
        if accrued == 0 {
            return;
        }

        let credited = u64::try_from(accrued).unwrap_or(u64::MAX);
        self.tokens = self.tokens.saturating_add(credited).min(self.max_tokens);

        if self.tokens == self.max_tokens {
            self.refill_anchor = now;
        } else {
            self.refill_anchor += duration_from_nanos(accrued * self.wait_limit.as_nanos());
        }
    }

    /// Tokens that must be available to admit a request of `cost`.
    ///
    /// Clamped to `[1, max_tokens]` so an oversized request is not starved.
    pub fn threshold(&self, cost: u64) -> u64 {
        cost.max(1).min(self.max_tokens)
    }

    /// Refresh, then admit `cost` if enough tokens are available.
    ///
    /// The deduction is capped at `max_tokens`, matching the threshold, so
    /// the token count never underflows.
    pub fn try_take(&mut self, cost: u64, now: Instant) -> bool {
        self.refresh(now);
        if self.tokens < self.threshold(cost) {
            return false;
        }

        self.last_acquire = now;
        self.tokens = self.tokens.saturating_sub(cost.min(self.max_tokens));
        true
    }

    /// Time until the next token is credited.
    pub fn time_to_next_token(&self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.refill_anchor);
        self.wait_limit.saturating_sub(elapsed)
    }

    /// Top up the bucket independently of elapsed time.
    pub fn add_tokens(&mut self, tokens: u64) {
        self.tokens = self.tokens.saturating_add(tokens).min(self.max_tokens);
    }

    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    pub fn max_tokens(&self) -> u64 {
        self.max_tokens
    }

    pub fn wait_limit(&self) -> Duration {
        self.wait_limit
    }

    pub fn set_wait_limit(&mut self, wait_limit: Duration) {
        self.wait_limit = wait_limit;
    }

    pub fn unit(&self) -> Duration {
        self.unit
    }

    pub fn set_unit(&mut self, unit: Duration) {
        self.unit = unit;
    }

    pub fn last_acquire(&self) -> Instant {
        self.last_acquire
    }
}

impl LimiterSettings for Bucket {
    fn unit(&self) -> Duration {
        self.unit
    }

    fn wait_limit(&self) -> Duration {
        self.wait_limit
    }

    fn max_tokens(&self) -> u64 {
        self.max_tokens
    }
}
