//! Pluggable policies for adjusting the refill interval.
//!
//! A [`LimitChanger`] maps the current wait limit to a new one. It reads the
//! limiter's configuration through [`LimiterSettings`] while the limiter's
//! bookkeeping lock is held, so implementations must not call back into the
//! limiter.

use std::time::Duration;

use thiserror::Error;

use super::bucket::duration_from_nanos;

/// Errors a limit changer can report.
///
/// The limiter logs these and keeps its current wait limit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdjustError {
    /// The unit is too small to truncate to a thousandth of itself.
    #[error("unit {unit:?} is too small to adjust; it must be at least 1000ns")]
    UnitTooSmall { unit: Duration },

    /// A custom policy declined to produce a new limit.
    #[error("limit adjustment rejected: {0}")]
    Rejected(String),
}

/// Read-only view of the limiter state a policy may consult.
pub trait LimiterSettings {
    /// The duration quantum the policy scales against.
    fn unit(&self) -> Duration;

    /// The current refill interval.
    fn wait_limit(&self) -> Duration;

    /// The token capacity.
    fn max_tokens(&self) -> u64;
}

/// Strategy for growing and shrinking a limiter's wait limit.
///
/// Increasing the wait limit slows admissions down; decreasing it speeds
/// them up.
pub trait LimitChanger: Send + Sync {
    fn increase(
        &self,
        limit: Duration,
        settings: &dyn LimiterSettings,
    ) -> Result<Duration, AdjustError>;

    fn decrease(
        &self,
        limit: Duration,
        settings: &dyn LimiterSettings,
    ) -> Result<Duration, AdjustError>;
}

/// The built-in piecewise policy.
///
/// Below one unit the limit doubles (capped at one unit) on increase and
/// steps down by the largest power-of-ten fraction of the unit smaller than
/// the limit on decrease. At or above one unit it grows by half on increase,
/// truncated to a thousandth of the unit, and shrinks by one unit on
/// decrease, never dropping below one unit.
#[derive(Debug, Clone, Copy, Default)]
pub struct LimitChange;

impl LimitChanger for LimitChange {
    fn increase(
        &self,
        limit: Duration,
        settings: &dyn LimiterSettings,
    ) -> Result<Duration, AdjustError> {
        let unit = settings.unit();
        let unit_nanos = unit.as_nanos();
        let limit_nanos = limit.as_nanos();

        let next = if limit_nanos == 0 {
            unit_nanos
        } else if limit_nanos < unit_nanos {
            (limit_nanos * 2).min(unit_nanos)
        } else {
            let granularity = unit_nanos / 1000;
            if granularity == 0 {
                return Err(AdjustError::UnitTooSmall { unit });
            }
            let grown = limit_nanos * 3 / 2;
            grown - grown % granularity
        };

        Ok(duration_from_nanos(next))
    }

    fn decrease(
        &self,
        limit: Duration,
        settings: &dyn LimiterSettings,
    ) -> Result<Duration, AdjustError> {
        let unit_nanos = settings.unit().as_nanos();
        let limit_nanos = limit.as_nanos();

        let next = if limit_nanos == 0 {
            0
        } else if limit_nanos > unit_nanos {
            (limit_nanos - unit_nanos).max(unit_nanos)
        } else {
            let mut step = unit_nanos / 10;
            while step > 0 && limit_nanos <= step {
                step /= 10;
            }
            (limit_nanos - step).max(step)
        };

        Ok(duration_from_nanos(next))
    }
}
