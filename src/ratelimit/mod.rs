//! Rate limited locking and the policies that tune it.

mod bucket;
mod changer;
mod limiter;

pub use bucket::Bucket;
pub use changer::{AdjustError, LimitChange, LimitChanger, LimiterSettings};
pub use limiter::{Limiter, LimiterSnapshot, RateLimitGuard, RateLimiter};
