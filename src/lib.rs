//! Ratelock - Rate Limited Exclusive Locking
//!
//! This crate implements a mutual-exclusion lock whose acquisition rate is
//! throttled by a token bucket. The bucket's refill interval can be grown
//! and shrunk through pluggable policies, either directly or by a background
//! control loop that reacts to contention.

pub mod config;
pub mod control;
pub mod driver;
pub mod error;
pub mod ratelimit;
