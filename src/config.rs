//! Process-wide defaults.
//!
//! [`PromiseOut::new`](crate::PromiseOut::new) reads the default timeout at
//! construction time, so changing it only affects futures created afterwards.
//! Prefer [`PromiseOut::builder`](crate::PromiseOut::builder) when a timeout
//! belongs to one call site rather than to the whole process.
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

static DEFAULT_TIMEOUT_NANOS: AtomicU64 = AtomicU64::new(DEFAULT_TIMEOUT.as_nanos() as u64);

pub fn default_timeout() -> Duration {
    Duration::from_nanos(DEFAULT_TIMEOUT_NANOS.load(Ordering::Relaxed))
}

/// Durations beyond `u64::MAX` nanoseconds (about 584 years) are clamped.
pub fn set_default_timeout(timeout: Duration) {
    let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
    DEFAULT_TIMEOUT_NANOS.store(nanos, Ordering::Relaxed);
}
