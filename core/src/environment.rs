//! Injected environment dependencies.
//!
//! Lifecycle timestamps are read through the [`Clock`] trait so tests can pin
//! time to a fixed instant and assert on timestamp fields deterministically.

use chrono::{DateTime, Utc};

/// Abstracts time so lifecycle timestamps are testable.
pub trait Clock: Send + Sync {
    /// Get the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
