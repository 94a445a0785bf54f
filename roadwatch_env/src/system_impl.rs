//! Production implementation of `Clock`.

use crate::Clock;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Clock backed by the operating system's real-time clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Creates a new SystemClock.
    pub fn new() -> Self {
        Self
    }

    /// Creates an Arc-wrapped clock for sharing.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
