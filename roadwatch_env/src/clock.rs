//! Core clock trait for RoadWatch engines.

use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Source of wall-clock time.
///
/// # Implementations
///
/// - **Production**: `SystemClock` - the operating system clock
/// - **Testing**: `ManualClock` - virtual time controlled by the caller
pub trait Clock: Send + Sync {
    /// Returns the current wall-clock time in UTC.
    fn now(&self) -> DateTime<Utc>;
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}
