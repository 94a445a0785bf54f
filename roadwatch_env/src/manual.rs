//! Manually driven clock for deterministic tests and replays.

use crate::Clock;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Clock whose time only changes when told to.
///
/// Clones share the same virtual time, so a clock handed to the engine can
/// still be advanced from the test body.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Creates a clock frozen at the given Unix time (seconds).
    ///
    /// Out-of-range values fall back to the Unix epoch.
    pub fn at_epoch_secs(secs: i64) -> Self {
        let start = Utc
            .timestamp_opt(secs, 0)
            .single()
            .unwrap_or_default();
        Self::new(start)
    }

    /// Sets the virtual time.
    pub fn set(&self, time: DateTime<Utc>) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        *current = time;
    }

    /// Advances the virtual time by `duration`.
    pub fn advance(&self, duration: Duration) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Ok(delta) = chrono::Duration::from_std(duration) {
            *current += delta;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_is_frozen() {
        let clock = ManualClock::at_epoch_secs(1_704_067_200);
        assert_eq!(clock.now(), clock.now());
        assert_eq!(clock.now().timestamp(), 1_704_067_200);
    }

    #[test]
    fn test_clones_share_time() {
        let clock = ManualClock::at_epoch_secs(0);
        let handle = clock.clone();
        handle.advance(Duration::from_millis(1500));
        assert_eq!(clock.now().timestamp_millis(), 1500);
    }

    #[test]
    fn test_set_time() {
        let clock = ManualClock::at_epoch_secs(0);
        let target = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        clock.set(target);
        assert_eq!(clock.now(), target);
    }
}
