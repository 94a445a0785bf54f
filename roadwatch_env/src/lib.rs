//! RoadWatch Environment Abstraction Layer
//!
//! The cluster engine stamps every summary with the wall-clock time at which
//! it was computed. This crate puts that clock behind a trait so that batch
//! runs use the real system time while tests and replays use a clock whose
//! value is fixed and advanced by hand.
//!
//! - **Production**: `SystemClock` - wraps `chrono::Utc::now()`
//! - **Testing / replay**: `ManualClock` - virtual time, set and advanced explicitly
//!
//! # Example
//!
//! ```
//! use roadwatch_env::{Clock, ManualClock};
//! use std::time::Duration;
//!
//! let clock = ManualClock::at_epoch_secs(1_704_067_200);
//! let before = clock.now();
//! clock.advance(Duration::from_secs(10));
//! assert_eq!((clock.now() - before).num_seconds(), 10);
//! ```

mod clock;
mod manual;
mod system_impl;

pub use clock::Clock;
pub use manual::ManualClock;
pub use system_impl::SystemClock;
