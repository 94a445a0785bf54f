//! The "TIME" Engine - Nearest-Sample Track Alignment
//!
//! Places detections on the map by matching their capture time against an
//! independently sampled position track:
//! - `PositionTrack` enforces a non-empty, strictly increasing timeline
//! - `closest_sample` finds the nearest fix by binary search (O(log n))
//! - Equidistant queries resolve to the **earlier** sample
//!
//! There is no interpolation between fixes. The distance in time to the
//! chosen fix is reported as `Alignment::age` so callers can flag stale
//! matches; nothing is rejected here.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::observation::{MalformedObservation, Observation, RawDetection};

// ============================================================================
// POSITION TRACK
// ============================================================================

/// A single position fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    /// Acquisition time of the fix
    #[serde(alias = "time", with = "crate::iso8601")]
    pub timestamp: DateTime<Utc>,

    /// WGS84 latitude in degrees
    #[serde(alias = "lat")]
    pub latitude: f64,

    /// WGS84 longitude in degrees
    #[serde(alias = "lon")]
    pub longitude: f64,
}

impl PositionSample {
    pub fn new(timestamp: DateTime<Utc>, latitude: f64, longitude: f64) -> Self {
        Self {
            timestamp,
            latitude,
            longitude,
        }
    }

    fn has_valid_coordinates(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// A time-ordered sequence of position fixes.
///
/// Invariants: at least one sample, timestamps strictly increasing.
/// Immutable once built, so it can be shared across threads freely.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionTrack {
    samples: Vec<PositionSample>,
}

impl PositionTrack {
    /// Build a track from samples already sorted by timestamp.
    ///
    /// Fails on an empty sequence, on any non-increasing step, and on
    /// coordinates that are not on the globe.
    pub fn new(samples: Vec<PositionSample>) -> Result<Self, TrackError> {
        if samples.is_empty() {
            return Err(TrackError::Empty);
        }
        for (index, sample) in samples.iter().enumerate() {
            if !sample.has_valid_coordinates() {
                return Err(TrackError::InvalidCoordinates { index });
            }
        }
        for (offset, pair) in samples.windows(2).enumerate() {
            let index = offset + 1;
            if pair[1].timestamp == pair[0].timestamp {
                return Err(TrackError::DuplicateTimestamp {
                    index,
                    timestamp: pair[1].timestamp,
                });
            }
            if pair[1].timestamp < pair[0].timestamp {
                return Err(TrackError::Unsorted { index });
            }
        }
        Ok(Self { samples })
    }

    /// Build a track from samples in any order.
    ///
    /// Samples are stably sorted by timestamp first. Two fixes with the same
    /// timestamp still fail, since no strict order exists between them.
    pub fn from_unsorted(mut samples: Vec<PositionSample>) -> Result<Self, TrackError> {
        samples.sort_by_key(|s| s.timestamp);
        Self::new(samples)
    }

    pub fn samples(&self) -> &[PositionSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Always false; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// First fix in time.
    pub fn first(&self) -> &PositionSample {
        &self.samples[0]
    }

    /// Last fix in time.
    pub fn last(&self) -> &PositionSample {
        &self.samples[self.samples.len() - 1]
    }

    /// Index of the sample closest in time to `query`.
    ///
    /// Binary search for the insertion point (first sample with
    /// `timestamp >= query`), then compare the neighbours on either side.
    /// Ties go to the earlier sample.
    pub fn closest_index(&self, query: DateTime<Utc>) -> usize {
        let pos = self.samples.partition_point(|s| s.timestamp < query);

        if pos == 0 {
            return 0;
        }
        if pos == self.samples.len() {
            return pos - 1;
        }

        // before.timestamp < query <= after.timestamp
        let before = &self.samples[pos - 1];
        let after = &self.samples[pos];
        let to_before = query - before.timestamp;
        let to_after = after.timestamp - query;

        if to_before <= to_after {
            pos - 1
        } else {
            pos
        }
    }

    /// The sample closest in time to `query`.
    pub fn closest_sample(&self, query: DateTime<Utc>) -> &PositionSample {
        &self.samples[self.closest_index(query)]
    }

    /// Closest sample together with how far away in time it is.
    pub fn align(&self, query: DateTime<Utc>) -> Alignment {
        let index = self.closest_index(query);
        let sample = self.samples[index];
        let age = if query >= sample.timestamp {
            query - sample.timestamp
        } else {
            sample.timestamp - query
        };
        Alignment { sample, index, age }
    }
}

/// Free-function form of [`PositionTrack::closest_sample`].
pub fn closest_sample(track: &PositionTrack, query: DateTime<Utc>) -> &PositionSample {
    track.closest_sample(query)
}

/// Result of aligning one timestamp against a track.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Alignment {
    /// The chosen fix, coordinates used verbatim
    pub sample: PositionSample,

    /// Position of the fix within the track
    pub index: usize,

    /// Absolute time between the query and the chosen fix
    pub age: Duration,
}

impl Alignment {
    /// True when the chosen fix is further than `max_age` from the query.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.age > max_age
    }
}

// ============================================================================
// FRAME CLOCK
// ============================================================================

/// Maps video frame numbers to capture timestamps.
///
/// Frame `n` is stamped `start + n / fps` seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameClock {
    start: DateTime<Utc>,
    fps: f64,
}

impl FrameClock {
    pub fn new(start: DateTime<Utc>, fps: f64) -> Result<Self, TrackError> {
        if !fps.is_finite() || fps <= 0.0 {
            return Err(TrackError::InvalidFrameRate(fps));
        }
        Ok(Self { start, fps })
    }

    /// Clock whose frame 0 coincides with the first fix of `track`.
    ///
    /// This assumes recording started together with the position logger.
    pub fn anchored(track: &PositionTrack, fps: f64) -> Result<Self, TrackError> {
        Self::new(track.first().timestamp, fps)
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    /// Capture time of `frame_index`, to the nearest nanosecond.
    pub fn timestamp(&self, frame_index: u64) -> DateTime<Utc> {
        let offset_ns = (frame_index as f64 / self.fps * 1e9).round() as i64;
        self.start + Duration::nanoseconds(offset_ns)
    }
}

// ============================================================================
// DETECTION LOCATION
// ============================================================================

/// Detections placed on the map, plus what could not be placed.
#[derive(Debug, Clone, Default)]
pub struct LocateOutcome {
    pub observations: Vec<Observation>,

    pub rejected: Vec<MalformedObservation>,

    /// Number of observations whose fix was older than the allowed age
    pub stale: usize,
}

/// Attach coordinates to raw detections using the nearest track sample.
///
/// Stale matches (older than `max_age`) are counted and logged but kept.
/// Detections with an out-of-range confidence are rejected.
pub fn locate(
    track: &PositionTrack,
    detections: &[RawDetection],
    max_age: Option<Duration>,
) -> LocateOutcome {
    let mut outcome = LocateOutcome::default();

    for (row, detection) in detections.iter().enumerate() {
        let alignment = track.align(detection.timestamp);

        let observation = Observation {
            latitude: alignment.sample.latitude,
            longitude: alignment.sample.longitude,
            confidence: detection.confidence,
            timestamp: detection.timestamp,
            source_id: detection.source_id.clone(),
            frame_index: detection.frame_index,
        };

        if let Err(reason) = observation.validate() {
            let malformed = MalformedObservation::rejected(row, &observation, reason);
            malformed.log();
            outcome.rejected.push(malformed);
            continue;
        }

        if let Some(max_age) = max_age {
            if alignment.is_stale(max_age) {
                outcome.stale += 1;
                warn!(
                    row,
                    source_id = %detection.source_id,
                    age_ms = alignment.age.num_milliseconds(),
                    "stale position match"
                );
            }
        }
        debug!(row, index = alignment.index, "aligned detection");

        outcome.observations.push(observation);
    }

    outcome
}

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Structural problems with a position track. Fatal before any alignment.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackError {
    #[error("position track is empty")]
    Empty,

    #[error("position track is not sorted: sample {index} is earlier than its predecessor")]
    Unsorted { index: usize },

    #[error("position track has a repeated timestamp {timestamp} at sample {index}")]
    DuplicateTimestamp {
        index: usize,
        timestamp: DateTime<Utc>,
    },

    #[error("position track sample {index} has invalid coordinates")]
    InvalidCoordinates { index: usize },

    #[error("invalid frame rate: {0}")]
    InvalidFrameRate(f64),
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn secs(s: i64) -> DateTime<Utc> {
        t0() + Duration::seconds(s)
    }

    fn track_at(offsets: &[i64]) -> PositionTrack {
        let samples = offsets
            .iter()
            .enumerate()
            .map(|(i, &s)| PositionSample::new(secs(s), 10.0, 20.0 + i as f64 * 0.01))
            .collect();
        PositionTrack::new(samples).unwrap()
    }

    #[test]
    fn test_two_sample_scenario() {
        let track = PositionTrack::new(vec![
            PositionSample::new(t0(), 10.0, 20.0),
            PositionSample::new(secs(10), 10.0, 20.01),
        ])
        .unwrap();

        let hit = closest_sample(&track, secs(3));
        assert_eq!(hit.timestamp, t0());
        assert_relative_eq!(hit.longitude, 20.0);
    }

    #[test]
    fn test_empty_track_rejected() {
        assert_eq!(PositionTrack::new(vec![]), Err(TrackError::Empty));
    }

    #[test]
    fn test_unsorted_track_rejected() {
        let samples = vec![
            PositionSample::new(secs(5), 10.0, 20.0),
            PositionSample::new(secs(1), 10.0, 20.0),
        ];
        assert_eq!(
            PositionTrack::new(samples.clone()),
            Err(TrackError::Unsorted { index: 1 })
        );

        let sorted = PositionTrack::from_unsorted(samples).unwrap();
        assert_eq!(sorted.first().timestamp, secs(1));
        assert_eq!(sorted.last().timestamp, secs(5));
    }

    #[test]
    fn test_duplicate_timestamp_rejected() {
        let samples = vec![
            PositionSample::new(secs(1), 10.0, 20.0),
            PositionSample::new(secs(1), 10.5, 20.0),
        ];
        assert!(matches!(
            PositionTrack::from_unsorted(samples),
            Err(TrackError::DuplicateTimestamp { index: 1, .. })
        ));
    }

    #[test]
    fn test_invalid_coordinates_rejected() {
        let samples = vec![
            PositionSample::new(secs(0), 10.0, 20.0),
            PositionSample::new(secs(1), f64::NAN, 20.0),
        ];
        assert_eq!(
            PositionTrack::new(samples),
            Err(TrackError::InvalidCoordinates { index: 1 })
        );
    }

    #[test]
    fn test_single_sample_track() {
        let track = track_at(&[100]);
        assert_eq!(track.closest_index(secs(-1000)), 0);
        assert_eq!(track.closest_index(secs(100)), 0);
        assert_eq!(track.closest_index(secs(1000)), 0);
    }

    #[test]
    fn test_tie_goes_to_earlier() {
        let track = track_at(&[0, 10, 20]);
        assert_eq!(track.closest_index(secs(5)), 0);
        assert_eq!(track.closest_index(secs(15)), 1);
        assert_eq!(track.closest_index(secs(6)), 1);
    }

    #[test]
    fn test_alignment_age() {
        let track = track_at(&[0, 10]);

        let inside = track.align(secs(7));
        assert_eq!(inside.index, 1);
        assert_eq!(inside.age, Duration::seconds(3));

        let before = track.align(secs(-30));
        assert_eq!(before.index, 0);
        assert_eq!(before.age, Duration::seconds(30));
        assert!(before.is_stale(Duration::seconds(5)));
        assert!(!inside.is_stale(Duration::seconds(5)));
    }

    #[test]
    fn test_frame_clock() {
        let track = track_at(&[0, 10]);
        let clock = FrameClock::anchored(&track, 30.0).unwrap();

        assert_eq!(clock.timestamp(0), t0());
        assert_eq!(clock.timestamp(30), secs(1));
        assert_eq!(clock.timestamp(45), t0() + Duration::milliseconds(1500));

        assert_eq!(FrameClock::new(t0(), 0.0), Err(TrackError::InvalidFrameRate(0.0)));
        assert!(FrameClock::new(t0(), f64::NAN).is_err());
    }

    #[test]
    fn test_locate_attaches_coordinates() {
        let track = PositionTrack::new(vec![
            PositionSample::new(t0(), 10.0, 20.0),
            PositionSample::new(secs(10), 10.0, 20.01),
        ])
        .unwrap();

        let detections = vec![
            RawDetection {
                source_id: "cam-a".to_string(),
                frame_index: Some(90),
                timestamp: secs(3),
                confidence: 0.8,
            },
            RawDetection {
                source_id: "cam-a".to_string(),
                frame_index: Some(240),
                timestamp: secs(8),
                confidence: 1.3,
            },
            RawDetection {
                source_id: "cam-a".to_string(),
                frame_index: None,
                timestamp: secs(60),
                confidence: 0.7,
            },
        ];

        let outcome = locate(&track, &detections, Some(Duration::seconds(5)));
        assert_eq!(outcome.observations.len(), 2);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].row, 1);
        assert_eq!(outcome.stale, 1);

        let first = &outcome.observations[0];
        assert_relative_eq!(first.longitude, 20.0);
        assert_eq!(first.frame_index, Some(90));

        let late = &outcome.observations[1];
        assert_relative_eq!(late.longitude, 20.01);
        assert_eq!(late.timestamp, secs(60));
    }

    #[test]
    fn test_concurrent_alignment() {
        let track = track_at(&[0, 10, 20, 30]);
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|i| {
                    let track = &track;
                    scope.spawn(move || track.closest_index(secs(i * 10 + 1)))
                })
                .collect();
            for (i, handle) in handles.into_iter().enumerate() {
                assert_eq!(handle.join().unwrap(), i);
            }
        });
    }

    fn sorted_offsets() -> impl Strategy<Value = Vec<i64>> {
        prop::collection::btree_set(-100_000i64..100_000, 1..50)
            .prop_map(|set| set.into_iter().collect())
    }

    proptest! {
        #[test]
        fn prop_before_first_and_after_last(offsets in sorted_offsets(), gap in 1i64..10_000) {
            let track = track_at(&offsets);
            let first = offsets[0];
            let last = offsets[offsets.len() - 1];

            prop_assert_eq!(track.closest_index(secs(first - gap)), 0);
            prop_assert_eq!(track.closest_index(secs(last + gap)), offsets.len() - 1);
        }

        #[test]
        fn prop_exact_hit_returns_that_sample(offsets in sorted_offsets(), pick in any::<prop::sample::Index>()) {
            let track = track_at(&offsets);
            let k = pick.index(offsets.len());
            prop_assert_eq!(track.closest_index(secs(offsets[k])), k);
        }

        #[test]
        fn prop_midpoint_tie_goes_to_earlier(offsets in sorted_offsets(), pick in any::<prop::sample::Index>()) {
            prop_assume!(offsets.len() >= 2);
            let track = track_at(&offsets);
            let i = pick.index(offsets.len() - 1);
            let a = secs(offsets[i]);
            let b = secs(offsets[i + 1]);
            let mid = a + (b - a) / 2;
            // only an exact tie when the gap splits evenly
            prop_assume!(mid - a == b - mid);
            prop_assert_eq!(track.closest_index(mid), i);
        }

        #[test]
        fn prop_closest_is_never_beaten(offsets in sorted_offsets(), q in -120_000i64..120_000) {
            let track = track_at(&offsets);
            let query = secs(q);
            let chosen = track.align(query);
            for sample in track.samples() {
                let d = (sample.timestamp - query).num_milliseconds().abs();
                prop_assert!(chosen.age.num_milliseconds() <= d);
            }
        }
    }
}
