//! Observations - geolocated, time-stamped defect detections.
//!
//! An `Observation` is produced upstream (inference + temporal alignment) and
//! consumed read-only by the cluster engine. Records that fail validation are
//! never fatal for a batch: they are collected as `MalformedObservation`s with
//! enough context (`row`, `source_id`, `frame_index`) to find them again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::warn;

/// A single detection of a road defect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// WGS84 latitude in degrees
    pub latitude: f64,

    /// WGS84 longitude in degrees
    pub longitude: f64,

    /// Detector confidence [0.0 - 1.0]
    pub confidence: f64,

    /// Time the frame was captured
    #[serde(alias = "time", with = "crate::iso8601")]
    pub timestamp: DateTime<Utc>,

    /// Originating video / vehicle / pass. Traceability only.
    #[serde(alias = "video")]
    pub source_id: String,

    /// Frame number within the source video, when known
    #[serde(default, alias = "frame")]
    pub frame_index: Option<u64>,
}

impl Observation {
    /// Create a validated observation.
    pub fn new(
        latitude: f64,
        longitude: f64,
        confidence: f64,
        timestamp: DateTime<Utc>,
        source_id: impl Into<String>,
    ) -> Result<Self, ObservationError> {
        let observation = Self {
            latitude,
            longitude,
            confidence,
            timestamp,
            source_id: source_id.into(),
            frame_index: None,
        };
        observation.validate()?;
        Ok(observation)
    }

    /// Attach the frame number this detection came from.
    pub fn with_frame_index(mut self, frame_index: u64) -> Self {
        self.frame_index = Some(frame_index);
        self
    }

    /// Check ranges: finite coordinates on the globe, confidence in [0, 1].
    pub fn validate(&self) -> Result<(), ObservationError> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(ObservationError::Latitude(self.latitude));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(ObservationError::Longitude(self.longitude));
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(ObservationError::Confidence(self.confidence));
        }
        Ok(())
    }
}

/// Why a record could not be used.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ObservationError {
    #[error("confidence {0} outside [0, 1]")]
    Confidence(f64),

    #[error("latitude {0} is not a finite value in [-90, 90]")]
    Latitude(f64),

    #[error("longitude {0} is not a finite value in [-180, 180]")]
    Longitude(f64),

    #[error("unparseable record: {0}")]
    Unparseable(String),
}

/// A rejected record, with the context needed to trace it back.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedObservation {
    /// Zero-based position of the record in its batch
    pub row: usize,

    pub source_id: Option<String>,

    pub frame_index: Option<u64>,

    pub reason: ObservationError,
}

impl MalformedObservation {
    /// Rejection for an observation that parsed but failed validation.
    pub fn rejected(row: usize, observation: &Observation, reason: ObservationError) -> Self {
        Self {
            row,
            source_id: Some(observation.source_id.clone()),
            frame_index: observation.frame_index,
            reason,
        }
    }

    /// Emit the rejection as a structured warning.
    pub fn log(&self) {
        warn!(
            row = self.row,
            source_id = self.source_id.as_deref().unwrap_or("?"),
            frame_index = ?self.frame_index,
            reason = %self.reason,
            "rejected malformed observation"
        );
    }
}

impl fmt::Display for MalformedObservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row {}", self.row)?;
        if let Some(source_id) = &self.source_id {
            write!(f, " (source {source_id}")?;
            if let Some(frame) = self.frame_index {
                write!(f, ", frame {frame}")?;
            }
            write!(f, ")")?;
        }
        write!(f, ": {}", self.reason)
    }
}

/// Observations accepted from a batch plus everything that was rejected.
#[derive(Debug, Clone, Default)]
pub struct ObservationBatch {
    pub observations: Vec<Observation>,
    pub rejected: Vec<MalformedObservation>,
}

impl ObservationBatch {
    /// Validate parsed records, keeping the good ones in order.
    ///
    /// `Err` items are records that could not even be parsed.
    pub fn collect<I>(records: I) -> Self
    where
        I: IntoIterator<Item = Result<Observation, MalformedObservation>>,
    {
        let mut batch = Self::default();
        for (row, record) in records.into_iter().enumerate() {
            match record.and_then(|obs| match obs.validate() {
                Ok(()) => Ok(obs),
                Err(reason) => Err(MalformedObservation::rejected(row, &obs, reason)),
            }) {
                Ok(obs) => batch.observations.push(obs),
                Err(malformed) => {
                    malformed.log();
                    batch.rejected.push(malformed);
                }
            }
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}

/// A raw detection before it has been placed on the map.
///
/// Carries a capture timestamp; the coordinates come from the position track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    #[serde(alias = "video")]
    pub source_id: String,

    #[serde(default, alias = "frame")]
    pub frame_index: Option<u64>,

    #[serde(alias = "time", with = "crate::iso8601")]
    pub timestamp: DateTime<Utc>,

    pub confidence: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn sample(lat: f64, lon: f64, confidence: f64) -> Observation {
        Observation {
            latitude: lat,
            longitude: lon,
            confidence,
            timestamp: t0(),
            source_id: "cam-a".to_string(),
            frame_index: Some(7),
        }
    }

    #[test]
    fn test_new_validates() {
        assert!(Observation::new(10.0, 20.0, 0.9, t0(), "cam-a").is_ok());
        assert_eq!(
            Observation::new(10.0, 20.0, 1.5, t0(), "cam-a"),
            Err(ObservationError::Confidence(1.5))
        );
        assert!(matches!(
            Observation::new(f64::NAN, 20.0, 0.5, t0(), "cam-a"),
            Err(ObservationError::Latitude(_))
        ));
        assert!(matches!(
            Observation::new(10.0, 181.0, 0.5, t0(), "cam-a"),
            Err(ObservationError::Longitude(_))
        ));
    }

    #[test]
    fn test_confidence_bounds_inclusive() {
        assert!(sample(0.0, 0.0, 0.0).validate().is_ok());
        assert!(sample(0.0, 0.0, 1.0).validate().is_ok());
        assert!(sample(0.0, 0.0, -0.01).validate().is_err());
    }

    #[test]
    fn test_batch_collects_rejections_with_context() {
        let records = vec![
            Ok(sample(10.0, 20.0, 0.9)),
            Ok(sample(10.0, 20.0, 2.0)),
            Err(MalformedObservation {
                row: 2,
                source_id: Some("cam-b".to_string()),
                frame_index: None,
                reason: ObservationError::Unparseable("latitude: invalid float".to_string()),
            }),
            Ok(sample(10.1, 20.1, 0.7)),
        ];

        let batch = ObservationBatch::collect(records);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.rejected.len(), 2);

        let bad = &batch.rejected[0];
        assert_eq!(bad.row, 1);
        assert_eq!(bad.source_id.as_deref(), Some("cam-a"));
        assert_eq!(bad.frame_index, Some(7));
        assert_eq!(bad.reason, ObservationError::Confidence(2.0));
        assert_eq!(bad.to_string(), "row 1 (source cam-a, frame 7): confidence 2 outside [0, 1]");
    }

    #[test]
    fn test_legacy_column_aliases() {
        let json = r#"{
            "video": "run1.mp4",
            "frame": 42,
            "time": "2024-05-01T12:00:00",
            "latitude": 10.0,
            "longitude": 20.0,
            "confidence": 0.8
        }"#;
        let obs: Observation = serde_json::from_str(json).unwrap();
        assert_eq!(obs.source_id, "run1.mp4");
        assert_eq!(obs.frame_index, Some(42));
        assert_eq!(obs.timestamp, t0());
    }
}
