//! The "CLUSTER" Engine - Density-Based Defect Grouping
//!
//! Turns one batch of noisy observations into defect clusters:
//! 1. Confidence filter (`confidence > threshold` survives)
//! 2. DBSCAN over great-circle distance (`radius_meters`, `min_samples`)
//! 3. Summaries: arithmetic-mean centroid, member count, mean confidence
//!
//! Cluster ids are run-local sequence numbers starting at 0 in discovery
//! order. They carry no meaning across runs; long-lived identity is the
//! store merger's business.

use chrono::{DateTime, Utc};
use nalgebra::Vector2;
use roadwatch_env::Clock;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

use crate::observation::{MalformedObservation, Observation};
use crate::roadwatch_space::{NeighborIndex, SpaceError};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Default confidence cut-off; observations at or below it are dropped.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.5;

/// Default neighbourhood radius in meters.
pub const DEFAULT_RADIUS_METERS: f64 = 400.0;

/// Parameters for one clustering run.
///
/// `min_samples` has no default and must always be chosen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Observations with `confidence <= confidence_threshold` are discarded
    pub confidence_threshold: f64,

    /// Neighbourhood radius along the Earth's surface (meters)
    pub radius_meters: f64,

    /// Minimum neighbourhood size (self included) for a core point
    pub min_samples: usize,
}

impl ClusterConfig {
    pub fn new(min_samples: usize) -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            radius_meters: DEFAULT_RADIUS_METERS,
            min_samples,
        }
    }

    pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn with_radius_meters(mut self, radius_meters: f64) -> Self {
        self.radius_meters = radius_meters;
        self
    }

    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.min_samples == 0 {
            return Err(ClusterError::InvalidMinSamples);
        }
        if !self.radius_meters.is_finite() || self.radius_meters <= 0.0 {
            return Err(ClusterError::InvalidRadius(self.radius_meters));
        }
        if !self.confidence_threshold.is_finite() || !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ClusterError::InvalidThreshold(self.confidence_threshold));
        }
        Ok(())
    }
}

// ============================================================================
// OUTPUT TYPES
// ============================================================================

/// Cluster assignment of a single observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum ClusterLabel {
    /// Not dense enough to belong to any cluster
    Noise,
    Member(u32),
}

impl ClusterLabel {
    /// Sentinel written to tables for noise.
    pub const NOISE_ID: i64 = -1;

    pub fn id(&self) -> i64 {
        match self {
            Self::Noise => Self::NOISE_ID,
            Self::Member(id) => i64::from(*id),
        }
    }

    pub fn is_noise(&self) -> bool {
        matches!(self, Self::Noise)
    }
}

impl From<ClusterLabel> for i64 {
    fn from(label: ClusterLabel) -> Self {
        label.id()
    }
}

impl TryFrom<i64> for ClusterLabel {
    type Error = String;

    fn try_from(id: i64) -> Result<Self, Self::Error> {
        match id {
            Self::NOISE_ID => Ok(Self::Noise),
            id => u32::try_from(id)
                .map(Self::Member)
                .map_err(|_| format!("invalid cluster id {id}")),
        }
    }
}

impl fmt::Display for ClusterLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// An observation together with the cluster it landed in.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledObservation {
    pub observation: Observation,
    pub label: ClusterLabel,
}

/// Summary of one spatial group of observations.
///
/// Field names on disk follow the store schema:
/// `cluster_id, lat, lon, num_detections, avg_confidence, last_seen`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub cluster_id: u64,

    #[serde(rename = "lat")]
    pub centroid_lat: f64,

    #[serde(rename = "lon")]
    pub centroid_lon: f64,

    #[serde(rename = "num_detections")]
    pub member_count: usize,

    #[serde(rename = "avg_confidence")]
    pub mean_confidence: f64,

    /// When this cluster was last computed (wall clock, not observation time)
    #[serde(with = "crate::iso8601")]
    pub last_seen: DateTime<Utc>,
}

/// Whether a run produced anything to summarise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Nothing survived the confidence filter; zero clusters by definition
    Empty,
    /// At least one observation was clustered (possibly all noise)
    Clustered,
}

/// Everything a clustering run produces.
#[derive(Debug, Clone)]
pub struct ClusterOutcome {
    /// Observations that passed validation and the confidence filter, in
    /// input order, with their labels
    pub labeled: Vec<LabeledObservation>,

    /// One summary per cluster, ordered by `cluster_id`
    pub clusters: Vec<Cluster>,

    /// Observations dropped by the confidence filter
    pub filtered_out: usize,

    /// Observations that failed validation
    pub rejected: Vec<MalformedObservation>,
}

impl ClusterOutcome {
    pub fn status(&self) -> BatchStatus {
        if self.labeled.is_empty() {
            BatchStatus::Empty
        } else {
            BatchStatus::Clustered
        }
    }

    /// True when no observation reached the clustering step.
    pub fn is_empty(&self) -> bool {
        self.status() == BatchStatus::Empty
    }

    pub fn noise_count(&self) -> usize {
        self.labeled.iter().filter(|l| l.label.is_noise()).count()
    }
}

// ============================================================================
// CLUSTER ENGINE
// ============================================================================

/// Runs the filter -> DBSCAN -> summarise pipeline for a batch.
pub struct ClusterEngine<C: Clock> {
    config: ClusterConfig,
    clock: C,
}

impl<C: Clock> ClusterEngine<C> {
    /// Create an engine, rejecting unusable parameters up front.
    pub fn new(config: ClusterConfig, clock: C) -> Result<Self, ClusterError> {
        config.validate()?;
        Ok(Self { config, clock })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Cluster one batch.
    ///
    /// An empty batch (or one emptied by the filter) is not an error; check
    /// `ClusterOutcome::status`.
    pub fn run(&self, observations: &[Observation]) -> Result<ClusterOutcome, ClusterError> {
        let mut rejected = Vec::new();
        let mut retained = Vec::new();
        let mut filtered_out = 0;

        for (row, obs) in observations.iter().enumerate() {
            if let Err(reason) = obs.validate() {
                let malformed = MalformedObservation::rejected(row, obs, reason);
                malformed.log();
                rejected.push(malformed);
                continue;
            }
            if obs.confidence > self.config.confidence_threshold {
                retained.push(obs);
            } else {
                filtered_out += 1;
            }
        }

        debug!(
            retained = retained.len(),
            filtered_out,
            rejected = rejected.len(),
            threshold = self.config.confidence_threshold,
            "confidence filter applied"
        );

        let points = retained.iter().map(|o| (o.latitude, o.longitude)).collect();
        let index = NeighborIndex::build(points, self.config.radius_meters)?;
        let labels = dbscan(&index, self.config.min_samples);

        let clusters = summarize(&retained, &labels, self.clock.now());

        info!(
            observations = observations.len(),
            retained = retained.len(),
            clusters = clusters.len(),
            noise = labels.iter().filter(|l| l.is_noise()).count(),
            "clustering complete"
        );

        let labeled = retained
            .into_iter()
            .zip(labels)
            .map(|(obs, label)| LabeledObservation {
                observation: obs.clone(),
                label,
            })
            .collect();

        Ok(ClusterOutcome {
            labeled,
            clusters,
            filtered_out,
            rejected,
        })
    }
}

/// One-shot form of [`ClusterEngine::run`].
pub fn cluster<C: Clock>(
    observations: &[Observation],
    confidence_threshold: f64,
    radius_meters: f64,
    min_samples: usize,
    clock: C,
) -> Result<ClusterOutcome, ClusterError> {
    let config = ClusterConfig::new(min_samples)
        .with_confidence_threshold(confidence_threshold)
        .with_radius_meters(radius_meters);
    ClusterEngine::new(config, clock)?.run(observations)
}

/// DBSCAN labelling over the index.
///
/// Points are visited in index order; each unlabelled core point seeds a new
/// cluster that grows through the neighbourhoods of its core members. Border
/// points join the first cluster that reaches them, so a later cluster can
/// end up smaller than `min_samples`; such groups are demoted to noise.
fn dbscan(index: &NeighborIndex, min_samples: usize) -> Vec<ClusterLabel> {
    let n = index.len();
    let neighborhoods: Vec<Vec<usize>> = (0..n).map(|i| index.neighbors(i)).collect();
    let is_core: Vec<bool> = neighborhoods.iter().map(|nb| nb.len() >= min_samples).collect();

    let mut labels = vec![ClusterLabel::Noise; n];
    let mut next_id: u32 = 0;
    let mut stack = Vec::new();

    for seed in 0..n {
        if !labels[seed].is_noise() || !is_core[seed] {
            continue;
        }

        let label = ClusterLabel::Member(next_id);
        next_id += 1;
        labels[seed] = label;
        stack.push(seed);

        while let Some(point) = stack.pop() {
            for &neighbor in &neighborhoods[point] {
                if !labels[neighbor].is_noise() {
                    continue;
                }
                labels[neighbor] = label;
                if is_core[neighbor] {
                    stack.push(neighbor);
                }
            }
        }
    }

    drop_undersized(&mut labels, next_id as usize, min_samples);
    labels
}

/// Turn groups below `min_samples` into noise and renumber the rest densely,
/// preserving discovery order.
fn drop_undersized(labels: &mut [ClusterLabel], cluster_count: usize, min_samples: usize) {
    let mut sizes = vec![0usize; cluster_count];
    for label in labels.iter() {
        if let ClusterLabel::Member(id) = label {
            sizes[*id as usize] += 1;
        }
    }
    if sizes.iter().all(|&size| size >= min_samples) {
        return;
    }

    let mut remap = vec![None; cluster_count];
    let mut next_id: u32 = 0;
    for (id, &size) in sizes.iter().enumerate() {
        if size >= min_samples {
            remap[id] = Some(next_id);
            next_id += 1;
        }
    }
    debug!(dropped = cluster_count - next_id as usize, "undersized clusters demoted to noise");

    for label in labels.iter_mut() {
        if let ClusterLabel::Member(id) = *label {
            *label = remap[id as usize].map_or(ClusterLabel::Noise, ClusterLabel::Member);
        }
    }
}

/// Per-cluster centroid, count and mean confidence.
fn summarize(
    observations: &[&Observation],
    labels: &[ClusterLabel],
    computed_at: DateTime<Utc>,
) -> Vec<Cluster> {
    let cluster_count = labels
        .iter()
        .filter_map(|l| match l {
            ClusterLabel::Member(id) => Some(*id as usize + 1),
            ClusterLabel::Noise => None,
        })
        .max()
        .unwrap_or(0);

    let mut position_sums = vec![Vector2::<f64>::zeros(); cluster_count];
    let mut confidence_sums = vec![0.0; cluster_count];
    let mut counts = vec![0usize; cluster_count];

    for (obs, label) in observations.iter().zip(labels) {
        if let ClusterLabel::Member(id) = label {
            let id = *id as usize;
            position_sums[id] += Vector2::new(obs.latitude, obs.longitude);
            confidence_sums[id] += obs.confidence;
            counts[id] += 1;
        }
    }

    (0..cluster_count)
        .map(|id| {
            let count = counts[id] as f64;
            let centroid = position_sums[id] / count;
            Cluster {
                cluster_id: id as u64,
                centroid_lat: centroid.x,
                centroid_lon: centroid.y,
                member_count: counts[id],
                mean_confidence: confidence_sums[id] / count,
                last_seen: computed_at,
            }
        })
        .collect()
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClusterError {
    #[error("min_samples must be at least 1")]
    InvalidMinSamples,

    #[error("radius_meters must be a positive number of meters, got {0}")]
    InvalidRadius(f64),

    #[error("confidence_threshold must lie in [0, 1], got {0}")]
    InvalidThreshold(f64),

    #[error("spatial index error: {0}")]
    Space(#[from] SpaceError),
}

// ============================================================================
// TESTS
// ============================================================================
