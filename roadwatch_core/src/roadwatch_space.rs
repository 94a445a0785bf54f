//! The "SPACE" Engine - Great-Circle Neighbourhood Queries
//!
//! Radius queries over latitude/longitude points on a sphere:
//! - H3 cells (`h3o`) shard the points for pruning; the resolution is picked
//!   from the query radius so that the searched k-ring covers it entirely
//! - Candidates are confirmed with the exact haversine distance (`geo`)
//!
//! Results are identical to a brute-force scan and always sorted by point
//! index, which keeps downstream clustering deterministic.

use geo::{HaversineDistance, Point};
use h3o::{CellIndex, LatLng, Resolution};
use std::collections::HashMap;
use thiserror::Error;

/// Mean Earth radius in meters (IUGG), used for every distance conversion.
pub const EARTH_MEAN_RADIUS_M: f64 = 6_371_008.8;

/// Above this radius the cell index stops paying off and queries scan.
const MAX_INDEXED_RADIUS_M: f64 = 100_000.0;

/// Great-circle distance in meters between two WGS84 points.
pub fn haversine_distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    Point::new(lon1, lat1).haversine_distance(&Point::new(lon2, lat2))
}

/// Convert a ground distance into the central angle it subtends, in radians.
pub fn meters_to_radians(meters: f64) -> f64 {
    meters / EARTH_MEAN_RADIUS_M
}

/// How candidates are gathered before the exact distance check.
#[derive(Debug, Clone)]
enum Strategy {
    /// H3 shards: cell -> point indices, searched over a k-ring
    Cells {
        resolution: Resolution,
        k: u32,
        cells: HashMap<CellIndex, Vec<usize>>,
        point_cells: Vec<CellIndex>,
    },
    /// Every point is a candidate
    Scan,
}

/// Fixed-radius neighbourhood index over a set of points.
#[derive(Debug, Clone)]
pub struct NeighborIndex {
    /// Points as (latitude, longitude) in degrees
    points: Vec<(f64, f64)>,

    radius_m: f64,

    strategy: Strategy,
}

impl NeighborIndex {
    /// Index `points` (latitude, longitude) for queries of `radius_m` meters.
    pub fn build(points: Vec<(f64, f64)>, radius_m: f64) -> Result<Self, SpaceError> {
        if !radius_m.is_finite() || radius_m <= 0.0 {
            return Err(SpaceError::InvalidRadius(radius_m));
        }

        let strategy = match cell_resolution(radius_m) {
            Some(resolution) => {
                let k = ring_size(radius_m, resolution);
                let mut cells: HashMap<CellIndex, Vec<usize>> = HashMap::new();
                let mut point_cells = Vec::with_capacity(points.len());
                for (i, &(lat, lon)) in points.iter().enumerate() {
                    let cell = to_cell(lat, lon, resolution, i)?;
                    cells.entry(cell).or_default().push(i);
                    point_cells.push(cell);
                }
                Strategy::Cells {
                    resolution,
                    k,
                    cells,
                    point_cells,
                }
            }
            None => {
                for (i, &(lat, lon)) in points.iter().enumerate() {
                    check_coordinates(lat, lon, i)?;
                }
                Strategy::Scan
            }
        };

        Ok(Self {
            points,
            radius_m,
            strategy,
        })
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn radius_m(&self) -> f64 {
        self.radius_m
    }

    pub fn point(&self, i: usize) -> (f64, f64) {
        self.points[i]
    }

    /// Indices of all points within the radius of point `i`, itself included.
    pub fn neighbors(&self, i: usize) -> Vec<usize> {
        let (lat, lon) = self.points[i];
        let origin = match &self.strategy {
            Strategy::Cells { point_cells, .. } => Some(point_cells[i]),
            Strategy::Scan => None,
        };
        self.collect_within(lat, lon, origin)
    }

    /// Indices of all points within the radius of an arbitrary location.
    pub fn within(&self, lat: f64, lon: f64) -> Result<Vec<usize>, SpaceError> {
        let origin = match &self.strategy {
            Strategy::Cells { resolution, .. } => Some(to_cell(lat, lon, *resolution, usize::MAX)?),
            Strategy::Scan => {
                check_coordinates(lat, lon, usize::MAX)?;
                None
            }
        };
        Ok(self.collect_within(lat, lon, origin))
    }

    /// Closest point within the radius, with its distance in meters.
    ///
    /// Equal distances resolve to the lower index.
    pub fn nearest_within(&self, lat: f64, lon: f64) -> Result<Option<(usize, f64)>, SpaceError> {
        let nearest = self
            .within(lat, lon)?
            .into_iter()
            .map(|j| {
                let (plat, plon) = self.points[j];
                (j, haversine_distance_m(lat, lon, plat, plon))
            })
            .fold(None, |best: Option<(usize, f64)>, candidate| match best {
                Some(b) if b.1 <= candidate.1 => Some(b),
                _ => Some(candidate),
            });
        Ok(nearest)
    }

    fn collect_within(&self, lat: f64, lon: f64, origin: Option<CellIndex>) -> Vec<usize> {
        let candidates: Vec<usize> = match (&self.strategy, origin) {
            (Strategy::Cells { k, cells, .. }, Some(origin)) => {
                let mut found: Vec<usize> = origin
                    .grid_disk_safe(*k)
                    .filter_map(|cell| cells.get(&cell))
                    .flatten()
                    .copied()
                    .collect();
                found.sort_unstable();
                found.dedup();
                found
            }
            _ => (0..self.points.len()).collect(),
        };

        candidates
            .into_iter()
            .filter(|&j| {
                let (plat, plon) = self.points[j];
                haversine_distance_m(lat, lon, plat, plon) <= self.radius_m
            })
            .collect()
    }
}

/// Finest H3 resolution whose average edge is at least `radius_m`.
fn cell_resolution(radius_m: f64) -> Option<Resolution> {
    if radius_m > MAX_INDEXED_RADIUS_M {
        return None;
    }
    (0..=15u8)
        .rev()
        .filter_map(|level| Resolution::try_from(level).ok())
        .find(|resolution| resolution.edge_length_m() >= radius_m)
}

/// Ring count covering `radius_m` from any cell, with slack for the
/// distortion of H3 cell sizes across the globe.
fn ring_size(radius_m: f64, resolution: Resolution) -> u32 {
    let edge = resolution.edge_length_m();
    (2.0 * radius_m / edge).ceil() as u32 + 1
}

fn check_coordinates(lat: f64, lon: f64, index: usize) -> Result<LatLng, SpaceError> {
    LatLng::new(lat, lon).map_err(|e| SpaceError::InvalidCoordinates {
        index,
        reason: e.to_string(),
    })
}

fn to_cell(lat: f64, lon: f64, resolution: Resolution, index: usize) -> Result<CellIndex, SpaceError> {
    Ok(check_coordinates(lat, lon, index)?.to_cell(resolution))
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SpaceError {
    #[error("radius must be a positive number of meters, got {0}")]
    InvalidRadius(f64),

    #[error("invalid coordinates for point {index}: {reason}")]
    InvalidCoordinates { index: usize, reason: String },
}
