//! Tabular I/O for observation batches, tracks, labels and cluster tables.
//!
//! The encoding is picked from the file extension: `.csv` (header row plus
//! one record per row) or `.json` (an array of row objects). Lenient readers
//! keep going past bad records and report them with their row number;
//! strict readers fail on the first one.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::observation::{MalformedObservation, Observation, ObservationBatch, ObservationError, RawDetection};
use crate::roadwatch_cluster::{Cluster, ClusterLabel, LabeledObservation};
use crate::roadwatch_time::{PositionSample, PositionTrack, TrackError};

/// File encodings understood by the table readers and writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    Csv,
    Json,
}

impl TableFormat {
    pub fn from_path(path: &Path) -> Result<Self, TableError> {
        match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref() {
            Some("csv") => Ok(Self::Csv),
            Some("json") => Ok(Self::Json),
            _ => Err(TableError::UnsupportedFormat {
                path: path.to_path_buf(),
            }),
        }
    }
}

/// A row type with a fixed, ordered column list.
///
/// The column list must match the serialized field order; it is written as
/// the CSV header even when a table has no rows.
pub trait TableRow: Serialize {
    const COLUMNS: &'static [&'static str];
}

impl TableRow for Cluster {
    const COLUMNS: &'static [&'static str] = &[
        "cluster_id",
        "lat",
        "lon",
        "num_detections",
        "avg_confidence",
        "last_seen",
    ];
}

impl TableRow for Observation {
    const COLUMNS: &'static [&'static str] = &[
        "latitude",
        "longitude",
        "confidence",
        "timestamp",
        "source_id",
        "frame_index",
    ];
}

impl TableRow for RawDetection {
    const COLUMNS: &'static [&'static str] = &["source_id", "frame_index", "timestamp", "confidence"];
}

impl TableRow for PositionSample {
    const COLUMNS: &'static [&'static str] = &["timestamp", "latitude", "longitude"];
}

/// Output row of the labeled observation table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledRow {
    pub latitude: f64,
    pub longitude: f64,
    pub confidence: f64,
    #[serde(with = "crate::iso8601")]
    pub timestamp: DateTime<Utc>,
    pub source_id: String,
    #[serde(default)]
    pub frame_index: Option<u64>,
    pub cluster_id: ClusterLabel,
}

impl TableRow for LabeledRow {
    const COLUMNS: &'static [&'static str] = &[
        "latitude",
        "longitude",
        "confidence",
        "timestamp",
        "source_id",
        "frame_index",
        "cluster_id",
    ];
}

impl From<&LabeledObservation> for LabeledRow {
    fn from(labeled: &LabeledObservation) -> Self {
        let obs = &labeled.observation;
        Self {
            latitude: obs.latitude,
            longitude: obs.longitude,
            confidence: obs.confidence,
            timestamp: obs.timestamp,
            source_id: obs.source_id.clone(),
            frame_index: obs.frame_index,
            cluster_id: labeled.label,
        }
    }
}

// ============================================================================
// WRITING
// ============================================================================

/// Serialize `rows` into `writer`. `path` is only used for error messages.
pub fn write_rows<T: TableRow, W: Write>(
    writer: W,
    format: TableFormat,
    rows: &[T],
    path: &Path,
) -> Result<(), TableError> {
    match format {
        TableFormat::Csv => {
            let mut csv_writer = csv::WriterBuilder::new().has_headers(false).from_writer(writer);
            csv_writer
                .write_record(T::COLUMNS)
                .map_err(|e| TableError::csv(path, e))?;
            for row in rows {
                csv_writer.serialize(row).map_err(|e| TableError::csv(path, e))?;
            }
            csv_writer.flush().map_err(|e| TableError::io(path, e))
        }
        TableFormat::Json => {
            let mut writer = writer;
            serde_json::to_writer_pretty(&mut writer, rows).map_err(|e| TableError::json(path, e))?;
            writer.write_all(b"\n").map_err(|e| TableError::io(path, e))?;
            writer.flush().map_err(|e| TableError::io(path, e))
        }
    }
}

/// Create (or truncate) `path` and write `rows` to it.
pub fn write_table<T: TableRow>(path: &Path, rows: &[T]) -> Result<(), TableError> {
    let format = TableFormat::from_path(path)?;
    let file = File::create(path).map_err(|e| TableError::io(path, e))?;
    write_rows(BufWriter::new(file), format, rows, path)
}

pub fn write_observations(path: &Path, observations: &[Observation]) -> Result<(), TableError> {
    write_table(path, observations)
}

pub fn write_labeled(path: &Path, labeled: &[LabeledObservation]) -> Result<(), TableError> {
    let rows: Vec<LabeledRow> = labeled.iter().map(LabeledRow::from).collect();
    write_table(path, &rows)
}

pub fn write_clusters(path: &Path, clusters: &[Cluster]) -> Result<(), TableError> {
    write_table(path, clusters)
}

// ============================================================================
// READING
// ============================================================================

/// A record that could not be deserialized, with whatever identifying
/// fields could still be recovered from it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordFailure {
    pub row: usize,
    pub source_id: Option<String>,
    pub frame_index: Option<u64>,
    pub message: String,
}

impl From<RecordFailure> for MalformedObservation {
    fn from(failure: RecordFailure) -> Self {
        Self {
            row: failure.row,
            source_id: failure.source_id,
            frame_index: failure.frame_index,
            reason: ObservationError::Unparseable(failure.message),
        }
    }
}

/// Read every record, keeping per-record failures instead of aborting.
///
/// Only file-level problems (missing file, broken JSON document, I/O) fail
/// the whole read.
pub fn read_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<Result<T, RecordFailure>>, TableError> {
    match TableFormat::from_path(path)? {
        TableFormat::Csv => read_csv_records(path),
        TableFormat::Json => read_json_records(path),
    }
}

/// Read every record, failing on the first bad one.
pub fn read_rows<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, TableError> {
    read_records(path)?
        .into_iter()
        .map(|record| {
            record.map_err(|failure| TableError::Record {
                path: path.to_path_buf(),
                row: failure.row,
                message: failure.message,
            })
        })
        .collect()
}

fn read_csv_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<Result<T, RecordFailure>>, TableError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| TableError::csv(path, e))?;
    let headers = reader.headers().map_err(|e| TableError::csv(path, e))?.clone();

    let source_col = column(&headers, &["source_id", "video"]);
    let frame_col = column(&headers, &["frame_index", "frame"]);

    let mut records = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = match record {
            Ok(record) => record,
            Err(e) if e.is_io_error() => return Err(TableError::csv(path, e)),
            Err(e) => {
                records.push(Err(RecordFailure {
                    row,
                    source_id: None,
                    frame_index: None,
                    message: e.to_string(),
                }));
                continue;
            }
        };

        records.push(record.deserialize::<T>(Some(&headers)).map_err(|e| RecordFailure {
            row,
            source_id: source_col.and_then(|c| record.get(c)).map(str::to_string),
            frame_index: frame_col.and_then(|c| record.get(c)).and_then(|v| v.parse().ok()),
            message: e.to_string(),
        }));
    }
    Ok(records)
}

fn column(headers: &csv::StringRecord, names: &[&str]) -> Option<usize> {
    headers.iter().position(|h| names.contains(&h))
}

fn read_json_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<Result<T, RecordFailure>>, TableError> {
    let file = File::open(path).map_err(|e| TableError::io(path, e))?;
    let values: Vec<serde_json::Value> =
        serde_json::from_reader(BufReader::new(file)).map_err(|e| TableError::json(path, e))?;

    Ok(values
        .into_iter()
        .enumerate()
        .map(|(row, value)| {
            let source_id = ["source_id", "video"]
                .iter()
                .find_map(|k| value.get(*k).and_then(|v| v.as_str()))
                .map(str::to_string);
            let frame_index = ["frame_index", "frame"]
                .iter()
                .find_map(|k| value.get(*k).and_then(|v| v.as_u64()));
            serde_json::from_value::<T>(value).map_err(|e| RecordFailure {
                row,
                source_id,
                frame_index,
                message: e.to_string(),
            })
        })
        .collect())
}

/// Read an observation batch; bad records are collected, not fatal.
pub fn read_observations(path: &Path) -> Result<ObservationBatch, TableError> {
    let records = read_records::<Observation>(path)?;
    Ok(ObservationBatch::collect(
        records.into_iter().map(|r| r.map_err(MalformedObservation::from)),
    ))
}

/// Read raw (unlocated) detections; unparseable records are returned apart.
pub fn read_detections(path: &Path) -> Result<(Vec<RawDetection>, Vec<MalformedObservation>), TableError> {
    let mut detections = Vec::new();
    let mut rejected = Vec::new();
    for record in read_records::<RawDetection>(path)? {
        match record {
            Ok(detection) => detections.push(detection),
            Err(failure) => {
                let malformed = MalformedObservation::from(failure);
                malformed.log();
                rejected.push(malformed);
            }
        }
    }
    Ok((detections, rejected))
}

/// Read a position track. Any bad record or ordering problem is fatal.
pub fn read_track(path: &Path) -> Result<PositionTrack, TableError> {
    let samples = read_rows::<PositionSample>(path)?;
    PositionTrack::new(samples).map_err(|source| TableError::Track {
        path: path.to_path_buf(),
        source,
    })
}

/// Read a cluster table strictly.
pub fn read_clusters(path: &Path) -> Result<Vec<Cluster>, TableError> {
    read_rows(path)
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum TableError {
    #[error("unsupported table format for {path}: expected a .csv or .json extension")]
    UnsupportedFormat { path: PathBuf },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("JSON error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path}: row {row}: {message}")]
    Record {
        path: PathBuf,
        row: usize,
        message: String,
    },

    #[error("{path}: {source}")]
    Track {
        path: PathBuf,
        #[source]
        source: TrackError,
    },
}

impl TableError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn csv(path: &Path, source: csv::Error) -> Self {
        Self::Csv {
            path: path.to_path_buf(),
            source,
        }
    }

    fn json(path: &Path, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.to_path_buf(),
            source,
        }
    }
}
