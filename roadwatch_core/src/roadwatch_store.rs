//! The "STORE" Engine - Persistent Cluster Table
//!
//! The store is the cumulative set of cluster summaries across runs. The
//! merger is its only writer:
//! - **Read-modify-write** of the whole table, once per merge
//! - **Exclusive lock** (advisory lock on `<store>.lock`) held for the duration of a merge
//! - **Atomic publish**: temp file in the same directory, fsync, rename
//!
//! A store that cannot be read is reported as corrupt and never overwritten.

use fd_lock::{RwLock, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::roadwatch_cluster::Cluster;
use crate::roadwatch_space::{NeighborIndex, SpaceError};
use crate::table::{self, TableError, TableFormat};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// How a batch of new clusters is reconciled with the stored ones.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum MergePolicy {
    /// Add every new cluster as a new row; full history, no deduplication
    #[default]
    Append,

    /// Fold each new cluster into the nearest stored cluster within
    /// `radius_meters`; unmatched clusters are added with fresh ids
    MatchAndUpdate { radius_meters: f64 },
}

impl MergePolicy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Append => "append",
            Self::MatchAndUpdate { .. } => "match_and_update",
        }
    }
}

/// What a merge did.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeReport {
    /// The full store as published
    pub rows: Vec<Cluster>,

    /// False when the store did not exist before this merge
    pub existed: bool,

    /// New clusters written as new rows
    pub appended: usize,

    /// New clusters folded into existing rows
    pub updated: usize,
}

// ============================================================================
// STORE
// ============================================================================

/// Read-only access to a persisted cluster table.
pub struct ClusterStore;

impl ClusterStore {
    /// Load the store at `path`. `Ok(None)` if there is no store yet.
    pub fn load(path: &Path) -> Result<Option<Vec<Cluster>>, StoreError> {
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        if metadata.len() == 0 {
            return Err(StoreError::corrupt(path, "store file is empty"));
        }

        let rows = table::read_clusters(path).map_err(|e| match e {
            TableError::UnsupportedFormat { .. } => StoreError::Table(e),
            TableError::Io { source, .. } => StoreError::Read {
                path: path.to_path_buf(),
                source,
            },
            other => StoreError::corrupt(path, other.to_string()),
        })?;

        for (row, cluster) in rows.iter().enumerate() {
            check_row(cluster).map_err(|reason| StoreError::corrupt(path, format!("row {row}: {reason}")))?;
        }
        Ok(Some(rows))
    }
}

fn check_row(cluster: &Cluster) -> Result<(), String> {
    if !cluster.centroid_lat.is_finite() || !(-90.0..=90.0).contains(&cluster.centroid_lat) {
        return Err(format!("latitude {} out of range", cluster.centroid_lat));
    }
    if !cluster.centroid_lon.is_finite() || !(-180.0..=180.0).contains(&cluster.centroid_lon) {
        return Err(format!("longitude {} out of range", cluster.centroid_lon));
    }
    if !cluster.mean_confidence.is_finite() || !(0.0..=1.0).contains(&cluster.mean_confidence) {
        return Err(format!("avg_confidence {} outside [0, 1]", cluster.mean_confidence));
    }
    Ok(())
}

/// Sole writer of a cluster store.
#[derive(Debug, Clone)]
pub struct StoreMerger {
    path: PathBuf,
    policy: MergePolicy,
}

impl StoreMerger {
    pub fn new(path: impl Into<PathBuf>, policy: MergePolicy) -> Result<Self, StoreError> {
        let path = path.into();
        TableFormat::from_path(&path)?;
        if let MergePolicy::MatchAndUpdate { radius_meters } = policy {
            if !radius_meters.is_finite() || radius_meters <= 0.0 {
                return Err(StoreError::Space(SpaceError::InvalidRadius(radius_meters)));
            }
        }
        Ok(Self { path, policy })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> MergePolicy {
        self.policy
    }

    /// Reconcile `new_clusters` with the store and publish the result.
    ///
    /// On any error the previous store is left exactly as it was.
    pub fn merge(&self, new_clusters: &[Cluster]) -> Result<MergeReport, StoreError> {
        let mut lock = StoreLock::open(&self.path)?;
        let _guard = lock.try_acquire()?;

        let existing = ClusterStore::load(&self.path)?;
        let existed = existing.is_some();
        let existing = existing.unwrap_or_default();
        let before = existing.len();

        let report = match self.policy {
            MergePolicy::Append => append(existing, new_clusters, existed),
            MergePolicy::MatchAndUpdate { radius_meters } => {
                match_and_update(existing, new_clusters, radius_meters, existed)?
            }
        };

        let format = TableFormat::from_path(&self.path)?;
        let path = self.path.clone();
        publish(&self.path, |file| {
            table::write_rows(file, format, &report.rows, &path).map_err(|e| match e {
                TableError::Io { source, .. } => source,
                other => io::Error::other(other.to_string()),
            })
        })?;

        info!(
            store = %self.path.display(),
            policy = self.policy.name(),
            before,
            after = report.rows.len(),
            appended = report.appended,
            updated = report.updated,
            "cluster store merged"
        );
        Ok(report)
    }
}

/// One-shot form of [`StoreMerger::merge`].
pub fn merge(store_path: &Path, new_clusters: &[Cluster], policy: MergePolicy) -> Result<MergeReport, StoreError> {
    StoreMerger::new(store_path, policy)?.merge(new_clusters)
}

fn append(mut rows: Vec<Cluster>, new_clusters: &[Cluster], existed: bool) -> MergeReport {
    rows.extend_from_slice(new_clusters);
    MergeReport {
        rows,
        existed,
        appended: new_clusters.len(),
        updated: 0,
    }
}

/// Nearest-centroid reconciliation.
///
/// A match keeps the stored id and centroid, adds the member counts, takes
/// the count-weighted mean confidence and the later `last_seen`. New
/// clusters only match rows that existed before this merge.
fn match_and_update(
    mut rows: Vec<Cluster>,
    new_clusters: &[Cluster],
    radius_meters: f64,
    existed: bool,
) -> Result<MergeReport, StoreError> {
    let points = rows.iter().map(|c| (c.centroid_lat, c.centroid_lon)).collect();
    let index = NeighborIndex::build(points, radius_meters)?;
    // `None` once the id space is used up
    let mut next_id = match rows.iter().map(|c| c.cluster_id).max() {
        Some(max) => max.checked_add(1),
        None => Some(0),
    };

    let mut appended = 0;
    let mut updated = 0;
    let mut fresh = Vec::new();

    for cluster in new_clusters {
        match index.nearest_within(cluster.centroid_lat, cluster.centroid_lon)? {
            Some((row, distance)) => {
                let stored = &mut rows[row];
                debug!(
                    stored_id = stored.cluster_id,
                    new_id = cluster.cluster_id,
                    distance_m = distance,
                    "matched cluster"
                );
                fold_into(stored, cluster);
                updated += 1;
            }
            None => {
                let id = next_id.ok_or(StoreError::IdsExhausted)?;
                next_id = id.checked_add(1);
                let mut added = cluster.clone();
                added.cluster_id = id;
                fresh.push(added);
                appended += 1;
            }
        }
    }

    rows.extend(fresh);
    Ok(MergeReport {
        rows,
        existed,
        appended,
        updated,
    })
}

fn fold_into(stored: &mut Cluster, update: &Cluster) {
    let total = stored.member_count + update.member_count;
    if total > 0 {
        stored.mean_confidence = (stored.mean_confidence * stored.member_count as f64
            + update.mean_confidence * update.member_count as f64)
            / total as f64;
    }
    stored.member_count = total;
    stored.last_seen = stored.last_seen.max(update.last_seen);
}

// ============================================================================
// LOCKING & ATOMIC PUBLISH
// ============================================================================

/// Exclusive lock on a store, backed by an advisory lock on `<store>.lock`.
///
/// The lock file is left in place between merges; only the OS lock on it
/// matters. The OS drops that lock when the holder exits, so a merge that
/// was killed mid-way never blocks later ones.
pub struct StoreLock {
    store_path: PathBuf,
    file: RwLock<File>,
}

impl StoreLock {
    /// Open (creating if needed) the lock file for `store_path`.
    pub fn open(store_path: &Path) -> Result<Self, StoreError> {
        let mut name = store_path.as_os_str().to_owned();
        name.push(".lock");

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(PathBuf::from(name))
            .map_err(|source| StoreError::WriteFailure {
                path: store_path.to_path_buf(),
                source,
            })?;

        Ok(Self {
            store_path: store_path.to_path_buf(),
            file: RwLock::new(file),
        })
    }

    /// Take the lock without waiting; `StoreError::Locked` if another merge holds it.
    pub fn try_acquire(&mut self) -> Result<RwLockWriteGuard<'_, File>, StoreError> {
        let store_path = &self.store_path;
        self.file.try_write().map_err(|source| {
            if source.kind() == io::ErrorKind::WouldBlock {
                StoreError::Locked {
                    path: store_path.clone(),
                }
            } else {
                StoreError::WriteFailure {
                    path: store_path.clone(),
                    source,
                }
            }
        })
    }
}

/// Replace `path` with whatever `write` produces, all or nothing.
///
/// The content goes to a temporary file next to `path`, is synced, and is
/// then renamed over `path`. If `write` or any step fails, the temporary
/// file is removed and `path` is untouched.
pub(crate) fn publish<F>(path: &Path, write: F) -> Result<(), StoreError>
where
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let failure = |source| StoreError::WriteFailure {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut temp = tempfile::Builder::new()
        .prefix(".roadwatch-store-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(failure)?;

    write(temp.as_file_mut()).map_err(failure)?;
    temp.as_file_mut().flush().map_err(failure)?;
    temp.as_file().sync_all().map_err(failure)?;
    temp.persist(path).map_err(|e| failure(e.error))?;
    Ok(())
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cluster store {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("failed to write cluster store {path}: {source}")]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cluster store {path} is locked by another merge")]
    Locked { path: PathBuf },

    #[error("failed to read cluster store {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no cluster id left for a new row: the store already uses id {}", u64::MAX)]
    IdsExhausted,

    #[error(transparent)]
    Table(#[from] TableError),

    #[error("spatial index error: {0}")]
    Space(#[from] SpaceError),
}

impl StoreError {
    fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use tempfile::TempDir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn cluster(id: u64, lat: f64, lon: f64, count: usize, confidence: f64) -> Cluster {
        Cluster {
            cluster_id: id,
            centroid_lat: lat,
            centroid_lon: lon,
            member_count: count,
            mean_confidence: confidence,
            last_seen: t0(),
        }
    }

    fn seeded_store(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        merge(
            &path,
            &[cluster(0, 10.0, 20.0, 8, 0.8), cluster(1, 10.5, 20.5, 9, 0.7)],
            MergePolicy::Append,
        )
        .unwrap();
        path
    }

    #[test]
    fn test_missing_store_becomes_new_clusters() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.csv");
        assert_eq!(ClusterStore::load(&path).unwrap(), None);

        let new = vec![cluster(0, 10.0, 20.0, 8, 0.8)];
        let report = merge(&path, &new, MergePolicy::Append).unwrap();
        assert!(!report.existed);
        assert_eq!(report.rows, new);
        assert_eq!(ClusterStore::load(&path).unwrap(), Some(new));
    }

    #[test]
    fn test_append_adds_rows_and_keeps_originals() {
        let dir = TempDir::new().unwrap();
        for name in ["store.csv", "store.json"] {
            let path = seeded_store(&dir, name);
            let original = ClusterStore::load(&path).unwrap().unwrap();

            let new = vec![
                cluster(0, 10.0, 20.0, 7, 0.9),
                cluster(1, 11.0, 21.0, 7, 0.6),
                cluster(2, 12.0, 22.0, 7, 0.6),
            ];
            let report = merge(&path, &new, MergePolicy::Append).unwrap();
            assert!(report.existed);
            assert_eq!(report.appended, 3);

            let stored = ClusterStore::load(&path).unwrap().unwrap();
            assert_eq!(stored.len(), original.len() + new.len());
            assert_eq!(&stored[..original.len()], &original[..]);
            assert_eq!(&stored[original.len()..], &new[..]);
        }
    }

    #[test]
    fn test_append_with_nothing_new_rewrites_same_rows() {
        let dir = TempDir::new().unwrap();
        let path = seeded_store(&dir, "store.csv");
        let report = merge(&path, &[], MergePolicy::Append).unwrap();
        assert_eq!(report.rows.len(), 2);
        assert_eq!(ClusterStore::load(&path).unwrap().unwrap().len(), 2);
    }

    #[test]
    fn test_empty_merge_creates_readable_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.csv");
        merge(&path, &[], MergePolicy::Append).unwrap();
        assert_eq!(ClusterStore::load(&path).unwrap(), Some(vec![]));
    }

    #[test]
    fn test_match_and_update() {
        let dir = TempDir::new().unwrap();
        let path = seeded_store(&dir, "store.csv");

        let mut near = cluster(0, 10.0005, 20.0, 2, 0.5);
        near.last_seen = t0() + Duration::days(1);
        let far = cluster(1, 40.0, -3.0, 7, 0.95);

        let policy = MergePolicy::MatchAndUpdate { radius_meters: 200.0 };
        let report = merge(&path, &[near, far], policy).unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.appended, 1);

        let stored = ClusterStore::load(&path).unwrap().unwrap();
        assert_eq!(stored.len(), 3);

        let matched = &stored[0];
        assert_eq!(matched.cluster_id, 0);
        assert_relative_eq!(matched.centroid_lat, 10.0);
        assert_eq!(matched.member_count, 10);
        assert_relative_eq!(matched.mean_confidence, (8.0 * 0.8 + 2.0 * 0.5) / 10.0, epsilon = 1e-12);
        assert_eq!(matched.last_seen, t0() + Duration::days(1));

        assert_eq!(stored[1], cluster(1, 10.5, 20.5, 9, 0.7));
        assert_eq!(stored[2].cluster_id, 2);
        assert_relative_eq!(stored[2].centroid_lat, 40.0);
    }

    #[test]
    fn test_match_prefers_nearest_row() {
        let rows = vec![cluster(0, 10.0, 20.0, 5, 0.5), cluster(1, 10.0008, 20.0, 5, 0.5)];
        let new = vec![cluster(0, 10.0007, 20.0, 5, 1.0)];
        let report = match_and_update(rows, &new, 500.0, true).unwrap();
        assert_eq!(report.rows[0].member_count, 5);
        assert_eq!(report.rows[1].member_count, 10);
    }

    #[test]
    fn test_corrupt_store_fails_loudly_and_is_kept() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.csv");
        let garbage = "cluster_id,lat,lon,num_detections,avg_confidence,last_seen\n0,10.0,not-a-number,3,0.5,2024\n";
        fs::write(&path, garbage).unwrap();

        let err = merge(&path, &[cluster(0, 1.0, 1.0, 3, 0.9)], MergePolicy::Append).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }), "{err}");
        assert_eq!(fs::read_to_string(&path).unwrap(), garbage);
    }

    #[test]
    fn test_zero_byte_store_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, "").unwrap();
        assert!(matches!(ClusterStore::load(&path), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_out_of_range_row_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.csv");
        fs::write(
            &path,
            "cluster_id,lat,lon,num_detections,avg_confidence,last_seen\n0,10.0,20.0,3,1.5,2024-05-01T12:00:00Z\n",
        )
        .unwrap();
        let err = ClusterStore::load(&path).unwrap_err();
        assert!(err.to_string().contains("row 0"), "{err}");
    }

    #[test]
    fn test_legacy_naive_last_seen_is_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.csv");
        fs::write(
            &path,
            "cluster_id,lat,lon,num_detections,avg_confidence,last_seen\n0,10.0,20.0,3,0.5,2024-05-01T12:00:00.000001\n",
        )
        .unwrap();
        let rows = ClusterStore::load(&path).unwrap().unwrap();
        assert_eq!(rows[0].last_seen.timestamp(), t0().timestamp());
    }

    #[test]
    fn test_failed_write_leaves_store_intact() {
        let dir = TempDir::new().unwrap();
        let path = seeded_store(&dir, "store.csv");
        let before = fs::read_to_string(&path).unwrap();

        let result = publish(&path, |file| {
            file.write_all(b"cluster_id,lat,lon\n0,1.0")?;
            Err(io::Error::other("disk full"))
        });
        assert!(matches!(result, Err(StoreError::WriteFailure { .. })));

        assert_eq!(fs::read_to_string(&path).unwrap(), before);
        assert_eq!(ClusterStore::load(&path).unwrap().unwrap().len(), 2);

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_concurrent_merge_is_refused() {
        let dir = TempDir::new().unwrap();
        let path = seeded_store(&dir, "store.csv");

        let mut lock = StoreLock::open(&path).unwrap();
        let held = lock.try_acquire().unwrap();
        let err = merge(&path, &[cluster(0, 1.0, 1.0, 3, 0.9)], MergePolicy::Append).unwrap_err();
        assert!(matches!(err, StoreError::Locked { .. }));
        drop(held);

        assert!(merge(&path, &[cluster(0, 1.0, 1.0, 3, 0.9)], MergePolicy::Append).is_ok());
        assert_eq!(ClusterStore::load(&path).unwrap().unwrap().len(), 3);
    }

    #[test]
    fn test_abandoned_lock_file_does_not_block_merges() {
        let dir = TempDir::new().unwrap();
        let path = seeded_store(&dir, "store.csv");
        fs::write(dir.path().join("store.csv.lock"), "999999999\n").unwrap();

        for _ in 0..3 {
            merge(&path, &[cluster(0, 1.0, 1.0, 3, 0.9)], MergePolicy::Append).unwrap();
        }
        assert_eq!(ClusterStore::load(&path).unwrap().unwrap().len(), 5);
    }

    #[test]
    fn test_last_cluster_id_is_not_reused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.csv");
        fs::write(
            &path,
            "cluster_id,lat,lon,num_detections,avg_confidence,last_seen\n\
             18446744073709551615,10.0,20.0,8,0.8,2024-05-01T12:00:00Z\n",
        )
        .unwrap();
        let before = fs::read_to_string(&path).unwrap();
        let policy = MergePolicy::MatchAndUpdate { radius_meters: 100.0 };

        let err = merge(&path, &[cluster(0, 40.0, -3.0, 7, 0.9)], policy).unwrap_err();
        assert!(matches!(err, StoreError::IdsExhausted), "{err}");
        assert_eq!(fs::read_to_string(&path).unwrap(), before);

        // Updates in place still need no new id
        let report = merge(&path, &[cluster(0, 10.0, 20.0, 2, 0.8)], policy).unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.rows[0].cluster_id, u64::MAX);
        assert_eq!(report.rows[0].member_count, 10);
    }

    #[test]
    fn test_fresh_ids_stop_at_the_top_of_the_id_space() {
        let rows = vec![cluster(u64::MAX - 1, 10.0, 20.0, 5, 0.5)];
        let one = vec![cluster(0, 40.0, -3.0, 5, 0.5)];
        let report = match_and_update(rows.clone(), &one, 100.0, true).unwrap();
        assert_eq!(report.rows[1].cluster_id, u64::MAX);

        let two = vec![cluster(0, 40.0, -3.0, 5, 0.5), cluster(1, -20.0, 60.0, 5, 0.5)];
        assert!(matches!(
            match_and_update(rows, &two, 100.0, true),
            Err(StoreError::IdsExhausted)
        ));
    }

    #[test]
    fn test_invalid_configuration() {
        assert!(matches!(
            StoreMerger::new("store.txt", MergePolicy::Append),
            Err(StoreError::Table(TableError::UnsupportedFormat { .. }))
        ));
        assert!(matches!(
            StoreMerger::new("store.csv", MergePolicy::MatchAndUpdate { radius_meters: 0.0 }),
            Err(StoreError::Space(_))
        ));
    }

    #[test]
    fn test_policy_serde() {
        let policy: MergePolicy = serde_json::from_str(r#"{"policy":"append"}"#).unwrap();
        assert_eq!(policy, MergePolicy::Append);
        let policy: MergePolicy =
            serde_json::from_str(r#"{"policy":"match_and_update","radius_meters":250.0}"#).unwrap();
        assert_eq!(policy, MergePolicy::MatchAndUpdate { radius_meters: 250.0 });
    }
}
