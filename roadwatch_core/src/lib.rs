//! RoadWatch Core - Road Defect Localisation from Dashcam Detections
//!
//! Turns repeated, noisy pothole detections into a stable map of defects:
//! 1. **Time**: place each detection at the nearest fix of a position track
//! 2. **Space**: great-circle radius queries over an H3-sharded index
//! 3. **Cluster**: DBSCAN grouping into per-run defect summaries
//! 4. **Store**: atomic, locked merging of summaries into a persistent table

pub mod iso8601;
pub mod observation;
pub mod roadwatch_cluster;
pub mod roadwatch_space;
pub mod roadwatch_store;
pub mod roadwatch_time;
pub mod table;

// Re-export key types for convenience
pub use observation::{MalformedObservation, Observation, ObservationBatch, ObservationError, RawDetection};
pub use roadwatch_cluster::{
    cluster, BatchStatus, Cluster, ClusterConfig, ClusterEngine, ClusterError, ClusterLabel, ClusterOutcome,
    LabeledObservation,
};
pub use roadwatch_space::{haversine_distance_m, NeighborIndex, SpaceError, EARTH_MEAN_RADIUS_M};
pub use roadwatch_store::{merge, ClusterStore, MergePolicy, MergeReport, StoreError, StoreMerger};
pub use roadwatch_time::{closest_sample, locate, Alignment, FrameClock, PositionSample, PositionTrack, TrackError};
pub use table::{TableError, TableFormat};
