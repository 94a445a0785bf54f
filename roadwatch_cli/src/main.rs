//! RoadWatch batch CLI
//!
//! Locate detections on a position track, cluster them into defects and
//! merge the result into the persistent cluster store.

mod config;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Args, Parser, Subcommand};
use config::{FileConfig, Overrides, PolicyName, RunSettings};
use roadwatch_core::table;
use roadwatch_core::{iso8601, locate, ClusterEngine, ClusterStore, FrameClock, MalformedObservation, StoreMerger};
use roadwatch_env::SystemClock;
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Road defect mapping from geotagged detections
#[derive(Parser, Debug)]
#[command(name = "roadwatch", version)]
#[command(about = "Cluster geotagged pothole detections into a persistent defect map", long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Cluster an observation batch and merge the clusters into the store
    Cluster(ClusterArgs),
    /// Attach track coordinates to raw detections
    Locate(LocateArgs),
    /// Print the track fix matched to every video frame
    Align(AlignArgs),
    /// Show the contents of a cluster store
    Store(StoreArgs),
}

#[derive(Args, Debug)]
struct ClusterArgs {
    /// Observation batch (.csv or .json)
    #[arg(short, long)]
    observations: PathBuf,

    /// TOML file with [cluster] and [store] settings
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Minimum neighbourhood size for a cluster (required here or in the config file)
    #[arg(long)]
    min_samples: Option<usize>,

    /// Observations at or below this confidence are discarded [default: 0.5]
    #[arg(long)]
    confidence_threshold: Option<f64>,

    /// Neighbourhood radius in meters [default: 400]
    #[arg(long)]
    radius_meters: Option<f64>,

    /// Write the labeled observations here
    #[arg(long)]
    labeled_out: Option<PathBuf>,

    /// Write this run's cluster summaries here
    #[arg(long)]
    clusters_out: Option<PathBuf>,

    /// Cluster store to merge into
    #[arg(long)]
    store: Option<PathBuf>,

    /// How new clusters are merged into the store [default: append]
    #[arg(long, value_enum)]
    merge_policy: Option<PolicyName>,

    /// Match radius for match-and-update [default: --radius-meters]
    #[arg(long)]
    match_radius_meters: Option<f64>,

    /// JSON summary on stdout
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct LocateArgs {
    /// Position track (.csv or .json with timestamp, latitude, longitude)
    #[arg(short, long)]
    track: PathBuf,

    /// Raw detections (source_id, frame_index, timestamp, confidence)
    #[arg(short, long)]
    detections: PathBuf,

    /// Output observation batch
    #[arg(short, long)]
    out: PathBuf,

    /// Flag matches further than this many seconds from their fix
    #[arg(long, value_parser = parse_seconds)]
    max_age: Option<Duration>,
}

#[derive(Args, Debug)]
struct AlignArgs {
    /// Position track (.csv or .json)
    #[arg(short, long)]
    track: PathBuf,

    /// Video frame rate
    #[arg(long)]
    fps: f64,

    /// Number of frames to align
    #[arg(long)]
    frames: u64,

    /// Time of frame 0; repeat once per video checked against the track
    /// [default: one video starting at the first track fix]
    #[arg(long = "start", value_parser = parse_timestamp)]
    starts: Vec<DateTime<Utc>>,

    /// Flag matches further than this many seconds from their fix
    #[arg(long, value_parser = parse_seconds)]
    max_age: Option<Duration>,

    /// JSON output
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct StoreArgs {
    /// Cluster store (.csv or .json)
    #[arg(long = "store")]
    path: PathBuf,

    /// JSON output
    #[arg(long)]
    json: bool,
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, String> {
    iso8601::parse(text).map_err(|e| format!("invalid ISO-8601 timestamp: {e}"))
}

fn parse_seconds(text: &str) -> Result<Duration, String> {
    let secs: f64 = text.parse().map_err(|e| format!("invalid number of seconds: {e}"))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("seconds must be a non-negative number, got {secs}"));
    }
    Ok(Duration::milliseconds((secs * 1000.0).round() as i64))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging (stderr, so stdout stays machine-readable)
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to set tracing subscriber: {e}");
    }

    let result = match cli.command {
        Command::Cluster(args) => run_cluster(args),
        Command::Locate(args) => run_locate(args),
        Command::Align(args) => run_align(args),
        Command::Store(args) => run_store(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run_cluster(args: ClusterArgs) -> Result<()> {
    let file = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let settings = RunSettings::resolve(
        file,
        Overrides {
            confidence_threshold: args.confidence_threshold,
            radius_meters: args.radius_meters,
            min_samples: args.min_samples,
            store: args.store.clone(),
            merge_policy: args.merge_policy,
            match_radius_meters: args.match_radius_meters,
        },
    )?;

    // Fail on an unusable store path before doing any work
    let merger = settings
        .store
        .as_ref()
        .map(|path| StoreMerger::new(path, settings.policy))
        .transpose()?;

    let batch = table::read_observations(&args.observations)
        .with_context(|| format!("failed to read observations from {}", args.observations.display()))?;

    let engine = ClusterEngine::new(settings.cluster, SystemClock::new())?;
    let outcome = engine
        .run(&batch.observations)
        .with_context(|| format!("clustering failed for {}", args.observations.display()))?;

    if let Some(path) = &args.labeled_out {
        table::write_labeled(path, &outcome.labeled)?;
        info!("Wrote {} labeled observations to {}", outcome.labeled.len(), path.display());
    }
    if let Some(path) = &args.clusters_out {
        table::write_clusters(path, &outcome.clusters)?;
        info!("Wrote {} clusters to {}", outcome.clusters.len(), path.display());
    }

    let report = match &merger {
        Some(merger) => Some(
            merger
                .merge(&outcome.clusters)
                .with_context(|| format!("merge into {} failed", merger.path().display()))?,
        ),
        None => None,
    };

    let rejected: Vec<&MalformedObservation> = batch.rejected.iter().chain(&outcome.rejected).collect();

    if args.json {
        let summary = json!({
            "status": outcome.status(),
            "observations": batch.observations.len() + batch.rejected.len(),
            "rejected": rejected.iter().map(|r| json!({
                "row": r.row,
                "source_id": r.source_id,
                "frame_index": r.frame_index,
                "reason": r.reason.to_string(),
            })).collect::<Vec<_>>(),
            "filtered_out": outcome.filtered_out,
            "retained": outcome.labeled.len(),
            "noise": outcome.noise_count(),
            "clusters": outcome.clusters,
            "store": report.as_ref().zip(merger.as_ref()).map(|(r, m)| json!({
                "path": m.path().display().to_string(),
                "policy": m.policy().name(),
                "rows": r.rows.len(),
                "appended": r.appended,
                "updated": r.updated,
            })),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        if outcome.is_empty() {
            info!("No observations above the confidence threshold; no clusters produced");
        } else {
            info!(
                "Clustered {} observations into {} clusters ({} noise)",
                outcome.labeled.len(),
                outcome.clusters.len(),
                outcome.noise_count()
            );
        }
        if !rejected.is_empty() {
            warn!("{} malformed observations were skipped", rejected.len());
        }
        if let (Some(report), Some(merger)) = (&report, &merger) {
            info!(
                "Store {} now holds {} clusters ({} appended, {} updated)",
                merger.path().display(),
                report.rows.len(),
                report.appended,
                report.updated
            );
        }
    }

    Ok(())
}

fn run_locate(args: LocateArgs) -> Result<()> {
    let track = table::read_track(&args.track)?;
    let (detections, mut rejected) = table::read_detections(&args.detections)?;

    let outcome = locate(&track, &detections, args.max_age);
    rejected.extend(outcome.rejected);

    table::write_observations(&args.out, &outcome.observations)?;
    info!(
        "Located {} detections ({} rejected, {} stale) -> {}",
        outcome.observations.len(),
        rejected.len(),
        outcome.stale,
        args.out.display()
    );
    Ok(())
}

fn run_align(args: AlignArgs) -> Result<()> {
    let track = table::read_track(&args.track)?;
    let clocks = if args.starts.is_empty() {
        vec![FrameClock::anchored(&track, args.fps)?]
    } else {
        args.starts
            .iter()
            .map(|&start| FrameClock::new(start, args.fps))
            .collect::<Result<Vec<_>, _>>()?
    };

    let mut rows = Vec::new();
    let mut stale = 0usize;
    for (video, clock) in clocks.iter().enumerate() {
        for frame in 0..args.frames {
            let timestamp = clock.timestamp(frame);
            let alignment = track.align(timestamp);
            let is_stale = args.max_age.is_some_and(|max| alignment.is_stale(max));
            if is_stale {
                stale += 1;
            }

            if args.json {
                rows.push(json!({
                    "video": video,
                    "frame": frame,
                    "timestamp": iso8601::format(&timestamp),
                    "latitude": alignment.sample.latitude,
                    "longitude": alignment.sample.longitude,
                    "age_ms": alignment.age.num_milliseconds(),
                    "stale": is_stale,
                }));
            } else {
                println!(
                    "{video}\t{frame}\t{}\t{:.6}\t{:.6}\t{}ms{}",
                    iso8601::format(&timestamp),
                    alignment.sample.latitude,
                    alignment.sample.longitude,
                    alignment.age.num_milliseconds(),
                    if is_stale { "\tSTALE" } else { "" }
                );
            }
        }
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    }
    if stale > 0 {
        warn!(
            "{stale} of {} frames matched a stale fix",
            args.frames * clocks.len() as u64
        );
    }
    Ok(())
}

fn run_store(args: StoreArgs) -> Result<()> {
    let Some(rows) = ClusterStore::load(&args.path)? else {
        bail!("no cluster store at {}", args.path.display());
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        println!("{} clusters in {}", rows.len(), args.path.display());
        for c in &rows {
            println!(
                "{}\t{:.6}\t{:.6}\t{}\t{:.3}\t{}",
                c.cluster_id,
                c.centroid_lat,
                c.centroid_lon,
                c.member_count,
                c.mean_confidence,
                iso8601::format(&c.last_seen)
            );
        }
    }
    Ok(())
}
