//! Run settings: optional TOML file, overridden by command-line flags.
//!
//! ```toml
//! [cluster]
//! confidence_threshold = 0.5
//! radius_meters = 400.0
//! min_samples = 7
//!
//! [store]
//! path = "output/clusters.csv"
//! merge_policy = "match_and_update"
//! match_radius_meters = 50.0
//! ```

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use roadwatch_core::{ClusterConfig, MergePolicy};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub cluster: ClusterSection,
    pub store: StoreSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterSection {
    pub confidence_threshold: Option<f64>,
    pub radius_meters: Option<f64>,
    pub min_samples: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSection {
    pub path: Option<PathBuf>,
    pub merge_policy: Option<PolicyName>,
    pub match_radius_meters: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum PolicyName {
    Append,
    MatchAndUpdate,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("invalid config file {}", path.display()))
    }
}

/// Values given on the command line; `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub confidence_threshold: Option<f64>,
    pub radius_meters: Option<f64>,
    pub min_samples: Option<usize>,
    pub store: Option<PathBuf>,
    pub merge_policy: Option<PolicyName>,
    pub match_radius_meters: Option<f64>,
}

/// Fully resolved settings for a `cluster` run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub cluster: ClusterConfig,
    pub store: Option<PathBuf>,
    pub policy: MergePolicy,
}

impl RunSettings {
    pub fn resolve(file: FileConfig, flags: Overrides) -> Result<Self> {
        let Some(min_samples) = flags.min_samples.or(file.cluster.min_samples) else {
            bail!("min_samples is required: pass --min-samples or set [cluster].min_samples in the config file");
        };

        let mut cluster = ClusterConfig::new(min_samples);
        if let Some(threshold) = flags.confidence_threshold.or(file.cluster.confidence_threshold) {
            cluster = cluster.with_confidence_threshold(threshold);
        }
        if let Some(radius) = flags.radius_meters.or(file.cluster.radius_meters) {
            cluster = cluster.with_radius_meters(radius);
        }
        cluster.validate()?;

        let policy = match flags.merge_policy.or(file.store.merge_policy).unwrap_or(PolicyName::Append) {
            PolicyName::Append => MergePolicy::Append,
            PolicyName::MatchAndUpdate => MergePolicy::MatchAndUpdate {
                radius_meters: flags
                    .match_radius_meters
                    .or(file.store.match_radius_meters)
                    .unwrap_or(cluster.radius_meters),
            },
        };

        Ok(Self {
            cluster,
            store: flags.store.or(file.store.path),
            policy,
        })
    }
}
