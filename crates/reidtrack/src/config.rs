use crate::*;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Parameters of the track lifecycle and association.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// The association strategy.
    pub strategy: AssociationStrategy,
    /// Number of hits before a track is confirmed.
    pub min_hits: usize,
    /// Maximum number of consecutive misses before a track is deleted.
    pub max_age: usize,
    /// Appearance distance used by the cascade.
    pub metric: Metric,
    /// Appearance samples kept per track for the cascade.
    pub budget: Option<usize>,
    /// Capacity of the per-track box history.
    pub history_len: usize,
    /// Capacity of the per-track trajectory.
    pub trajectory_len: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            strategy: AssociationStrategy::default(),
            min_hits: 3,
            max_age: 30,
            metric: Metric::Cosine,
            budget: Some(100),
            history_len: track::DEFAULT_HISTORY_LEN,
            trajectory_len: track::DEFAULT_TRAJECTORY_LEN,
        }
    }
}

/// Parameters of the identity gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GalleryConfig {
    /// Minimum cosine similarity for a vector to resolve to an existing identity.
    pub similarity_threshold: f32,
    /// Vectors kept per identity, the oldest are evicted first.
    pub capacity: usize,
    /// Vectors kept that belong to no identity, the oldest are evicted first.
    pub unassigned_capacity: usize,
    /// Length every stored vector is padded or truncated to.
    pub dimension: usize,
}

impl Default for GalleryConfig {
    fn default() -> Self {
        GalleryConfig {
            similarity_threshold: 0.7,
            capacity: 20,
            unassigned_capacity: 1000,
            dimension: 512,
        }
    }
}

/// Parameters of a per-source track manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub tracker: TrackerConfig,
    pub gallery: GalleryConfig,
    /// Identity resolution runs on every n-th frame.
    pub identity_interval: usize,
    /// Zones checked for enter and exit events.
    pub zones: Vec<Zone>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            tracker: TrackerConfig::default(),
            gallery: GalleryConfig::default(),
            identity_interval: 5,
            zones: vec![],
        }
    }
}

impl ManagerConfig {
    /// Read a configuration from a JSON file. Missing fields take their default values.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }
}
