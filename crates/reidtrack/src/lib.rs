#[macro_use]
extern crate lazy_static;

mod association;
mod bounding_box;
mod config;
mod detection;
mod error;
pub mod features;
mod gallery;
pub mod iou_matching;
mod kalman_filter;
pub mod linear_assignment;
mod manager;
mod nn_matching;
pub mod track;
mod tracker;
mod zone;

/// Per-source track identifier, allocated from 1.
pub type TrackId = usize;
/// Global identity identifier shared by every source using the same gallery.
pub type IdentityId = u64;
/// Identifier of a single appearance vector stored in the gallery.
pub type EntryId = u64;

pub use association::{Association, AssociationStrategy};
pub use bounding_box::BoundingBox;
pub use config::{GalleryConfig, ManagerConfig, TrackerConfig};
pub use detection::Detection;
pub use error::{Error, Result};
pub use features::{AppearanceEncoder, ColourDescriptor, FeatureExtractor, HogDescriptor};
#[cfg(feature = "onnx")]
pub use features::OnnxExtractor;
pub use gallery::{
    GalleryRecord, GalleryRecordSet, GalleryStats, IdentityGallery, Representative, SearchHit,
    GALLERY_FORMAT_VERSION,
};
pub use kalman_filter::{KalmanFilter, CHI2INV95};
pub use linear_assignment::{Match, INFTY_COST};
pub use manager::{
    ManagerStats, MultiSourceStats, MultiSourceTracker, SourceBatch, TrackManager, TrackSnapshot,
};
pub use nn_matching::{Metric, NearestNeighborDistanceMetric};
pub use track::{MatchSource, Track, TrackState};
pub use tracker::{Tracker, TrackerUpdate};
pub use zone::{Zone, ZoneEvent, ZoneEventKind, ZoneEventLog, ZoneId};
