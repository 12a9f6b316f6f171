use thiserror::Error;

use crate::{EntryId, IdentityId, TrackId};

/// Errors surfaced by the tracking engine.
///
/// None of these are fatal to the frame loop: callers skip the offending
/// detection, feature update or lookup and carry on.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed detection: {0}")]
    MalformedDetection(String),

    #[error("identity {0} not found")]
    IdentityNotFound(IdentityId),

    #[error("gallery entry {0} not found")]
    EntryNotFound(EntryId),

    #[error("track {0} not found")]
    TrackNotFound(TrackId),

    #[error("cannot merge identity {0} into itself")]
    SelfMerge(IdentityId),

    #[error("unsupported gallery record version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
