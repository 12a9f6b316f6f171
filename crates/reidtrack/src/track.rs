use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};

use crate::*;
use ndarray::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default capacity of the per-track box history.
pub const DEFAULT_HISTORY_LEN: usize = 30;

/// Default capacity of the per-track trajectory of centers.
pub const DEFAULT_TRAJECTORY_LEN: usize = 64;

/// Enumeration type for the single target track state:
///
/// - Newly created tracks are classified as `Tentative` until enough evidence has been collected.
/// - Then, the track state is changed to `Confirmed`.
/// - A confirmed track that misses a frame is `Lost` but stays addressable for recovery until `max_age` is exceeded.
/// - Tracks that are no longer alive are classified as `Deleted` to mark them for removal from the set of active tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    Tentative,
    Confirmed,
    Lost,
    Deleted,
}

/// Enumeration type for the source of the match
///
/// * `Appearance` means matched via the blended motion and appearance cost of the cascade.
/// * `IoU` means matched via intersection over union of the Kalman filter predicted location.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum MatchSource {
    Appearance { distance: f32 },
    IoU { distance: f32 },
}

/// A single target track with state space `(x, y, a, h)` and associated velocities, where `(x, y)` is the center of the bounding box, `a` is the aspect ratio and `h` is the height.
#[derive(Clone)]
pub struct Track {
    /// The current track state.
    state: TrackState,
    /// Mean vector of the state distribution.
    mean: Array1<f32>,
    /// Covariance matrix of the state distribution.
    covariance: Array2<f32>,
    /// A unique track identifier.
    track_id: TrackId,
    /// Class of the latest associated detection.
    class_id: Option<usize>,
    /// Confidence of the latest associated detection.
    confidence: f32,
    /// The latest matched detection source.
    match_source: Option<MatchSource>,
    /// Total number of measurement updates.
    hits: usize,
    /// Total number of frames since first occurance.
    age: usize,
    /// Total number of frames since last measurement update.
    time_since_update: usize,
    /// Number of hits before the track is confirmed.
    n_init: usize,
    /// The maximum number of consecutive misses before the track state is set to `Deleted`.
    max_age: usize,
    /// Bounding box of the latest associated detection.
    detection_bbox: BoundingBox,
    /// Center displacement between the two latest associated detections.
    velocity: (f32, f32),
    /// Ring of past measured boxes, oldest first.
    history: VecDeque<BoundingBox>,
    history_len: usize,
    /// Ring of past centers of a confirmed track, oldest first.
    trajectory: VecDeque<(f32, f32)>,
    trajectory_len: usize,
    /// The latest appearance vector.
    feature: Option<Array1<f32>>,
    /// A cache of features. On each measurement update, the associated feature vector is added to this list.
    features: Option<Array2<f32>>,
    /// Identity resolved by the gallery. This is a lookup key, the gallery owns the record.
    identity_id: Option<IdentityId>,
    /// Free-form annotations such as zone membership.
    metadata: HashMap<String, Value>,
}

impl std::fmt::Debug for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Track")
            .field("state", &self.state)
            .field("track_id", &self.track_id)
            .field("match_source", &self.match_source)
            .field("hits", &self.hits)
            .field("age", &self.age)
            .field("time_since_update", &self.time_since_update)
            .field("identity_id", &self.identity_id)
            .finish()
    }
}

impl PartialEq for Track {
    fn eq(&self, other: &Self) -> bool {
        self.track_id == other.track_id
    }
}

impl Eq for Track {}

impl Hash for Track {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.track_id.hash(state);
    }
}

impl Track {
    /// Returns a new Tentative Track initiated from an unassociated detection.
    ///
    /// # Parameters
    ///
    /// * `kf`: The Kalman filter used to initiate the state distribution.
    /// * `track_id`: A unique track identifier.
    /// * `detection`: The detection this track originates from. Its feature, if any, is added to the `features` cache.
    /// * `n_init`: Number of hits before the track is confirmed. The track state is set to `Deleted` if a miss occurs before that.
    /// * `max_age`: The maximum number of consecutive misses before the track state is set to `Deleted`.
    pub fn new(
        kf: &KalmanFilter,
        track_id: TrackId,
        detection: &Detection,
        n_init: usize,
        max_age: usize,
    ) -> Track {
        let (mean, covariance) = kf.initiate(detection.bbox());
        let features = detection
            .feature()
            .map(|feature| feature.clone().insert_axis(Axis(0)));

        let mut history = VecDeque::with_capacity(DEFAULT_HISTORY_LEN);
        history.push_back(*detection.bbox());

        Track {
            state: if n_init <= 1 {
                TrackState::Confirmed
            } else {
                TrackState::Tentative
            },
            mean,
            covariance,
            track_id,
            class_id: detection.class_id(),
            confidence: detection.confidence(),
            match_source: None,
            hits: 1,
            age: 1,
            time_since_update: 0,
            n_init,
            max_age,
            detection_bbox: *detection.bbox(),
            velocity: (0.0, 0.0),
            history,
            history_len: DEFAULT_HISTORY_LEN,
            trajectory: VecDeque::new(),
            trajectory_len: DEFAULT_TRAJECTORY_LEN,
            feature: detection.feature().cloned(),
            features,
            identity_id: None,
            metadata: HashMap::new(),
        }
    }

    /// Set the capacity of the box history ring.
    pub fn with_history_len(&mut self, history_len: usize) -> &mut Self {
        self.history_len = history_len.max(1);
        while self.history.len() > self.history_len {
            self.history.pop_front();
        }
        self
    }

    /// Set the capacity of the trajectory ring.
    pub fn with_trajectory_len(&mut self, trajectory_len: usize) -> &mut Self {
        self.trajectory_len = trajectory_len.max(1);
        while self.trajectory.len() > self.trajectory_len {
            self.trajectory.pop_front();
        }
        self
    }

    /// Return the identifier of the track
    pub fn track_id(&self) -> TrackId {
        self.track_id
    }

    /// Return the TrackState of the track
    pub fn state(&self) -> TrackState {
        self.state
    }

    /// Return the class of the latest associated detection
    pub fn class_id(&self) -> Option<usize> {
        self.class_id
    }

    /// Return the confidence of the latest associated detection
    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    /// Return the match source of the track
    pub fn match_source(&self) -> Option<MatchSource> {
        self.match_source
    }

    /// Return the number of measurement updates
    pub fn hits(&self) -> usize {
        self.hits
    }

    /// Return the number of frames since the track was created
    pub fn age(&self) -> usize {
        self.age
    }

    /// Return the time since update of the track
    pub fn time_since_update(&self) -> usize {
        self.time_since_update
    }

    /// Return the mean of the track
    pub fn mean(&self) -> &Array1<f32> {
        &self.mean
    }

    /// Return the covariance of the track
    pub fn covariance(&self) -> &Array2<f32> {
        &self.covariance
    }

    /// Return the bounding box of the latest associated detection
    pub fn detection_bbox(&self) -> &BoundingBox {
        &self.detection_bbox
    }

    /// Return the center displacement per update, `new_center - old_center`
    pub fn velocity(&self) -> (f32, f32) {
        self.velocity
    }

    /// Return the past measured boxes, oldest first
    pub fn history(&self) -> &VecDeque<BoundingBox> {
        &self.history
    }

    /// Return the past centers, oldest first
    pub fn trajectory(&self) -> &VecDeque<(f32, f32)> {
        &self.trajectory
    }

    /// Return the latest appearance vector of the track
    pub fn feature(&self) -> Option<&Array1<f32>> {
        self.feature.as_ref()
    }

    /// Return the features of the track
    pub fn features(&self) -> Option<&Array2<f32>> {
        self.features.as_ref()
    }

    /// Take the cached features, leaving the cache empty
    pub fn take_features(&mut self) -> Option<Array2<f32>> {
        self.features.take()
    }

    /// Return the resolved identity of the track
    pub fn identity_id(&self) -> Option<IdentityId> {
        self.identity_id
    }

    /// Return the metadata of the track
    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    /// Return the mutable metadata of the track
    pub fn metadata_mut(&mut self) -> &mut HashMap<String, Value> {
        &mut self.metadata
    }

    /// Returns the track position bounding box
    pub fn bbox(&self) -> BoundingBox {
        BoundingBox::from_xyah(self.mean[0], self.mean[1], self.mean[2], self.mean[3])
    }

    /// Propagate the state distribution to the current time step using a Kalman filter prediction step.
    ///
    /// # Parameters
    ///
    /// * `kf`: The Kalman filter.
    pub fn predict(&mut self, kf: &KalmanFilter) {
        if self.is_deleted() {
            return;
        }
        (self.mean, self.covariance) = kf.predict(&self.mean, &self.covariance);
        self.age += 1;
        self.time_since_update += 1;
    }

    /// Perform Kalman filter measurement update step and update the feature cache.
    ///
    /// A `Lost` track returns to `Confirmed` straight away.
    ///
    /// # Parameters
    ///
    /// * `kf`: The Kalman filter.
    /// * `detection`: The associated detection.
    /// * `match_source`: How the detection was associated.
    pub fn update(
        &mut self,
        kf: &KalmanFilter,
        detection: &Detection,
        match_source: Option<MatchSource>,
    ) -> Result<&mut Self> {
        if self.is_deleted() {
            return Ok(self);
        }

        (self.mean, self.covariance) =
            kf.update(&self.mean, &self.covariance, &detection.bbox().to_xyah());

        if let Some(feature) = detection.feature() {
            match &mut self.features {
                Some(features) if features.ncols() == feature.len() => {
                    features.push_row(feature.view())?
                }
                _ => self.features = Some(feature.clone().insert_axis(Axis(0))),
            };
            self.feature = Some(feature.clone());
        }

        let (old_x, old_y) = self.detection_bbox.center();
        let (new_x, new_y) = detection.bbox().center();
        self.velocity = (new_x - old_x, new_y - old_y);

        self.detection_bbox = *detection.bbox();
        self.history.push_back(*detection.bbox());
        while self.history.len() > self.history_len {
            self.history.pop_front();
        }

        self.match_source = match_source;
        self.confidence = detection.confidence();
        if detection.class_id().is_some() {
            self.class_id = detection.class_id();
        }
        self.hits += 1;
        self.time_since_update = 0;

        match self.state {
            TrackState::Tentative if self.hits >= self.n_init => {
                self.state = TrackState::Confirmed
            }
            TrackState::Lost => self.state = TrackState::Confirmed,
            _ => {}
        }

        Ok(self)
    }

    /// Mark this track as missed (no association at the current time step).
    ///
    /// A tentative track is deleted immediately, a confirmed track becomes `Lost` and is deleted once
    /// `time_since_update` exceeds `max_age`.
    pub fn mark_missed(&mut self) {
        match self.state {
            TrackState::Tentative => self.state = TrackState::Deleted,
            TrackState::Confirmed | TrackState::Lost => {
                self.state = if self.time_since_update > self.max_age {
                    TrackState::Deleted
                } else {
                    TrackState::Lost
                }
            }
            TrackState::Deleted => {}
        }
    }

    /// Append the current center to the trajectory ring.
    pub fn push_trajectory(&mut self, center: (f32, f32)) {
        self.trajectory.push_back(center);
        while self.trajectory.len() > self.trajectory_len {
            self.trajectory.pop_front();
        }
    }

    /// Replace the latest appearance vector without touching the matching cache.
    pub fn set_feature(&mut self, feature: Array1<f32>) {
        self.feature = Some(feature);
    }

    /// Record the identity resolved by the gallery.
    pub fn set_identity_id(&mut self, identity_id: IdentityId) {
        self.identity_id = Some(identity_id);
        self.metadata
            .insert("identity_id".to_string(), Value::from(identity_id));
    }

    /// Returns true if this track is tentative (unconfirmed).
    pub fn is_tentative(&self) -> bool {
        matches!(self.state, TrackState::Tentative)
    }

    /// Returns true if this track has been confirmed and is not deleted, including while lost.
    pub fn is_confirmed(&self) -> bool {
        matches!(self.state, TrackState::Confirmed | TrackState::Lost)
    }

    /// Returns true if this track is lost.
    pub fn is_lost(&self) -> bool {
        matches!(self.state, TrackState::Lost)
    }

    /// Returns true if this track is dead and should be removed.
    pub fn is_deleted(&self) -> bool {
        matches!(self.state, TrackState::Deleted)
    }
}
