use crate::*;
use ndarray::*;
use tracing::{debug, warn};

/// This is the multi-target tracker.
///
/// It owns the live track set of one source: ids are allocated here, association results are applied here and
/// deleted tracks are purged here.
///
/// # Examples
///
/// ```
/// use reidtrack::{BoundingBox, Detection, Tracker};
///
/// // instantiate tracker with default parameters
/// let mut tracker = Tracker::default();
///
/// // create a detection
/// let detection = Detection::new(None, BoundingBox::new(0.0, 0.0, 5.0, 5.0), 0.9, None, None);
///
/// // predict then add 0..n detections
/// tracker.predict();
/// tracker.update(&[detection]).unwrap();
///
/// // print predictions
/// for track in tracker.tracks() {
///     println!(
///         "{} {:?} {:?}",
///         track.track_id(),
///         track.state(),
///         track.bbox().to_tlwh(),
///     );
/// }
///```
#[derive(Debug, Clone)]
pub struct Tracker {
    /// The association strategy selected at construction.
    strategy: AssociationStrategy,
    /// Number of hits before the track is confirmed.
    n_init: usize,
    /// Maximum number of missed misses before a track is deleted.
    max_age: usize,
    history_len: usize,
    trajectory_len: usize,
    /// A Kalman filter to filter target trajectories in image space.
    kf: KalmanFilter,
    /// The distance metric used for appearance association.
    metric: NearestNeighborDistanceMetric,
    /// The list of active tracks at the current time step.
    tracks: Vec<Track>,
    /// Used to allocate identifiers to new tracks.
    next_id: TrackId,
    total_created: usize,
    total_deleted: usize,
}

/// What a single `Tracker::update` call changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackerUpdate {
    /// Tracks that received a detection.
    pub matched: Vec<TrackId>,
    /// Tracks created from unmatched detections.
    pub created: Vec<TrackId>,
    /// Tracks deleted and purged from the live set.
    pub deleted: Vec<TrackId>,
    /// Number of detections rejected as malformed.
    pub rejected: usize,
}

impl Default for Tracker {
    fn default() -> Self {
        Tracker::new(&TrackerConfig::default())
    }
}

impl Tracker {
    /// Returns a new Tracker
    ///
    /// # Parameters
    ///
    /// * `config`: Strategy, lifecycle thresholds and buffer sizes.
    pub fn new(config: &TrackerConfig) -> Tracker {
        Tracker {
            strategy: config.strategy,
            n_init: config.min_hits,
            max_age: config.max_age,
            history_len: config.history_len,
            trajectory_len: config.trajectory_len,
            kf: KalmanFilter::new(),
            metric: NearestNeighborDistanceMetric::new(Some(config.metric), config.budget),
            tracks: vec![],
            next_id: 1,
            total_created: 0,
            total_deleted: 0,
        }
    }

    /// Set the association strategy
    pub fn with_strategy(&mut self, strategy: AssociationStrategy) -> &mut Self {
        self.strategy = strategy;
        self
    }

    /// Set n_init
    pub fn with_n_init(&mut self, n_init: usize) -> &mut Self {
        self.n_init = n_init;
        self
    }

    /// Set max_age
    pub fn with_max_age(&mut self, max_age: usize) -> &mut Self {
        self.max_age = max_age;
        self
    }

    /// Set the distance metric used by the cascade
    pub fn with_metric(&mut self, metric: NearestNeighborDistanceMetric) -> &mut Self {
        self.metric = metric;
        self
    }

    /// Return the association strategy
    pub fn strategy(&self) -> &AssociationStrategy {
        &self.strategy
    }

    /// Return the Kalman filter
    pub fn kf(&self) -> &KalmanFilter {
        &self.kf
    }

    /// Return the distance metric
    pub fn metric(&self) -> &NearestNeighborDistanceMetric {
        &self.metric
    }

    /// Return the live tracks
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Return the mutable live tracks
    pub fn tracks_mut(&mut self) -> &mut [Track] {
        &mut self.tracks
    }

    /// Return the confirmed tracks, including tracks that are lost but still addressable for recovery
    pub fn confirmed_tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter().filter(|track| track.is_confirmed())
    }

    /// Return the track with the given identifier
    pub fn track(&self, track_id: TrackId) -> Option<&Track> {
        self.tracks
            .iter()
            .find(|track| track.track_id() == track_id)
    }

    /// Return the mutable track with the given identifier
    pub fn track_mut(&mut self, track_id: TrackId) -> Option<&mut Track> {
        self.tracks
            .iter_mut()
            .find(|track| track.track_id() == track_id)
    }

    /// Return the total number of tracks created
    pub fn total_created(&self) -> usize {
        self.total_created
    }

    /// Return the total number of tracks deleted
    pub fn total_deleted(&self) -> usize {
        self.total_deleted
    }

    /// Propagate track state distributions one time step forward.
    ///
    /// This function should be called once every time step, before `update`.
    pub fn predict(&mut self) {
        let kf = &self.kf;
        self.tracks.iter_mut().for_each(|track| track.predict(kf));
    }

    /// Perform measurement update and track management.
    ///
    /// Malformed detections are skipped with a warning.
    ///
    /// # Parameters
    ///
    /// * `detections`: A list of detections at the current time step.
    pub fn update(&mut self, detections: &[Detection]) -> Result<TrackerUpdate> {
        let mut summary = TrackerUpdate::default();

        let detection_indices = detections
            .iter()
            .enumerate()
            .filter_map(|(idx, detection)| match detection.validate() {
                Ok(()) => Some(idx),
                Err(err) => {
                    warn!(detection = %detection.id(), "skipping detection: {}", err);
                    None
                }
            })
            .collect::<Vec<_>>();
        summary.rejected = detections.len() - detection_indices.len();

        let Association {
            matches,
            unmatched_tracks,
            unmatched_detections,
            ..
        } = self.strategy.associate(
            &self.kf,
            &self.metric,
            self.max_age,
            &self.tracks,
            detections,
            &detection_indices,
        );

        // Update track set.
        for (m, source) in matches {
            let track = &mut self.tracks[m.track_idx()];
            track.update(&self.kf, &detections[m.detection_idx()], Some(source))?;
            summary.matched.push(track.track_id());
        }
        for track_idx in unmatched_tracks {
            self.tracks[track_idx].mark_missed();
        }
        for detection_idx in unmatched_detections {
            let track_id = self.initiate_track(&detections[detection_idx]);
            summary.created.push(track_id);
        }

        summary.deleted = self
            .tracks
            .iter()
            .filter(|track| track.is_deleted())
            .map(|track| track.track_id())
            .collect();
        self.tracks.retain(|track| !track.is_deleted());
        self.total_deleted += summary.deleted.len();

        // Update distance metric.
        let active_targets = self
            .confirmed_tracks()
            .map(|track| track.track_id())
            .collect::<Vec<_>>();
        let mut features: Option<Array2<f32>> = None;
        let mut targets = vec![];
        for track in self.tracks.iter_mut().filter(|track| track.is_confirmed()) {
            let track_id = track.track_id();
            if let Some(track_features) = track.take_features() {
                match &mut features {
                    Some(features) if features.ncols() == track_features.ncols() => {
                        features.append(Axis(0), track_features.view())?
                    }
                    Some(_) => continue,
                    None => features = Some(track_features.clone()),
                }
                targets.extend(std::iter::repeat(track_id).take(track_features.nrows()));
            }
        }
        let features = features.unwrap_or_else(|| Array2::zeros((0, 0)));
        self.metric
            .partial_fit(&features, &targets, &active_targets)?;

        debug!(
            matched = summary.matched.len(),
            created = summary.created.len(),
            deleted = summary.deleted.len(),
            rejected = summary.rejected,
            live = self.tracks.len(),
            "tracker update"
        );

        Ok(summary)
    }

    fn initiate_track(&mut self, detection: &Detection) -> TrackId {
        let track_id = self.next_id;
        let mut track = Track::new(&self.kf, track_id, detection, self.n_init, self.max_age);
        track
            .with_history_len(self.history_len)
            .with_trajectory_len(self.trajectory_len);
        self.tracks.push(track);
        self.next_id += 1;
        self.total_created += 1;
        track_id
    }
}

#[cfg(test)]
mod tests {
    use crate::*;
    use anyhow::Result;
    use rand::prelude::*;
    use rand_distr::Normal;
    use rand_pcg::{Lcg64Xsh32, Pcg32};

    /// Returns a psuedo-random (deterministic) f32 between -0.5 and +0.5
    fn next_f32(rng: &mut Lcg64Xsh32) -> f32 {
        (rng.next_u32() as f64 / u32::MAX as f64) as f32 - 0.5
    }

    /// Returns a vec of length n with a normal distribution
    fn normal_vec(rng: &mut Lcg64Xsh32, mean: f32, std_dev: f32, n: usize) -> Vec<f32> {
        let normal = Normal::<f32>::new(mean, std_dev).unwrap();
        (0..n).map(|_| normal.sample(rng)).collect()
    }

    fn detection(x: f32, y: f32, w: f32, h: f32, feature: Option<Vec<f32>>) -> Detection {
        Detection::new(None, BoundingBox::new(x, y, w, h), 0.9, None, feature)
    }

    #[test]
    fn ids_are_monotonic() -> Result<()> {
        let mut tracker = Tracker::default();

        tracker.predict();
        let update = tracker.update(&[
            detection(0.0, 0.0, 50.0, 50.0, None),
            detection(100.0, 100.0, 50.0, 50.0, None),
        ])?;

        assert_eq!(update.created, vec![1, 2]);
        assert_eq!(tracker.total_created(), 2);
        assert!(tracker.track(1).is_some());
        assert!(tracker.track(3).is_none());
        assert_eq!(tracker.confirmed_tracks().count(), 0);

        Ok(())
    }

    #[test]
    fn malformed_detections_are_rejected() -> Result<()> {
        let mut tracker = Tracker::default();

        tracker.predict();
        let update = tracker.update(&[
            detection(0.0, 0.0, 0.0, 50.0, None),
            Detection::new(None, BoundingBox::new(0.0, 0.0, 5.0, 5.0), 1.5, None, None),
            detection(10.0, 10.0, 5.0, 5.0, None),
        ])?;

        assert_eq!(update.rejected, 2);
        assert_eq!(update.created, vec![1]);

        Ok(())
    }

    #[test]
    fn tentative_track_dies_on_first_miss() -> Result<()> {
        let mut tracker = Tracker::default();

        tracker.predict();
        tracker.update(&[detection(0.0, 0.0, 50.0, 50.0, None)])?;
        tracker.predict();
        let update = tracker.update(&[])?;

        assert_eq!(update.deleted, vec![1]);
        assert!(tracker.tracks().is_empty());
        assert_eq!(tracker.total_deleted(), 1);

        Ok(())
    }

    #[test]
    fn tracker_nearest_neighbor() -> Result<()> {
        let iterations = 100;

        // deterministic generator
        let mut rng = Pcg32::seed_from_u64(0);

        // create random movement/scale
        let movement_jitter = (0..1000).map(|_| next_f32(&mut rng)).collect::<Vec<_>>();
        let scale_jitter = normal_vec(&mut rng, 0.0, 0.2, 1000);
        let mut movement_jitter = movement_jitter.into_iter();
        let mut scale_jitter = scale_jitter.into_iter();

        // create the feature vectors
        let d0_feat = normal_vec(&mut rng, 0.0, 1.0, 128);
        let d1_feat = normal_vec(&mut rng, 0.0, 1.0, 128);
        let d2_feat = normal_vec(&mut rng, 0.0, 1.0, 128);

        let mut tracker = Tracker::default();
        tracker.with_strategy(AssociationStrategy::cascade());

        for iteration in 0..iterations {
            let i = iteration as f32;
            let mut next = || movement_jitter.next().unwrap();
            let d0 = (i + next(), i + next());
            let d1 = (100.0 - i + next(), 100.0 - i + next());
            let d2 = (i + next(), 100.0 - i + next());
            let mut scale = || 10.0 + scale_jitter.next().unwrap();

            tracker.predict();
            tracker.update(&[
                detection(d0.0, d0.1, scale(), scale(), Some(d0_feat.clone())),
                detection(d1.0, d1.1, scale(), scale(), Some(d1_feat.clone())),
                detection(d2.0, d2.1, scale(), scale(), Some(d2_feat.clone())),
            ])?;
        }

        // three targets, three confirmed tracks, no switches
        let mut ids = tracker
            .confirmed_tracks()
            .map(|track| track.track_id())
            .collect::<Vec<_>>();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(tracker.total_created(), 3);
        assert!(tracker
            .confirmed_tracks()
            .all(|track| track.hits() == iterations && track.time_since_update() == 0));
        assert!((1..=3).all(|id| tracker.metric().has_samples(id)));

        Ok(())
    }
}
