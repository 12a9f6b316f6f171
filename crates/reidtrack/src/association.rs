use crate::*;
use ndarray::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// The per-frame association strategy, selected once when the tracker is built.
///
/// - `Iou` matches every track against every detection on `1 - IoU` of the predicted box.
/// - `ConfidenceTiered` matches high confidence detections first and then spends low confidence detections on
///   confirmed tracks only, so brief confidence dips do not break a track and noise never starts one.
/// - `Cascade` matches confirmed tracks in buckets of increasing `time_since_update` on a blend of motion and
///   appearance cost, followed by an IoU pass over the unconfirmed and just-missed tracks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AssociationStrategy {
    Iou {
        /// Pairs with `1 - IoU` at or above this value are disregarded.
        max_iou_distance: f32,
    },
    ConfidenceTiered {
        /// Detections at or above this confidence take part in the first round and may start tracks.
        high_threshold: f32,
        /// Detections below this confidence are discarded before association.
        low_threshold: f32,
        /// IoU distance threshold of the first round.
        max_iou_distance: f32,
        /// IoU distance threshold of the second round.
        max_low_iou_distance: f32,
    },
    Cascade {
        /// Weight of the motion cost, the appearance cost gets `1 - lambda`.
        lambda: f32,
        /// Blended cost threshold of the cascade.
        max_distance: f32,
        /// IoU distance threshold of the pass over unconfirmed tracks.
        max_iou_distance: f32,
    },
}

impl Default for AssociationStrategy {
    fn default() -> Self {
        Self::confidence_tiered()
    }
}

impl AssociationStrategy {
    /// IoU only association with a `0.7` distance threshold.
    pub fn iou() -> Self {
        AssociationStrategy::Iou {
            max_iou_distance: 0.7,
        }
    }

    /// Two round association with confidence thresholds `0.5` / `0.1`.
    pub fn confidence_tiered() -> Self {
        AssociationStrategy::ConfidenceTiered {
            high_threshold: 0.5,
            low_threshold: 0.1,
            max_iou_distance: 0.7,
            max_low_iou_distance: 0.85,
        }
    }

    /// Age tiered cascade weighting motion and appearance equally.
    pub fn cascade() -> Self {
        AssociationStrategy::Cascade {
            lambda: 0.5,
            max_distance: 0.7,
            max_iou_distance: 0.7,
        }
    }

    /// Returns true if the strategy makes use of appearance vectors.
    pub fn uses_appearance(&self) -> bool {
        matches!(self, AssociationStrategy::Cascade { .. })
    }

    /// Associate the detections selected by `detection_indices` with `tracks`.
    ///
    /// # Parameters
    ///
    /// * `kf`: The Kalman filter used for gating.
    /// * `metric`: Appearance samples of the confirmed tracks.
    /// * `cascade_depth`: Number of `time_since_update` buckets visited by the cascade, usually `max_age`.
    /// * `tracks`: The predicted tracks at the current time step.
    /// * `detections`: The detections at the current time step.
    /// * `detection_indices`: Indices of the detections that passed validation.
    pub fn associate(
        &self,
        kf: &KalmanFilter,
        metric: &NearestNeighborDistanceMetric,
        cascade_depth: usize,
        tracks: &[Track],
        detections: &[Detection],
        detection_indices: &[usize],
    ) -> Association {
        let track_indices = tracks
            .iter()
            .enumerate()
            .filter(|(_, track)| !track.is_deleted())
            .map(|(idx, _)| idx)
            .collect::<Vec<_>>();

        let association = match *self {
            AssociationStrategy::Iou { max_iou_distance } => {
                let (matches, unmatched_tracks, unmatched_detections) =
                    linear_assignment::min_cost_matching(
                        iou_matching::iou_cost,
                        max_iou_distance,
                        tracks,
                        detections,
                        &track_indices,
                        detection_indices,
                    );
                Association {
                    matches: iou_sourced(matches),
                    unmatched_tracks,
                    unmatched_detections,
                    discarded_detections: vec![],
                }
            }
            AssociationStrategy::ConfidenceTiered {
                high_threshold,
                low_threshold,
                max_iou_distance,
                max_low_iou_distance,
            } => {
                let mut high_detections = vec![];
                let mut low_detections = vec![];
                let mut discarded_detections = vec![];
                detection_indices.iter().for_each(|&idx| {
                    let confidence = detections[idx].confidence();
                    if confidence >= high_threshold {
                        high_detections.push(idx);
                    } else if confidence >= low_threshold {
                        low_detections.push(idx);
                    } else {
                        discarded_detections.push(idx);
                    }
                });

                // Round 1
                // Associate high confidence detections with the whole track pool.
                let (high_matches, unmatched_tracks, unmatched_detections) =
                    linear_assignment::min_cost_matching(
                        iou_matching::iou_cost,
                        max_iou_distance,
                        tracks,
                        detections,
                        &track_indices,
                        &high_detections,
                    );

                // Round 2
                // Associate low confidence detections with the tracks that are still confirmed.
                let (confirmed_tracks, other_tracks): (Vec<usize>, Vec<usize>) = unmatched_tracks
                    .into_iter()
                    .partition(|idx| tracks[*idx].state() == TrackState::Confirmed);
                let (low_matches, unmatched_confirmed_tracks, unmatched_low_detections) =
                    linear_assignment::min_cost_matching(
                        iou_matching::iou_cost,
                        max_low_iou_distance,
                        tracks,
                        detections,
                        &confirmed_tracks,
                        &low_detections,
                    );
                debug!(
                    high = high_detections.len(),
                    low = low_detections.len(),
                    high_matches = high_matches.len(),
                    low_matches = low_matches.len(),
                    "confidence tiered association"
                );

                let mut matches = iou_sourced(high_matches);
                matches.extend(iou_sourced(low_matches));

                // low confidence detections never start tracks
                discarded_detections.extend(unmatched_low_detections);

                let mut unmatched_tracks = other_tracks;
                unmatched_tracks.extend(unmatched_confirmed_tracks);
                unmatched_tracks.sort_unstable();

                Association {
                    matches,
                    unmatched_tracks,
                    unmatched_detections,
                    discarded_detections,
                }
            }
            AssociationStrategy::Cascade {
                lambda,
                max_distance,
                max_iou_distance,
            } => {
                let gated_metric = |tracks: &[Track],
                                    detections: &[Detection],
                                    track_indices: &[usize],
                                    detection_indices: &[usize]|
                 -> Array2<f32> {
                    let cost_matrix = blended_cost(
                        metric,
                        lambda,
                        tracks,
                        detections,
                        track_indices,
                        detection_indices,
                    );
                    linear_assignment::gate_cost_matrix(
                        kf,
                        cost_matrix,
                        tracks,
                        detections,
                        track_indices,
                        detection_indices,
                        None,
                        false,
                    )
                };

                // Split track set into confirmed and unconfirmed tracks.
                let (confirmed_tracks, unconfirmed_tracks): (Vec<usize>, Vec<usize>) =
                    track_indices
                        .iter()
                        .copied()
                        .partition(|idx| tracks[*idx].is_confirmed());

                // Associate confirmed tracks using appearance features.
                let (cascade_matches, unmatched_tracks_a, unmatched_detections) =
                    linear_assignment::matching_cascade(
                        gated_metric,
                        max_distance,
                        cascade_depth,
                        tracks,
                        detections,
                        &confirmed_tracks,
                        detection_indices,
                    );

                // Associate remaining tracks together with unconfirmed tracks using IoU.
                let (just_missed, unmatched_tracks_a): (Vec<usize>, Vec<usize>) =
                    unmatched_tracks_a
                        .into_iter()
                        .partition(|idx| tracks[*idx].time_since_update() == 1);
                let mut iou_track_candidates = unconfirmed_tracks;
                iou_track_candidates.extend(just_missed);

                let (iou_matches, unmatched_tracks_b, unmatched_detections) =
                    linear_assignment::min_cost_matching(
                        iou_matching::iou_cost,
                        max_iou_distance,
                        tracks,
                        detections,
                        &iou_track_candidates,
                        &unmatched_detections,
                    );
                debug!(
                    cascade_matches = cascade_matches.len(),
                    iou_matches = iou_matches.len(),
                    "cascade association"
                );

                let mut matches = cascade_matches
                    .into_iter()
                    .map(|m| {
                        let appearance = appearance_available(
                            metric,
                            &tracks[m.track_idx()],
                            &detections[m.detection_idx()],
                        );
                        let source = if appearance {
                            MatchSource::Appearance {
                                distance: m.distance(),
                            }
                        } else {
                            MatchSource::IoU {
                                distance: m.distance(),
                            }
                        };
                        (m, source)
                    })
                    .collect::<Vec<_>>();
                matches.extend(iou_sourced(iou_matches));

                let mut unmatched_tracks = unmatched_tracks_a;
                unmatched_tracks.extend(unmatched_tracks_b);
                unmatched_tracks.sort_unstable();
                unmatched_tracks.dedup();

                Association {
                    matches,
                    unmatched_tracks,
                    unmatched_detections,
                    discarded_detections: vec![],
                }
            }
        };

        debug!(
            tracks = track_indices.len(),
            detections = detection_indices.len(),
            matches = association.matches.len(),
            unmatched_tracks = association.unmatched_tracks.len(),
            unmatched_detections = association.unmatched_detections.len(),
            "association"
        );

        association
    }
}

/// The outcome of one association step, expressed as indices into the track and detection slices.
#[derive(Debug, Clone, Default)]
pub struct Association {
    /// Accepted pairs together with how they were matched.
    pub matches: Vec<(Match, MatchSource)>,
    /// Tracks left without a detection.
    pub unmatched_tracks: Vec<usize>,
    /// Detections left without a track that may start a new track.
    pub unmatched_detections: Vec<usize>,
    /// Detections left without a track that must not start a new track.
    pub discarded_detections: Vec<usize>,
}

fn iou_sourced(matches: Vec<Match>) -> Vec<(Match, MatchSource)> {
    matches
        .into_iter()
        .map(|m| {
            let distance = m.distance();
            (m, MatchSource::IoU { distance })
        })
        .collect()
}

/// Returns true if the track has appearance samples comparable with the detection's vector.
fn appearance_available(
    metric: &NearestNeighborDistanceMetric,
    track: &Track,
    detection: &Detection,
) -> bool {
    match (metric.track_features(track.track_id()), detection.feature()) {
        (Some(samples), Some(feature)) => samples.nrows() > 0 && samples.ncols() == feature.len(),
        _ => false,
    }
}

/// Blended motion and appearance cost.
///
/// Entry (i, j) is `lambda * (1 - IoU) + (1 - lambda) * appearance_distance` when the track has appearance samples
/// and the detection carries a vector of the same length, and `1 - IoU` otherwise.
pub fn blended_cost(
    metric: &NearestNeighborDistanceMetric,
    lambda: f32,
    tracks: &[Track],
    detections: &[Detection],
    track_indices: &[usize],
    detection_indices: &[usize],
) -> Array2<f32> {
    let mut cost_matrix =
        iou_matching::iou_cost(tracks, detections, track_indices, detection_indices);

    let with_features = detection_indices
        .iter()
        .enumerate()
        .filter_map(|(col, idx)| detections[*idx].feature().map(|feature| (col, feature)))
        .collect::<Vec<_>>();
    let dimension = match with_features.first() {
        Some((_, feature)) => feature.len(),
        None => return cost_matrix,
    };
    let with_features = with_features
        .into_iter()
        .filter(|(_, feature)| feature.len() == dimension)
        .collect::<Vec<_>>();

    let features = Array2::from_shape_fn((with_features.len(), dimension), |(row, col)| {
        with_features[row].1[col]
    });
    let targets = track_indices
        .iter()
        .map(|idx| tracks[*idx].track_id())
        .collect::<Vec<_>>();
    let appearance = metric.distance(&features, &targets);

    track_indices
        .iter()
        .enumerate()
        .filter(|(_, idx)| {
            metric
                .track_features(tracks[**idx].track_id())
                .map(|samples| samples.nrows() > 0 && samples.ncols() == dimension)
                .unwrap_or(false)
        })
        .for_each(|(row, _)| {
            with_features
                .iter()
                .enumerate()
                .for_each(|(k, (col, _))| {
                    let motion = cost_matrix[[row, *col]];
                    cost_matrix[[row, *col]] =
                        lambda * motion + (1.0 - lambda) * appearance[[row, k]];
                });
        });

    cost_matrix
}

#[cfg(test)]
mod tests {
    use crate::*;
    use anyhow::Result;
    use assert_approx_eq::assert_approx_eq;
    use ndarray::*;

    fn confirmed_track(kf: &KalmanFilter, track_id: TrackId, bbox: BoundingBox) -> Track {
        let mut track = Track::new(
            kf,
            track_id,
            &Detection::new(None, bbox, 1.0, None, None),
            1,
            30,
        );
        track.predict(kf);
        track
    }

    fn detection(bbox: BoundingBox, confidence: f32, feature: Option<Vec<f32>>) -> Detection {
        Detection::new(None, bbox, confidence, None, feature)
    }

    #[test]
    fn iou_strategy() {
        let kf = KalmanFilter::new();
        let metric = NearestNeighborDistanceMetric::default();
        let tracks = vec![
            confirmed_track(&kf, 1, BoundingBox::new(0.0, 0.0, 50.0, 50.0)),
            confirmed_track(&kf, 2, BoundingBox::new(100.0, 100.0, 50.0, 50.0)),
        ];
        let detections = vec![
            detection(BoundingBox::new(101.0, 101.0, 50.0, 50.0), 0.9, None),
            detection(BoundingBox::new(400.0, 400.0, 50.0, 50.0), 0.9, None),
        ];

        let association = AssociationStrategy::iou().associate(
            &kf,
            &metric,
            30,
            &tracks,
            &detections,
            &[0, 1],
        );

        assert_eq!(association.matches.len(), 1);
        assert_eq!(association.matches[0].0.track_idx(), 1);
        assert_eq!(association.matches[0].0.detection_idx(), 0);
        assert!(matches!(association.matches[0].1, MatchSource::IoU { .. }));
        assert_eq!(association.unmatched_tracks, vec![0]);
        assert_eq!(association.unmatched_detections, vec![1]);
    }

    #[test]
    fn confidence_tiered_recovers_with_low_confidence() {
        let kf = KalmanFilter::new();
        let metric = NearestNeighborDistanceMetric::default();
        let tracks = vec![
            confirmed_track(&kf, 1, BoundingBox::new(0.0, 0.0, 50.0, 50.0)),
            confirmed_track(&kf, 2, BoundingBox::new(100.0, 100.0, 50.0, 50.0)),
        ];
        let detections = vec![
            // high confidence for track 1
            detection(BoundingBox::new(1.0, 1.0, 50.0, 50.0), 0.9, None),
            // confidence dip for track 2
            detection(BoundingBox::new(101.0, 101.0, 50.0, 50.0), 0.3, None),
            // low confidence noise
            detection(BoundingBox::new(300.0, 300.0, 20.0, 20.0), 0.3, None),
            // below the low threshold
            detection(BoundingBox::new(500.0, 500.0, 20.0, 20.0), 0.05, None),
        ];

        let association = AssociationStrategy::confidence_tiered().associate(
            &kf,
            &metric,
            30,
            &tracks,
            &detections,
            &[0, 1, 2, 3],
        );

        let mut pairs = association
            .matches
            .iter()
            .map(|(m, _)| (m.track_idx(), m.detection_idx()))
            .collect::<Vec<_>>();
        pairs.sort_unstable();
        assert_eq!(pairs, vec![(0, 0), (1, 1)]);
        assert!(association.unmatched_tracks.is_empty());
        assert!(association.unmatched_detections.is_empty());
        let mut discarded = association.discarded_detections.clone();
        discarded.sort_unstable();
        assert_eq!(discarded, vec![2, 3]);
    }

    #[test]
    fn confidence_tiered_second_round_skips_tentative_tracks() {
        let kf = KalmanFilter::new();
        let metric = NearestNeighborDistanceMetric::default();
        let tracks = vec![Track::new(
            &kf,
            1,
            &detection(BoundingBox::new(0.0, 0.0, 50.0, 50.0), 0.9, None),
            3,
            30,
        )];
        let detections = vec![detection(BoundingBox::new(0.0, 0.0, 50.0, 50.0), 0.3, None)];

        let association = AssociationStrategy::confidence_tiered().associate(
            &kf,
            &metric,
            30,
            &tracks,
            &detections,
            &[0],
        );

        assert!(association.matches.is_empty());
        assert_eq!(association.unmatched_tracks, vec![0]);
        assert!(association.unmatched_detections.is_empty());
        assert_eq!(association.discarded_detections, vec![0]);
    }

    #[test]
    fn blended_cost_without_appearance_is_motion_only() {
        let kf = KalmanFilter::new();
        let metric = NearestNeighborDistanceMetric::default();
        let tracks = vec![confirmed_track(&kf, 1, BoundingBox::new(0.0, 0.0, 5.0, 5.0))];
        let detections = vec![detection(
            BoundingBox::new(1.0, 1.0, 5.0, 5.0),
            1.0,
            Some(vec![1.0, 0.0]),
        )];

        let cost = association::blended_cost(&metric, 0.5, &tracks, &detections, &[0], &[0]);
        assert_approx_eq!(cost[[0, 0]], 1.0 - 16.0 / 34.0, 1e-5);
    }

    #[test]
    fn blended_cost_with_appearance() -> Result<()> {
        let kf = KalmanFilter::new();
        let mut metric = NearestNeighborDistanceMetric::default();
        metric.partial_fit(&arr2::<f32, _>(&[[1.0, 0.0]]), &[1], &[1])?;
        let tracks = vec![confirmed_track(&kf, 1, BoundingBox::new(0.0, 0.0, 5.0, 5.0))];
        let detections = vec![
            detection(BoundingBox::new(0.0, 0.0, 5.0, 5.0), 1.0, Some(vec![0.0, 1.0])),
            detection(BoundingBox::new(1.0, 1.0, 5.0, 5.0), 1.0, Some(vec![1.0, 0.0])),
        ];

        let cost =
            association::blended_cost(&metric, 0.5, &tracks, &detections, &[0], &[0, 1]);

        // identical box, orthogonal appearance
        assert_approx_eq!(cost[[0, 0]], 0.5, 1e-5);
        // shifted box, identical appearance
        assert_approx_eq!(cost[[0, 1]], 0.5 * (1.0 - 16.0 / 34.0), 1e-5);

        Ok(())
    }

    #[test]
    fn cascade_prefers_appearance() -> Result<()> {
        let kf = KalmanFilter::new();
        let mut metric = NearestNeighborDistanceMetric::default();
        metric.partial_fit(&arr2::<f32, _>(&[[1.0, 0.0], [0.0, 1.0]]), &[1, 2], &[1, 2])?;

        // two overlapping tracks, appearance breaks the tie
        let tracks = vec![
            confirmed_track(&kf, 1, BoundingBox::new(0.0, 0.0, 50.0, 50.0)),
            confirmed_track(&kf, 2, BoundingBox::new(4.0, 0.0, 50.0, 50.0)),
        ];
        let detections = vec![
            detection(BoundingBox::new(2.0, 0.0, 50.0, 50.0), 1.0, Some(vec![0.0, 1.0])),
            detection(BoundingBox::new(2.0, 0.0, 50.0, 50.0), 1.0, Some(vec![1.0, 0.0])),
        ];

        let association = AssociationStrategy::cascade().associate(
            &kf,
            &metric,
            30,
            &tracks,
            &detections,
            &[0, 1],
        );

        let mut pairs = association
            .matches
            .iter()
            .map(|(m, _)| (m.track_idx(), m.detection_idx()))
            .collect::<Vec<_>>();
        pairs.sort_unstable();
        assert_eq!(pairs, vec![(0, 1), (1, 0)]);
        assert!(association
            .matches
            .iter()
            .all(|(_, source)| matches!(source, MatchSource::Appearance { .. })));

        Ok(())
    }

    #[test]
    fn cascade_matches_unconfirmed_with_iou() {
        let kf = KalmanFilter::new();
        let metric = NearestNeighborDistanceMetric::default();
        let mut tentative = Track::new(
            &kf,
            1,
            &detection(BoundingBox::new(0.0, 0.0, 50.0, 50.0), 1.0, None),
            3,
            30,
        );
        tentative.predict(&kf);
        let tracks = vec![tentative];
        let detections = vec![detection(BoundingBox::new(1.0, 0.0, 50.0, 50.0), 1.0, None)];

        let association = AssociationStrategy::cascade().associate(
            &kf,
            &metric,
            30,
            &tracks,
            &detections,
            &[0],
        );

        assert_eq!(association.matches.len(), 1);
        assert!(matches!(association.matches[0].1, MatchSource::IoU { .. }));
    }

    #[test]
    fn empty_input_is_all_unmatched() {
        let kf = KalmanFilter::new();
        let metric = NearestNeighborDistanceMetric::default();
        let detections = vec![detection(BoundingBox::new(0.0, 0.0, 5.0, 5.0), 0.9, None)];

        for strategy in [
            AssociationStrategy::iou(),
            AssociationStrategy::confidence_tiered(),
            AssociationStrategy::cascade(),
        ] {
            let association = strategy.associate(&kf, &metric, 30, &[], &detections, &[0]);
            assert!(association.matches.is_empty());
            assert_eq!(association.unmatched_detections, vec![0]);
        }
    }

    #[test]
    fn strategy_from_json() -> Result<()> {
        let strategy: AssociationStrategy = serde_json::from_str(
            r#"{"kind": "cascade", "lambda": 0.3, "max_distance": 0.6, "max_iou_distance": 0.7}"#,
        )?;
        assert_eq!(
            strategy,
            AssociationStrategy::Cascade {
                lambda: 0.3,
                max_distance: 0.6,
                max_iou_distance: 0.7
            }
        );
        assert!(strategy.uses_appearance());
        Ok(())
    }
}
