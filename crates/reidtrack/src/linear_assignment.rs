use crate::*;
use fixedbitset::FixedBitSet;
use ndarray::*;
use pathfinding::kuhn_munkres::kuhn_munkres_min;
use pathfinding::matrix::Matrix;

/// Cost given to associations that are infeasible.
pub const INFTY_COST: f32 = 1e5;

/// Costs are scaled to integers for the assignment solver (f32 does not implement `std::cmp::Ord`).
const COST_SCALE: f64 = 1e9;

#[derive(Debug, Clone, Copy)]
pub struct Match {
    track_idx: usize,
    detection_idx: usize,
    distance: f32,
}

impl Match {
    /// Return a new Match
    ///
    /// # Parameters
    ///
    /// - `track_idx`: The match track index.
    /// - `detection_idx`: The match detection index.
    /// - `distance`: The association cost of the pair.
    pub fn new(track_idx: usize, detection_idx: usize, distance: f32) -> Match {
        Match {
            track_idx,
            detection_idx,
            distance,
        }
    }

    /// Return the track index of the match
    pub fn track_idx(&self) -> usize {
        self.track_idx
    }

    /// Return the detection index of the match
    pub fn detection_idx(&self) -> usize {
        self.detection_idx
    }

    /// Return the association cost of the match
    pub fn distance(&self) -> f32 {
        self.distance
    }
}

impl PartialEq for Match {
    fn eq(&self, other: &Self) -> bool {
        self.track_idx == other.track_idx && self.detection_idx == other.detection_idx
    }
}

/// Solve the rectangular linear assignment problem.
///
/// Every row is assigned when there are no more rows than columns (and vice versa), so exactly
/// `min(nrows, ncols)` pairs are returned, minimising their total cost. Ties are resolved by the solver.
///
/// # Returns
///
/// A list of `(row, col)` pairs sorted by row.
pub fn solve(cost_matrix: &ArrayView2<f32>) -> Vec<(usize, usize)> {
    if cost_matrix.is_empty() {
        return vec![];
    }

    // kuhn munkres requires rows <= columns
    let (cost_matrix, transposed) = if cost_matrix.nrows() > cost_matrix.ncols() {
        (cost_matrix.t(), true)
    } else {
        (cost_matrix.view(), false)
    };

    let weights = cost_matrix
        .iter()
        .map(|v| {
            let v = if v.is_nan() { INFTY_COST } else { *v };
            (v.clamp(-INFTY_COST, INFTY_COST) as f64 * COST_SCALE).round() as i64
        })
        .collect::<Vec<i64>>();

    // invoke the kuhn munkres min (aka hungarian) assignment algorithm
    // this is equivalent to `scipy.optimize.linear_sum_assignment(maximise=False)` but where scipy returns two arrays
    // (row_ind and col_ind) `kuhn_munkres_min` returns just the col_ind array leaving row_ind (which is just a row index) to be
    // derived manually.
    let matrix = match Matrix::from_vec(cost_matrix.nrows(), cost_matrix.ncols(), weights) {
        Ok(matrix) => matrix,
        Err(_) => return vec![],
    };
    let (_, col_indices) = kuhn_munkres_min(&matrix);

    let mut pairs = col_indices
        .into_iter()
        .enumerate()
        .map(|(row, col)| if transposed { (col, row) } else { (row, col) })
        .collect::<Vec<_>>();
    pairs.sort_unstable();
    pairs
}

/// Solve linear assignment problem.
///
/// # Parameters
///
/// - `distance_metric` : The distance metric is given a list of tracks and detections as well as a list of N track indices and M detection indices. The metric should return the NxM dimensional cost matrix, where element (i, j) is the association cost between the i-th track in the given track indices and the j-th detection in the given detection_indices.
/// - `max_distance`: Gating threshold. Associations with cost equal to or larger than this value are disregarded.
/// - `tracks`: A list of predicted tracks at the current time step.
/// - `detections`: A list of detections at the current time step.
/// - `track_indices`: List of track indices that maps rows in `cost_matrix` to tracks in `tracks` (see description above).
/// - `detection_indices`: List of detection indices that maps columns in `cost_matrix` to detections in `detections` (see description above).
///
/// # Returns
///
/// A tuple with the following three entries:
///
/// - A list of matched track and detection indices.
/// - A list of unmatched track indices.
/// - A list of unmatched detection indices.
pub fn min_cost_matching<F>(
    distance_metric: F,
    max_distance: f32,
    tracks: &[Track],
    detections: &[Detection],
    track_indices: &[usize],
    detection_indices: &[usize],
) -> (Vec<Match>, Vec<usize>, Vec<usize>)
where
    F: Fn(&[Track], &[Detection], &[usize], &[usize]) -> Array2<f32>,
{
    if detection_indices.is_empty() || track_indices.is_empty() {
        return (vec![], track_indices.to_vec(), detection_indices.to_vec());
    }

    let cost_matrix = (distance_metric)(tracks, detections, track_indices, detection_indices)
        .mapv(|v| if v.is_nan() { max_distance + 1e-5 } else { v.min(max_distance + 1e-5) });

    let mut matched_rows = FixedBitSet::with_capacity(track_indices.len());
    let mut matched_cols = FixedBitSet::with_capacity(detection_indices.len());
    let mut matches: Vec<Match> = vec![];

    solve(&cost_matrix.view())
        .into_iter()
        .for_each(|(row, col)| {
            let distance = cost_matrix[[row, col]];
            if distance < max_distance {
                matched_rows.insert(row);
                matched_cols.insert(col);
                matches.push(Match::new(
                    track_indices[row],
                    detection_indices[col],
                    distance,
                ));
            }
        });

    let unmatched_tracks = track_indices
        .iter()
        .enumerate()
        .filter(|(row, _)| !matched_rows.contains(*row))
        .map(|(_, track_idx)| *track_idx)
        .collect::<Vec<_>>();
    let unmatched_detections = detection_indices
        .iter()
        .enumerate()
        .filter(|(col, _)| !matched_cols.contains(*col))
        .map(|(_, detection_idx)| *detection_idx)
        .collect::<Vec<_>>();

    (matches, unmatched_tracks, unmatched_detections)
}

/// Run matching cascade.
///
/// Tracks are matched in buckets of increasing `time_since_update`, so more recently seen tracks get the first claim on detections.
/// Every bucket is solved on its own against the detections left over by the previous buckets.
///
/// # Parameters
///
/// - `distance_metric`: The distance metric is given a list of tracks and detections as well as a list of N track indices and M detection indices. The metric should return the NxM dimensional cost matrix, where element (i, j) is the association cost between the i-th track in the given track indices and the j-th detection in the given detection indices.
/// - `max_distance`: Gating threshold. Associations with cost equal to or larger than this value are disregarded.
/// - `cascade_depth`: The cascade depth, should be se to the maximum track age.
/// - `tracks`: A list of predicted tracks at the current time step.
/// - `detections`: A list of detections at the current time step.
/// - `track_indices`: List of track indices that maps rows in `cost_matrix` to tracks in `tracks` (see description above).
/// - `detection_indices`: List of detection indices that maps columns in `cost_matrix` to detections in `detections` (see description above).
///
/// # Returns
///
/// A tuple with the following three entries:
/// - A list of matched track and detection indices.
/// - A list of unmatched track indices.
/// - A list of unmatched detection indices.
pub fn matching_cascade<F>(
    distance_metric: F,
    max_distance: f32,
    cascade_depth: usize,
    tracks: &[Track],
    detections: &[Detection],
    track_indices: &[usize],
    detection_indices: &[usize],
) -> (Vec<Match>, Vec<usize>, Vec<usize>)
where
    F: Fn(&[Track], &[Detection], &[usize], &[usize]) -> Array2<f32>,
{
    let mut unmatched_detections = detection_indices.to_vec();
    let mut matches: Vec<Match> = vec![];

    for level in 0..cascade_depth {
        if unmatched_detections.is_empty() {
            // no detections left
            break;
        }

        let track_indices_l = track_indices
            .iter()
            .filter(|track_idx| tracks[**track_idx].time_since_update() == 1 + level)
            .cloned()
            .collect::<Vec<usize>>();
        if track_indices_l.is_empty() {
            // nothing to match at this level
            continue;
        }

        let (matches_l, _, unmatched_detections_l) = min_cost_matching(
            &distance_metric,
            max_distance,
            tracks,
            detections,
            &track_indices_l,
            &unmatched_detections,
        );
        matches.extend(matches_l);
        unmatched_detections = unmatched_detections_l;
    }

    let unmatched_tracks = track_indices
        .iter()
        .filter(|track_idx| !matches.iter().any(|m| m.track_idx == **track_idx))
        .cloned()
        .collect::<Vec<usize>>();

    (matches, unmatched_tracks, unmatched_detections)
}

/// Invalidate infeasible entries in cost matrix based on the state distributions obtained by Kalman filtering.
///
/// # Parameters
///
/// - `kf`: The Kalman filter.
/// - `cost_matrix`: The NxM dimensional cost matrix, where N is the number of track indices and M is the number of detection indices, such that entry (i, j) is the association cost between `tracks[track_indices[i]]` and `detections[detection_indices[j]]`.
/// - `tracks`: A list of predicted tracks at the current time step.
/// - `detections`: A list of detections at the current time step.
/// - `track_indices`: List of track indices that maps rows in `cost_matrix` to tracks in `tracks` (see description above).
/// - `detection_indices`: List of detection indices that maps columns in `cost_matrix` to detections in `detections` (see description above).
/// - `gated_cost`: Entries in the cost matrix corresponding to infeasible associations are set this value. Defaults to `INFTY_COST`.
/// - `only_position`: If true, only the x, y position of the state distribution is considered during gating.
///
/// # Returns
///
/// The modified cost matrix.
#[allow(clippy::too_many_arguments)]
pub fn gate_cost_matrix(
    kf: &KalmanFilter,
    mut cost_matrix: Array2<f32>,
    tracks: &[Track],
    detections: &[Detection],
    track_indices: &[usize],
    detection_indices: &[usize],
    gated_cost: Option<f32>,
    only_position: bool,
) -> Array2<f32> {
    if detection_indices.is_empty() {
        return cost_matrix;
    }

    let gated_cost = gated_cost.unwrap_or(INFTY_COST);
    let gating_dim = if only_position { 2 } else { 4 };
    let gating_threshold = CHI2INV95.get(&gating_dim).copied().unwrap_or(f32::MAX);

    let measurements = Array2::from_shape_fn((detection_indices.len(), 4), |(row, col)| {
        detections[detection_indices[row]].bbox().to_xyah()[col]
    });

    track_indices
        .iter()
        .zip(cost_matrix.rows_mut())
        .for_each(|(track_idx, mut row)| {
            let track = &tracks[*track_idx];
            let gating_distance = kf.gating_distance(
                track.mean(),
                track.covariance(),
                &measurements,
                only_position,
            );
            row.iter_mut()
                .zip(gating_distance.iter())
                .for_each(|(cost, distance)| {
                    if *distance > gating_threshold {
                        *cost = gated_cost;
                    }
                });
        });

    cost_matrix
}

#[cfg(test)]
mod tests {
    use crate::*;
    use itertools::Itertools;
    use ndarray::*;
    use rand::prelude::*;
    use rand_pcg::Pcg32;

    fn track(kf: &KalmanFilter, track_id: TrackId, bbox: BoundingBox) -> Track {
        Track::new(
            kf,
            track_id,
            &Detection::new(None, bbox, 1.0, None, None),
            3,
            30,
        )
    }

    #[test]
    fn min_cost_matching() {
        let kf = KalmanFilter::new();

        let tracks = vec![
            track(&kf, 0, BoundingBox::new(0.0, 0.0, 5.0, 5.0)),
            track(&kf, 1, BoundingBox::new(1.0, 1.0, 5.0, 5.0)),
            track(&kf, 2, BoundingBox::new(20.0, 20.0, 5.0, 5.0)),
        ];
        let detections = vec![
            Detection::new(None, BoundingBox::new(10.0, 10.0, 5.0, 5.0), 1.0, None, None),
            Detection::new(None, BoundingBox::new(0.0, 0.0, 5.0, 5.0), 1.0, None, None),
            Detection::new(None, BoundingBox::new(0.5, 0.5, 5.0, 5.0), 1.0, None, None),
        ];

        let (matches, unmatched_tracks, unmatched_detections) =
            linear_assignment::min_cost_matching(
                iou_matching::iou_cost,
                0.7,
                &tracks,
                &detections,
                &[0, 1, 2],
                &[0, 1, 2],
            );

        assert_eq!(
            matches.iter().map(|m| (m.track_idx(), m.detection_idx())).collect::<Vec<_>>(),
            vec![(0, 1), (1, 2)]
        );
        assert_eq!(unmatched_tracks, vec![2]);
        assert_eq!(unmatched_detections, vec![0]);
    }

    #[test]
    fn min_cost_matching_empty() {
        let kf = KalmanFilter::new();
        let tracks = vec![track(&kf, 0, BoundingBox::new(0.0, 0.0, 5.0, 5.0))];

        let (matches, unmatched_tracks, unmatched_detections) =
            linear_assignment::min_cost_matching(
                iou_matching::iou_cost,
                0.7,
                &tracks,
                &[],
                &[0],
                &[],
            );

        assert!(matches.is_empty());
        assert_eq!(unmatched_tracks, vec![0]);
        assert!(unmatched_detections.is_empty());
    }

    #[test]
    fn matching_cascade() {
        let kf = KalmanFilter::new();

        let mut tracks = vec![
            track(&kf, 0, BoundingBox::new(0.0, 0.0, 5.0, 5.0)),
            track(&kf, 1, BoundingBox::new(0.0, 0.0, 5.0, 5.0)),
        ];
        // track 0 was seen more recently than track 1
        tracks[0].predict(&kf);
        tracks[1].predict(&kf);
        tracks[1].predict(&kf);

        let detections = vec![Detection::new(
            None,
            BoundingBox::new(0.0, 0.0, 5.0, 5.0),
            1.0,
            None,
            None,
        )];

        let (matches, unmatched_tracks, unmatched_detections) =
            linear_assignment::matching_cascade(
                iou_matching::iou_cost,
                0.7,
                30,
                &tracks,
                &detections,
                &[1, 0],
                &[0],
            );

        assert_eq!(matches, vec![Match::new(0, 0, 0.0)]);
        assert_eq!(unmatched_tracks, vec![1]);
        assert!(unmatched_detections.is_empty());
    }

    #[test]
    fn gate_cost_matrix() {
        let kf = KalmanFilter::new();

        let tracks = vec![track(&kf, 0, BoundingBox::new(4.0, 5.0, 6.0, 7.0))];
        let detections = vec![
            Detection::new(None, BoundingBox::new(4.5, 5.5, 6.0, 7.0), 1.0, None, None),
            Detection::new(None, BoundingBox::new(200.0, 200.0, 5.0, 6.0), 1.0, None, None),
        ];

        let cost_matrix = iou_matching::iou_cost(&tracks, &detections, &[0], &[0, 1]);
        let near = cost_matrix[[0, 0]];
        let cost_matrix = linear_assignment::gate_cost_matrix(
            &kf,
            cost_matrix,
            &tracks,
            &detections,
            &[0],
            &[0, 1],
            None,
            false,
        );

        assert_eq!(cost_matrix[[0, 0]], near);
        assert_eq!(cost_matrix[[0, 1]], INFTY_COST);
    }

    fn brute_force_minimum(cost_matrix: &Array2<f32>) -> f32 {
        let (rows, cols) = cost_matrix.dim();
        if rows <= cols {
            (0..cols)
                .permutations(rows)
                .map(|perm| {
                    perm.iter()
                        .enumerate()
                        .map(|(r, c)| cost_matrix[[r, *c]])
                        .sum::<f32>()
                })
                .fold(f32::MAX, f32::min)
        } else {
            (0..rows)
                .permutations(cols)
                .map(|perm| {
                    perm.iter()
                        .enumerate()
                        .map(|(c, r)| cost_matrix[[*r, c]])
                        .sum::<f32>()
                })
                .fold(f32::MAX, f32::min)
        }
    }

    #[test]
    fn solve_is_optimal() {
        let mut rng = Pcg32::seed_from_u64(42);

        for _ in 0..200 {
            let rows = rng.gen_range(1..=6);
            let cols = rng.gen_range(1..=6);
            let cost_matrix = Array2::from_shape_fn((rows, cols), |_| rng.gen::<f32>());

            let assignment = linear_assignment::solve(&cost_matrix.view());
            assert_eq!(assignment.len(), rows.min(cols));
            assert_eq!(
                assignment.iter().map(|(r, _)| r).unique().count(),
                assignment.len()
            );
            assert_eq!(
                assignment.iter().map(|(_, c)| c).unique().count(),
                assignment.len()
            );

            let total: f32 = assignment.iter().map(|(r, c)| cost_matrix[[*r, *c]]).sum();
            assert!(total <= brute_force_minimum(&cost_matrix) + 1e-4);
        }
    }

    #[test]
    fn solve_empty() {
        assert!(linear_assignment::solve(&Array2::<f32>::zeros((0, 3)).view()).is_empty());
    }
}
