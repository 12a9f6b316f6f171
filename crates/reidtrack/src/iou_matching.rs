use crate::*;
use ndarray::*;

/// Compute intersection over union.
///
/// # Parameters
///
/// * `bbox`: A bounding box in format `(top left x, top left y, width, height)`.
/// * `candidates`: A matrix of candidate bounding boxes (one per row) in the same format as `bbox`.
///
/// # Returns
///
/// The intersection over union in [0.0, 1.0] between the `bbox` and each candidate. A higher score means a larger fraction of the `bbox` is occluded by the candidate.
pub fn intersection_over_union(bbox: &Array1<f32>, candidates: &Array2<f32>) -> Array1<f32> {
    let bbox_tl = bbox.slice(s![..2]).to_owned();
    let bbox_br = &bbox_tl + &bbox.slice(s![2..4]);
    let candidates_tl = candidates.slice(s![.., 0..2]).to_owned();
    let candidates_br = &candidates_tl + &candidates.slice(s![.., 2..4]);

    let tl = stack![
        Axis(1),
        candidates_tl.slice(s![.., 0]).mapv(|v| v.max(bbox_tl[0])),
        candidates_tl.slice(s![.., 1]).mapv(|v| v.max(bbox_tl[1]))
    ];
    let br = stack![
        Axis(1),
        candidates_br.slice(s![.., 0]).mapv(|v| v.min(bbox_br[0])),
        candidates_br.slice(s![.., 1]).mapv(|v| v.min(bbox_br[1]))
    ];
    let wh = (br - tl).mapv(|v| v.max(0.0));

    let area_intersection = wh.map_axis(Axis(1), |v| v[0] * v[1]);
    let area_bbox = bbox[2] * bbox[3];
    let area_candidates = candidates.map_axis(Axis(1), |v| v[2] * v[3]);

    let union = area_bbox + &area_candidates - &area_intersection;
    Zip::from(&area_intersection)
        .and(&union)
        .map_collect(|&intersection, &union| {
            if union > 0.0 {
                intersection / union
            } else {
                0.0
            }
        })
}

/// Intersection over union distance metric.
///
/// # Parameters
///
/// * `tracks`: A list of tracks.
/// * `detections`: A list of detections.
/// * `track_indices`: A list of indices to tracks that should be matched.
/// * `detection_indices`: A list of indices to detections that should be matched.
///
/// # Returns
///
/// A cost matrix of shape track_indices.len(), detection_indices.len() where entry (i, j) is:
/// `1 - iou(tracks[track_indices[i]], detections[detection_indices[j]])`.
pub fn iou_cost(
    tracks: &[Track],
    detections: &[Detection],
    track_indices: &[usize],
    detection_indices: &[usize],
) -> Array2<f32> {
    let mut cost_matrix = Array2::<f32>::zeros((track_indices.len(), detection_indices.len()));
    if detection_indices.is_empty() {
        return cost_matrix;
    }

    let candidates = Array2::from_shape_fn((detection_indices.len(), 4), |(row, col)| {
        detections[detection_indices[row]].bbox().to_tlwh()[col]
    });

    track_indices
        .iter()
        .zip(cost_matrix.rows_mut())
        .for_each(|(track_idx, mut row)| {
            let iou = intersection_over_union(&tracks[*track_idx].bbox().to_tlwh(), &candidates);
            row.assign(&(1.0 - iou));
        });

    cost_matrix
}
