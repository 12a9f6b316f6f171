use crate::TrackId;
use crate::Result;
use ndarray::*;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Cosine,
    Euclidean,
}

/// Normalize each row of `x` to unit length. Zero rows are left untouched.
pub(crate) fn normalize_rows(x: &Array2<f32>) -> Array2<f32> {
    let mut normalized = x.to_owned();
    normalized.rows_mut().into_iter().for_each(|mut row| {
        let norm = row.dot(&row).sqrt();
        if norm > 0.0 {
            row.mapv_inplace(|v| v / norm);
        }
    });
    normalized
}

/// Compute pair-wise cosine distance between points in `a` and `b`.
///
/// # Parameters
///
/// * `x`: A matrix of N non-normalized row-vectors (sample points).
/// * `y`: A matrix of M non-normalized row-vectors (query points).
///
/// # Returns
///
/// A vector of length M that contains for each entry in `y` the smallest cosine distance to a sample in `x`.
fn cosine_distance(x: &Array2<f32>, y: &Array2<f32>) -> Array1<f32> {
    let x_norm = normalize_rows(x);
    let y_norm = normalize_rows(y);

    let distances = 1.0 - x_norm.dot(&y_norm.t());

    distances.fold_axis(Axis(0), f32::MAX, |&accumulator, &value| {
        accumulator.min(value)
    })
}

/// Compute pair-wise sqauared distance between points in `a` and `b`.
///
/// # Parameters
///
/// * `x`: A matrix of N row-vectors (sample points).
/// * `y`: A matrix of M row-vectors (query points).
///
/// # Returns
///
/// A vector of length M that contains for each entry in `y` the smallest Euclidean distance to a sample in `x`.
fn euclidean_distance(x: &Array2<f32>, y: &Array2<f32>) -> Array1<f32> {
    let x2 = x.mapv(|v| v.powi(2)).sum_axis(Axis(1)).insert_axis(Axis(0));
    let y2 = y.mapv(|v| v.powi(2)).sum_axis(Axis(1)).insert_axis(Axis(0));

    let res = -2.0 * x.dot(&y.t()) + x2.t() + y2;
    let distances = res.mapv(|v| v.max(0.0));

    distances.fold_axis(Axis(0), f32::MAX, |&accumulator, &value| {
        accumulator.min(value)
    })
}

/// A nearest neighbor distance metric that, for each target, returns the closest distance to any sample that has been observed so far.
///
/// This is the appearance half of the cascade cost. Samples are keyed by track id.
#[derive(Clone)]
pub struct NearestNeighborDistanceMetric {
    /// Either Cosine or Euclidean distance.
    metric: Metric,
    /// If not None, fix samples per class to at most this number. Removes the oldest samples when the budget is reached.
    budget: Option<usize>,
    /// A HashMap that maps from target identities to the list of samples that have been observed so far.
    samples: HashMap<TrackId, Array2<f32>>,
}

impl Default for NearestNeighborDistanceMetric {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl fmt::Debug for NearestNeighborDistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NearestNeighborDistanceMetric")
            .field("metric", &self.metric)
            .field("budget", &self.budget)
            .field("targets", &self.samples.len())
            .finish()
    }
}

impl NearestNeighborDistanceMetric {
    /// Returns a new NearestNeighborDistanceMetric
    ///
    /// # Parameters
    ///
    /// * `metric`: Either `Metric::Euclidean` or `Metric::Cosine`. Default `Metric::Cosine`.
    /// * `budget`: If not None, fix samples per class to at most this number. Removes the oldest samples when the budget is reached.
    pub fn new(metric: Option<Metric>, budget: Option<usize>) -> NearestNeighborDistanceMetric {
        NearestNeighborDistanceMetric {
            metric: metric.unwrap_or(Metric::Cosine),
            budget,
            samples: HashMap::new(),
        }
    }

    /// Set metric
    pub fn with_metric(&mut self, metric: Metric) -> &mut Self {
        self.metric = metric;
        self
    }

    /// Set budget
    pub fn with_budget(&mut self, budget: usize) -> &mut Self {
        self.budget = Some(budget);
        self
    }

    /// Return the stored feature vectors for a given track identifier
    pub fn track_features(&self, track_id: TrackId) -> Option<&Array2<f32>> {
        self.samples.get(&track_id)
    }

    /// Returns true if at least one sample has been observed for the target
    pub fn has_samples(&self, track_id: TrackId) -> bool {
        self.samples
            .get(&track_id)
            .map(|samples| samples.nrows() > 0)
            .unwrap_or(false)
    }

    /// Update the distance metric with new data.
    ///
    /// # Parameters
    ///
    /// * `features`: An NxM matrix of N features of dimensionality M.
    /// * `targets`: An integer array of associated target identities.
    /// * `active_targets`: A list of targets that are currently present in the scene.
    pub fn partial_fit(
        &mut self,
        features: &Array2<f32>,
        targets: &[TrackId],
        active_targets: &[TrackId],
    ) -> Result<()> {
        targets
            .iter()
            .zip(features.rows())
            .try_for_each(|(target, feature)| -> Result<()> {
                let target_features = self
                    .samples
                    .entry(*target)
                    .or_insert_with(|| Array2::<f32>::zeros((0, feature.len())));

                // vectors of a different length cannot be compared so the cache restarts
                if target_features.ncols() != feature.len() {
                    *target_features = Array2::<f32>::zeros((0, feature.len()));
                }
                target_features.push_row(feature)?;

                // if budget is set truncate num rows from the top (oldest)
                if let Some(budget) = self.budget {
                    if target_features.nrows() > budget {
                        let start = target_features.nrows() - budget;
                        target_features.slice_collapse(s![start.., ..]);
                    }
                }

                Ok(())
            })?;

        self.samples.retain(|k, _| active_targets.contains(k));

        Ok(())
    }

    /// Compute distance between features and targets.
    ///
    /// # Parameters
    ///
    /// * `features`: An NxM matrix of N features of dimensionality M.
    /// * `targets`: A list of targets to match the given `features` against.
    ///
    /// # Returns
    ///
    /// A cost matrix of shape len(targets), len(features), where element (i, j) contains the closest distance between `targets[i]` and `features[j]`.
    /// Targets without samples get a distance of `1.0` to every feature.
    pub fn distance(&self, features: &Array2<f32>, targets: &[TrackId]) -> Array2<f32> {
        let metric_fn = match self.metric {
            Metric::Cosine => cosine_distance,
            Metric::Euclidean => euclidean_distance,
        };

        let mut cost_matrix = Array2::<f32>::ones((targets.len(), features.nrows()));
        targets
            .iter()
            .zip(cost_matrix.rows_mut())
            .for_each(|(target, mut row)| {
                if let Some(samples) = self.samples.get(target) {
                    if samples.nrows() > 0 && samples.ncols() == features.ncols() {
                        row.assign(&metric_fn(samples, features));
                    }
                }
            });

        cost_matrix
    }
}
