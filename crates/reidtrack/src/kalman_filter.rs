use crate::BoundingBox;
use nalgebra::{DMatrix, DVector, Matrix4, SMatrix};
use ndarray::*;
use std::collections::HashMap;
use tracing::warn;

lazy_static! {
    /**
    Table for the 0.95 quantile of the chi-square distribution with N degrees of freedom (contains values for N=1, ..., 9).
    Taken from MATLAB/Octave's chi2inv function and used as Mahalanobis gating threshold.
    */
    pub static ref CHI2INV95: HashMap<usize, f32> = HashMap::from([
        (1, 3.8415),
        (2, 5.9915),
        (3, 7.8147),
        (4, 9.4877),
        (5, 11.070),
        (6, 12.592),
        (7, 14.067),
        (8, 15.507),
        (9, 16.919),
    ]);
}

/**
A simple Kalman filter for tracking bounding boxes in image space.

The 8-dimensional state space:
    x, y, a, h, vx, vy, va, vh
contains the bounding box center position (x, y), aspect ratio a, height h, and their respective velocities.

Object motion follows a constant velocity model. The bounding box location (x, y, a, h) is taken as direct observation of the state space (linear observation model).

A freshly initiated state has zero velocity, so until the first measurement update a track predicts by holding its position.
*/
#[derive(Debug, Clone)]
pub struct KalmanFilter {
    motion_mat: Array2<f32>,
    update_mat: Array2<f32>,
    std_weight_position: f32,
    std_weight_velocity: f32,
}

impl Default for KalmanFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl KalmanFilter {
    /// Returns a new KalmanFilter
    pub fn new() -> KalmanFilter {
        let ndim = 4;

        // Create Kalman filter model matrices and set initial values
        let mut motion_mat = Array2::from_diag(&Array1::<f32>::ones(2 * ndim));
        for i in 0..ndim {
            motion_mat[[i, ndim + i]] = 1.0;
        }

        let update_mat = concatenate!(
            Axis(1),
            Array2::from_diag(&Array1::<f32>::ones(ndim)),
            Array2::zeros((ndim, ndim))
        );

        // Motion and observation uncertainty are chosen relative to the current
        // state estimate. These weights control the amount of uncertainty in
        // the model.
        let std_weight_position = 1.0 / 20.0;
        let std_weight_velocity = 1.0 / 160.0;

        KalmanFilter {
            motion_mat,
            update_mat,
            std_weight_position,
            std_weight_velocity,
        }
    }

    /// Create track from unassociated measurement.
    ///
    /// # Arguments
    ///
    /// - `bbox`: Bounding box object of the new measurement.
    ///
    /// # Returns
    ///
    /// A tuple with the following two entries of the new track:
    /// - The mean vector (8 dimensional).
    /// - The covariance matrix (8x8 dimensional).
    ///
    /// Unobserved velocities are initialized to 0 mean.
    pub fn initiate(&self, bbox: &BoundingBox) -> (Array1<f32>, Array2<f32>) {
        let mean_pos = bbox.to_xyah();
        let mean_vel = Array1::<f32>::zeros(mean_pos.raw_dim());
        let mean = concatenate![Axis(0), mean_pos, mean_vel];

        let std = arr1::<f32>(&[
            2.0 * self.std_weight_position * mean_pos[3],
            2.0 * self.std_weight_position * mean_pos[3],
            1e-2,
            2.0 * self.std_weight_position * mean_pos[3],
            10.0 * self.std_weight_velocity * mean_pos[3],
            10.0 * self.std_weight_velocity * mean_pos[3],
            1e-5,
            10.0 * self.std_weight_velocity * mean_pos[3],
        ]);

        let covariance = Array2::from_diag(&std.mapv(|v| v.powi(2)));

        (mean, covariance)
    }

    /// Run Kalman filter prediction step.
    ///
    /// If applying the aspect ratio or height velocity would make the box degenerate
    /// (non-positive width or height) that velocity is zeroed before the step.
    ///
    /// # Arguments
    ///
    /// - `mean`: The 8 dimensional mean vector of the object state at the previous time step.
    /// - `covariance`: The 8x8 dimensional covariance matrix of the object state at the previous time step.
    ///
    /// # Returns
    ///
    /// A tuple with the following two entries of the predicted state:
    /// - The mean vector (8 dimensional).
    /// - The covariance matrix (8x8 dimensional).
    pub fn predict(
        &self,
        mean: &Array1<f32>,
        covariance: &Array2<f32>,
    ) -> (Array1<f32>, Array2<f32>) {
        let mut mean = mean.to_owned();
        if mean[2] + mean[6] <= 0.0 {
            mean[6] = 0.0;
        }
        if mean[3] + mean[7] <= 0.0 {
            mean[7] = 0.0;
        }

        let std_pos = arr1::<f32>(&[
            self.std_weight_position * mean[3],
            self.std_weight_position * mean[3],
            1e-2,
            self.std_weight_position * mean[3],
        ]);

        let std_vel = arr1::<f32>(&[
            self.std_weight_velocity * mean[3],
            self.std_weight_velocity * mean[3],
            1e-5,
            self.std_weight_velocity * mean[3],
        ]);

        let motion_cov =
            Array2::from_diag(&concatenate![Axis(0), std_pos, std_vel].mapv(|v| v.powi(2)));

        let mean = self.motion_mat.dot(&mean);
        let covariance = self.motion_mat.dot(covariance).dot(&self.motion_mat.t()) + motion_cov;

        (mean, covariance)
    }

    /// Project state distribution to measurement space.
    ///
    /// # Arguments
    ///
    /// - `mean`: The state's mean vector (8 dimensional array).
    /// - `covariance`: The state's covariance matrix (8x8 dimensional).
    ///
    /// # Returns
    ///
    /// A tuple with the following two entries of the given state estimate:
    /// - The mean vector (4 dimensional).
    /// - The covariance matrix (4x4 dimensional).
    pub fn project(
        &self,
        mean: &Array1<f32>,
        covariance: &Array2<f32>,
    ) -> (Array1<f32>, Array2<f32>) {
        let std = arr1::<f32>(&[
            self.std_weight_position * mean[3],
            self.std_weight_position * mean[3],
            1e-1,
            self.std_weight_position * mean[3],
        ]);

        let innovation_cov = Array2::from_diag(&std.mapv(|v| v.powi(2)));

        let mean = self.update_mat.dot(mean);
        let covariance = self.update_mat.dot(covariance).dot(&self.update_mat.t()) + innovation_cov;

        (mean, covariance)
    }

    /// Run Kalman filter correction step.
    ///
    /// The innovation covariance is factorized with a Cholesky decomposition. If it is not positive definite
    /// the measurement is ignored and the predicted state is returned unchanged.
    ///
    /// # Arguments
    ///
    /// - `mean`: The state's mean vector (8 dimensional array).
    /// - `covariance`: The state's covariance matrix (8x8 dimensional).
    /// - `measurement`: The 4 dimensional measurement vector (x, y, a, h), where (x, y) is the center position, a the aspect ratio, and h the height of the bounding box.
    ///
    /// # Returns
    ///
    /// A tuple with the following two entries of the measurement-corrected state distribution:
    /// - The mean vector (8 dimensional).
    /// - The covariance matrix (8x8 dimensional).
    pub fn update(
        &self,
        mean: &Array1<f32>,
        covariance: &Array2<f32>,
        measurement: &Array1<f32>,
    ) -> (Array1<f32>, Array2<f32>) {
        let (projected_mean, projected_cov) = self.project(mean, covariance);

        let cholesky_factor = match Matrix4::from_fn(|i, j| projected_cov[[i, j]]).cholesky() {
            Some(factor) => factor,
            None => {
                warn!("innovation covariance is not positive definite, skipping correction");
                return (mean.to_owned(), covariance.to_owned());
            }
        };

        // solve S * K^T = (P * H^T)^T for the 8x4 kalman gain K
        let covariance_dot = covariance.dot(&self.update_mat.t());
        let rhs = SMatrix::<f32, 4, 8>::from_fn(|i, j| covariance_dot[[j, i]]);
        let gain_t = cholesky_factor.solve(&rhs);
        let kalman_gain = Array2::from_shape_fn((8, 4), |(i, j)| gain_t[(j, i)]);

        let innovation = measurement - &projected_mean;

        let new_mean = mean + &kalman_gain.dot(&innovation);
        let new_covariance = covariance - &kalman_gain.dot(&projected_cov).dot(&kalman_gain.t());

        (new_mean, new_covariance)
    }

    /// Compute gating distance between state distribution and measurements.
    ///
    /// # Parameters
    ///
    /// - `mean`: Mean vector over the state distribution (8 dimensional).
    /// - `covariance`: Covariance of the state distribution (8x8 dimensional).
    /// - `measurements`: An Nx4 dimensional matrix of N measurements, each in format (x, y, a, h) where (x, y) is the bounding box center position, a the aspect ratio, and h the height.
    /// - `only_position`: If true, distance computation is done with respect to the bounding box center position only.
    ///
    /// # Returns
    ///
    /// An array of length N, where the i-th element contains the squared Mahalanobis distance between (mean, covariance) and `measurements[i]`.
    /// Returns `f32::MAX` for every measurement when the projected covariance cannot be factorized.
    pub fn gating_distance(
        &self,
        mean: &Array1<f32>,
        covariance: &Array2<f32>,
        measurements: &Array2<f32>,
        only_position: bool,
    ) -> Array1<f32> {
        let (mean, covariance) = self.project(mean, covariance);
        let ndim = if only_position { 2 } else { 4 };

        let cholesky_factor = match DMatrix::from_fn(ndim, ndim, |i, j| covariance[[i, j]])
            .cholesky()
        {
            Some(factor) => factor,
            None => return Array1::from_elem(measurements.nrows(), f32::MAX),
        };

        measurements
            .rows()
            .into_iter()
            .map(|measurement| {
                let d = DVector::from_fn(ndim, |i, _| measurement[i] - mean[i]);
                let z = cholesky_factor.solve(&d);
                d.dot(&z)
            })
            .collect()
    }
}
