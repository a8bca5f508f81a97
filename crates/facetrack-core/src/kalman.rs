//! Constant-velocity Kalman filter for per-track motion estimation.
//!
//! State vector `[x, y, vx, vy]` with the face center observed directly.
//! Each track exclusively owns one estimator; the filter is purely numeric
//! and deterministic given its inputs.

use nalgebra::{Matrix2, Matrix2x4, Matrix4, Matrix4x2, Vector2, Vector4};

/// Noise configuration for the motion estimator.
#[derive(Debug, Clone, Copy)]
pub struct MotionNoise {
    /// Process noise added to the position entries of the covariance per predict.
    pub process_pos: f32,
    /// Process noise added to the velocity entries of the covariance per predict.
    pub process_vel: f32,
    /// Measurement noise of the observed center position.
    pub measurement: f32,
}

impl Default for MotionNoise {
    fn default() -> Self {
        Self {
            process_pos: 1.0,
            process_vel: 0.1,
            measurement: 1.0,
        }
    }
}

/// Kalman filter over `[x, y, vx, vy]` with a constant-velocity transition.
#[derive(Debug, Clone)]
pub struct MotionEstimator {
    mean: Vector4<f32>,
    covariance: Matrix4<f32>,
    noise: MotionNoise,
}

impl MotionEstimator {
    /// Initialize from the first observation: zero velocity, identity covariance.
    pub fn new(x: f32, y: f32, noise: MotionNoise) -> Self {
        Self {
            mean: Vector4::new(x, y, 0.0, 0.0),
            covariance: Matrix4::identity(),
            noise,
        }
    }

    fn transition() -> Matrix4<f32> {
        // x += vx, y += vy, velocities unchanged.
        let mut f = Matrix4::identity();
        f[(0, 2)] = 1.0;
        f[(1, 3)] = 1.0;
        f
    }

    fn observation() -> Matrix2x4<f32> {
        // Only [x, y] is observed.
        let mut h = Matrix2x4::zeros();
        h[(0, 0)] = 1.0;
        h[(1, 1)] = 1.0;
        h
    }

    /// Advance one frame: apply the constant-velocity transition and inflate
    /// the covariance by process noise.
    pub fn predict(&mut self) {
        let f = Self::transition();
        self.mean = f * self.mean;

        let mut q = Matrix4::zeros();
        q[(0, 0)] = self.noise.process_pos;
        q[(1, 1)] = self.noise.process_pos;
        q[(2, 2)] = self.noise.process_vel;
        q[(3, 3)] = self.noise.process_vel;

        self.covariance = f * self.covariance * f.transpose() + q;
    }

    /// Fold in a measured center position.
    ///
    /// A numerically singular innovation matrix skips the update rather than
    /// panicking; the predicted state stands until the next measurement.
    pub fn update(&mut self, measured_x: f32, measured_y: f32) {
        let h = Self::observation();
        let r = Matrix2::identity() * self.noise.measurement;

        let innovation_cov = h * self.covariance * h.transpose() + r;
        let Some(inv) = innovation_cov.try_inverse() else {
            tracing::debug!("singular innovation covariance, skipping kalman update");
            return;
        };

        let gain: Matrix4x2<f32> = self.covariance * h.transpose() * inv;
        let measurement = Vector2::new(measured_x, measured_y);
        let innovation = measurement - h * self.mean;

        self.mean += gain * innovation;
        self.covariance = (Matrix4::identity() - gain * h) * self.covariance;
    }

    /// Current estimated center position.
    pub fn position(&self) -> (f32, f32) {
        (self.mean[0], self.mean[1])
    }

    /// Current estimated velocity (dx, dy) in pixels per frame.
    pub fn velocity(&self) -> (f32, f32) {
        (self.mean[2], self.mean[3])
    }
}
