//! Decaying constant-velocity motion model for pose prediction.
//!
//! Velocity lives in the pose tangent space (translation-first 6-vector),
//! assuming one frame per time unit; skipped frames are not compensated.

use nalgebra::{Vector3, Vector6};

use crate::geometry::SE3;

/// Global damping applied to the blended velocity, keeping extrapolation
/// from running away during short tracking gaps.
const VELOCITY_DECAY: f64 = 0.9;

/// Blend fraction between the newly realized motion and the old velocity.
const MOTION_BLEND: f64 = 0.5;

/// Constant-velocity model with exponential decay.
#[derive(Debug, Clone, Default)]
pub struct MotionModel {
    /// Current velocity estimate (tangent-space, per frame).
    velocity: Vector6<f64>,

    /// Magnitude of the raw velocity estimate.
    velocity_magnitude: f64,

    /// Velocity magnitude with the translational part divided by the mean
    /// scene depth; gates the coarse tracking stage, since translation is
    /// visually less significant when the scene is far away.
    scaled_velocity_magnitude: f64,
}

impl MotionModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn velocity(&self) -> &Vector6<f64> {
        &self.velocity
    }

    pub fn scaled_velocity_magnitude(&self) -> f64 {
        self.scaled_velocity_magnitude
    }

    /// Predict the pose for the incoming frame from the previous one.
    ///
    /// When a rotation seed from the global rotation estimator is supplied,
    /// it overrides the rotational velocity, and translation along the
    /// first two axes is zeroed: the estimator is trusted for rotation but
    /// not for translation.
    pub fn predict(&self, previous: &SE3, rotation_seed: Option<&Vector3<f64>>) -> SE3 {
        let mut v = self.velocity;
        if let Some(w) = rotation_seed {
            v[0] = 0.0;
            v[1] = 0.0;
            v[3] = w.x;
            v[4] = w.y;
            v[5] = w.z;
        }
        SE3::exp(&v) * previous.clone()
    }

    /// Fold the realized frame motion into the velocity estimate.
    pub fn update(&mut self, refined: &SE3, start: &SE3, scene_depth_mean: f64) {
        let motion = (refined * &start.inverse()).ln();

        self.velocity = VELOCITY_DECAY * (MOTION_BLEND * motion + (1.0 - MOTION_BLEND) * self.velocity);
        self.velocity_magnitude = self.velocity.norm();

        let mut scaled = self.velocity;
        for i in 0..3 {
            scaled[i] /= scene_depth_mean;
        }
        self.scaled_velocity_magnitude = scaled.norm();
    }

    /// Zero the velocity estimate, e.g. after relocalization.
    pub fn reset(&mut self) {
        self.velocity = Vector6::zeros();
        self.velocity_magnitude = 0.0;
        self.scaled_velocity_magnitude = 0.0;
    }
}
