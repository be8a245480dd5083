//! SE(3) rigid-body transform with tangent-space exponential/logarithm maps.
//!
//! Poses are camera-from-world transforms. The 6-vector tangent convention
//! is translation-first: `mu = (u_x, u_y, u_z, w_x, w_y, w_z)`, so that
//! `velocity[0..3]` is translational and `velocity[3..6]` rotational.
//! Incremental updates compose on the left: `pose' = SE3::exp(mu) * pose`.

use std::ops::Mul;

use nalgebra::{UnitQuaternion, Vector3, Vector6};

use super::so3::{left_jacobian_se3, left_jacobian_se3_inv};

/// A rigid-body transform (rotation + translation).
#[derive(Debug, Clone, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// The identity transform.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Exponential map from a 6-vector tangent update (translation-first)
    /// to a transform increment.
    pub fn exp(mu: &Vector6<f64>) -> Self {
        let u = Vector3::new(mu[0], mu[1], mu[2]);
        let w = Vector3::new(mu[3], mu[4], mu[5]);

        Self {
            rotation: UnitQuaternion::from_scaled_axis(w),
            translation: left_jacobian_se3(&w) * u,
        }
    }

    /// Logarithm map back to the 6-vector tangent space.
    pub fn ln(&self) -> Vector6<f64> {
        let w = self.rotation.scaled_axis();
        let u = left_jacobian_se3_inv(&w) * self.translation;

        Vector6::new(u.x, u.y, u.z, w.x, w.y, w.z)
    }

    /// Inverse transform.
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Apply the transform to a 3D point.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// True when every component of the transform is finite.
    ///
    /// A non-finite pose is a hard failure of the estimate that produced it;
    /// callers must discard the update rather than propagate it.
    pub fn is_finite(&self) -> bool {
        self.rotation.coords.iter().all(|c| c.is_finite())
            && self.translation.iter().all(|c| c.is_finite())
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl Mul<&SE3> for &SE3 {
    type Output = SE3;

    fn mul(self, rhs: &SE3) -> SE3 {
        SE3 {
            rotation: self.rotation * rhs.rotation,
            translation: self.rotation * rhs.translation + self.translation,
        }
    }
}

impl Mul<SE3> for SE3 {
    type Output = SE3;

    fn mul(self, rhs: SE3) -> SE3 {
        &self * &rhs
    }
}
