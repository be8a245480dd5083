//! SO(3) helpers shared by the SE(3) exponential/logarithm maps.

use nalgebra::{Matrix3, Vector3};

/// Angle below which Taylor expansions replace the closed-form coefficients.
const SMALL_ANGLE_THRESHOLD: f64 = 1e-8;

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Left Jacobian V(φ) of SE(3), relating the translational part of the
/// tangent vector to the translation of the transform:
///
/// ```text
/// V(φ) = I + (1 - cos|φ|)/|φ|² [φ]× + (|φ| - sin|φ|)/|φ|³ [φ]×²
/// ```
pub fn left_jacobian_se3(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let skew_phi = skew(phi);

    if theta < SMALL_ANGLE_THRESHOLD {
        return Matrix3::identity() + 0.5 * skew_phi + (1.0 / 6.0) * skew_phi * skew_phi;
    }

    let theta_sq = theta * theta;
    let theta_cu = theta_sq * theta;

    Matrix3::identity()
        + ((1.0 - theta.cos()) / theta_sq) * skew_phi
        + ((theta - theta.sin()) / theta_cu) * skew_phi * skew_phi
}

/// Inverse of the left Jacobian V⁻¹(φ).
///
/// ```text
/// V⁻¹(φ) = I - 0.5 [φ]× + (1/|φ|² - (1 + cos|φ|)/(2|φ| sin|φ|)) [φ]×²
/// ```
pub fn left_jacobian_se3_inv(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let skew_phi = skew(phi);

    if theta < SMALL_ANGLE_THRESHOLD {
        return Matrix3::identity() - 0.5 * skew_phi + (1.0 / 12.0) * skew_phi * skew_phi;
    }

    let theta_sq = theta * theta;
    let coeff = 1.0 / theta_sq - (1.0 + theta.cos()) / (2.0 * theta * theta.sin());

    Matrix3::identity() - 0.5 * skew_phi + coeff * skew_phi * skew_phi
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_skew_cross_product() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let u = Vector3::new(4.0, 5.0, 6.0);

        assert_relative_eq!(v.cross(&u), skew(&v) * u, epsilon = 1e-12);
    }

    #[test]
    fn test_left_jacobian_identity_at_zero() {
        let phi = Vector3::zeros();
        assert_relative_eq!(left_jacobian_se3(&phi), Matrix3::identity(), epsilon = 1e-10);
        assert_relative_eq!(
            left_jacobian_se3_inv(&phi),
            Matrix3::identity(),
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_left_jacobian_inverse_relationship() {
        let phi = Vector3::new(0.3, -0.2, 0.5);
        let product = left_jacobian_se3(&phi) * left_jacobian_se3_inv(&phi);
        assert_relative_eq!(product, Matrix3::identity(), epsilon = 1e-10);
    }

    #[test]
    fn test_left_jacobian_small_angle_consistency() {
        // The Taylor branch must agree with the closed form near the threshold.
        let phi = Vector3::new(2e-8, -1e-8, 1.5e-8);
        let phi_scaled = phi * 10.0;

        let taylor = left_jacobian_se3(&phi);
        let exact = left_jacobian_se3(&phi_scaled);

        assert_relative_eq!(taylor, Matrix3::identity(), epsilon = 1e-7);
        assert_relative_eq!(exact, Matrix3::identity(), epsilon = 1e-6);
    }
}
