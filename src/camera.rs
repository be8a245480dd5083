//! Pinhole camera model: projection, unprojection and projection derivatives.
//!
//! The tracker treats the camera as a capability: project a camera-frame 3D
//! point to a pixel, unproject a pixel to a ray, and provide the analytic
//! derivative of the projection with respect to the camera-frame point.

use nalgebra::{Matrix2x3, Vector2, Vector3};

/// Minimum depth in front of the camera for a projection to be valid.
const MIN_DEPTH: f64 = 1e-6;

/// Camera intrinsics and configured image size.
#[derive(Debug, Clone, Copy)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    width: u32,
    height: u32,
}

impl CameraModel {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, width: u32, height: u32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            width,
            height,
        }
    }

    /// Reconfigure the expected image resolution.
    pub fn set_image_size(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }

    pub fn image_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Project a camera-frame point to pixel coordinates.
    ///
    /// Returns `None` for points at or behind the camera plane.
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p_cam.z < MIN_DEPTH {
            return None;
        }
        Some(Vector2::new(
            self.fx * p_cam.x / p_cam.z + self.cx,
            self.fy * p_cam.y / p_cam.z + self.cy,
        ))
    }

    /// Unproject a pixel to a camera-frame ray with unit depth.
    pub fn unproject(&self, uv: &Vector2<f64>) -> Vector3<f64> {
        Vector3::new((uv.x - self.cx) / self.fx, (uv.y - self.cy) / self.fy, 1.0)
    }

    /// Analytic derivative of the projection with respect to the
    /// camera-frame point, evaluated at `p_cam`:
    ///
    /// ```text
    /// d(u,v)/d(x,y,z) = | fx/z    0   -fx·x/z² |
    ///                   |   0   fy/z  -fy·y/z² |
    /// ```
    pub fn projection_derivs(&self, p_cam: &Vector3<f64>) -> Matrix2x3<f64> {
        let z_inv = 1.0 / p_cam.z;
        Matrix2x3::new(
            self.fx * z_inv,
            0.0,
            -self.fx * p_cam.x * z_inv * z_inv,
            0.0,
            self.fy * z_inv,
            -self.fy * p_cam.y * z_inv * z_inv,
        )
    }

    /// Whether a pixel position lies inside the image, keeping `margin`
    /// pixels clear of every border.
    pub fn in_image(&self, uv: &Vector2<f64>, margin: f64) -> bool {
        uv.x >= margin
            && uv.y >= margin
            && uv.x <= self.width as f64 - 1.0 - margin
            && uv.y <= self.height as f64 - 1.0 - margin
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn camera() -> CameraModel {
        CameraModel::new(400.0, 420.0, 320.0, 240.0, 640, 480)
    }

    #[test]
    fn test_project_unproject_round_trip() {
        let cam = camera();
        let p = Vector3::new(0.3, -0.2, 2.5);

        let uv = cam.project(&p).unwrap();
        let ray = cam.unproject(&uv);

        // Unprojection recovers the direction up to scale.
        assert_relative_eq!(ray * p.z, p, epsilon = 1e-10);
    }

    #[test]
    fn test_project_rejects_behind_camera() {
        let cam = camera();
        assert!(cam.project(&Vector3::new(0.1, 0.1, -1.0)).is_none());
        assert!(cam.project(&Vector3::new(0.1, 0.1, 0.0)).is_none());
    }

    #[test]
    fn test_projection_derivs_match_finite_differences() {
        let cam = camera();
        let p = Vector3::new(0.4, -0.3, 3.0);
        let jac = cam.projection_derivs(&p);

        let eps = 1e-7;
        for axis in 0..3 {
            let mut p_plus = p;
            p_plus[axis] += eps;
            let numeric = (cam.project(&p_plus).unwrap() - cam.project(&p).unwrap()) / eps;

            assert_relative_eq!(jac.column(axis).into_owned(), numeric, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_in_image_margins() {
        let cam = camera();
        assert!(cam.in_image(&Vector2::new(320.0, 240.0), 10.0));
        assert!(!cam.in_image(&Vector2::new(5.0, 240.0), 10.0));
        assert!(!cam.in_image(&Vector2::new(320.0, 475.0), 10.0));
    }
}
