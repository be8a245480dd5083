//! Per-point working record for one tracking pass.
//!
//! One record per map point, kept in an arena keyed by point identity and
//! reused across frames. Every field below is only valid within a single
//! `track_map` call; `prepare_for_frame` re-arms the record so nothing
//! from a previous frame leaks into the next.

use std::sync::Arc;

use nalgebra::{Matrix2x3, Matrix2x6, Vector2, Vector3, Vector6};

use crate::camera::CameraModel;
use crate::geometry::SE3;
use crate::map::map_point::PatchSource;
use crate::map::MapPointId;

use super::patch_finder::PatchFinder;

/// Margin (level-zero pixels) a projection must keep from the image border
/// to count as in-image.
const IN_IMAGE_MARGIN: f64 = 1.0;

/// Working state for one map point in the current frame.
#[derive(Debug, Clone)]
pub struct TrackerData {
    pub point_id: MapPointId,

    /// Snapshot of the point's world position for this frame.
    pub world_pos: Vector3<f64>,

    /// Shared reference-patch snapshot.
    pub patch: Arc<PatchSource>,

    /// Patch matching state for this point.
    pub finder: PatchFinder,

    /// Whether the cached projection landed inside the image.
    pub in_image: bool,

    /// Predicted level-zero image position under the current pose estimate.
    pub image_pos: Vector2<f64>,

    /// Camera-frame position under the current pose estimate.
    pub cam_pos: Vector3<f64>,

    /// Projection derivatives at `cam_pos`.
    pub proj_derivs: Matrix2x3<f64>,

    /// Chosen search pyramid level.
    pub search_level: usize,

    pub searched: bool,
    pub found: bool,
    pub did_sub_pix: bool,

    /// Matched level-zero position when found.
    pub found_pos: Vector2<f64>,

    /// Inverse of the per-level measurement noise standard deviation.
    pub sqrt_inv_noise: f64,

    /// Covariance-scaled reprojection residual (found - predicted).
    pub error_cov_scaled: Vector2<f64>,

    /// 2x6 Jacobian of the predicted projection with respect to the pose
    /// tangent update (translation-first).
    pub jacobian: Matrix2x6<f64>,
}

impl TrackerData {
    pub fn new(point_id: MapPointId, world_pos: Vector3<f64>, patch: Arc<PatchSource>) -> Self {
        Self {
            point_id,
            world_pos,
            patch,
            finder: PatchFinder::default(),
            in_image: false,
            image_pos: Vector2::zeros(),
            cam_pos: Vector3::zeros(),
            proj_derivs: Matrix2x3::zeros(),
            search_level: 0,
            searched: false,
            found: false,
            did_sub_pix: false,
            found_pos: Vector2::zeros(),
            sqrt_inv_noise: 1.0,
            error_cov_scaled: Vector2::zeros(),
            jacobian: Matrix2x6::zeros(),
        }
    }

    /// Re-arm a reused record for a fresh frame. The mapping process may
    /// have moved the point since last frame, so the position snapshot is
    /// always refreshed.
    pub fn prepare_for_frame(&mut self, world_pos: Vector3<f64>) {
        self.world_pos = world_pos;
        self.in_image = false;
        self.searched = false;
        self.found = false;
        self.did_sub_pix = false;
    }

    /// Project the point under `pose`, caching the camera-frame position
    /// and whether it landed inside the image.
    pub fn project(&mut self, pose: &SE3, camera: &CameraModel) {
        self.cam_pos = pose.transform_point(&self.world_pos);
        self.in_image = match camera.project(&self.cam_pos) {
            Some(uv) if camera.in_image(&uv, IN_IMAGE_MARGIN) => {
                self.image_pos = uv;
                true
            }
            _ => false,
        };
    }

    /// Cache the projection derivatives at the current camera-frame
    /// position. Only valid after a successful `project`.
    pub fn get_derivs(&mut self, camera: &CameraModel) {
        self.proj_derivs = camera.projection_derivs(&self.cam_pos);
    }

    pub fn project_and_derivs(&mut self, pose: &SE3, camera: &CameraModel) {
        self.project(pose, camera);
        if self.in_image {
            self.get_derivs(camera);
        }
    }

    /// Build the 2x6 Jacobian of the projection with respect to a
    /// left-multiplied pose update `exp(mu) * pose`: the camera-frame point
    /// moves by `u + w x p` for tangent `(u, w)`.
    pub fn calc_jacobian(&mut self) {
        for m in 0..6 {
            let motion = if m < 3 {
                let mut e = Vector3::zeros();
                e[m] = 1.0;
                e
            } else {
                let mut e = Vector3::zeros();
                e[m - 3] = 1.0;
                e.cross(&self.cam_pos)
            };
            self.jacobian.set_column(m, &(self.proj_derivs * motion));
        }
    }

    /// Cheap linear re-prediction: extrapolate the projected position from
    /// a pose delta using the cached Jacobian, skipping full reprojection.
    pub fn linear_update(&mut self, update: &Vector6<f64>) {
        self.image_pos += self.jacobian * update;
    }
}
