//! MapPoint: a 3D landmark plus the reference-patch snapshot used for
//! template matching.

use std::sync::Arc;

use image::GrayImage;
use nalgebra::{Vector2, Vector3};

use crate::camera::CameraModel;
use crate::geometry::SE3;
use crate::map::keyframe::{level_pos, level_scale, KeyFrame};
use crate::map::KeyFrameId;

/// Unique identifier for a MapPoint within a Map.
///
/// Assigned sequentially; lightweight handle for cross-referencing without
/// Arc/Rc cycles between points, keyframes and tracker working state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MapPointId(pub u64);

impl std::fmt::Display for MapPointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MP{}", self.0)
    }
}

/// Side length of the square of source-level pixels copied out of the
/// source keyframe when a point is created. Warp sampling that escapes the
/// square degrades to "template bad" for that frame.
pub const PATCH_SOURCE_SIZE: u32 = 24;

/// Immutable reference-patch snapshot for one map point.
///
/// Rather than warping templates straight out of the source keyframe's
/// pyramid, each point carries a copied square of source-level pixels plus
/// the world-space vectors that one source-level pixel step corresponds
/// to, so patch search runs without holding any map lock.
#[derive(Debug)]
pub struct PatchSource {
    /// Pyramid level of the source keyframe the patch was cut from.
    pub level: usize,

    /// Copied square of source-level pixels, `PATCH_SOURCE_SIZE` on a side,
    /// centered on the point's projection in the source view.
    pub pixels: GrayImage,

    /// Sub-pixel offset of the point's projection from the patch center.
    pub center_offset: Vector2<f64>,

    /// World-space displacement corresponding to a one-pixel step right at
    /// the source level, evaluated at the point's depth.
    pub pixel_right_w: Vector3<f64>,

    /// World-space displacement for a one-pixel step down.
    pub pixel_down_w: Vector3<f64>,
}

impl PatchSource {
    /// Cut a reference patch for a point from its source keyframe.
    ///
    /// `uv` is the point's projection in level-zero pixel coordinates.
    /// Returns `None` when the patch would touch the source level's border.
    pub fn from_keyframe(
        kf: &KeyFrame,
        camera: &CameraModel,
        level: usize,
        uv: &Vector2<f64>,
        world_pos: &Vector3<f64>,
    ) -> Option<Self> {
        let source = &kf.pyramid[level];
        let scale = level_scale(level);
        let uv_level = level_pos(*uv, level);

        let half = (PATCH_SOURCE_SIZE / 2) as i64;
        let cx = uv_level.x.round() as i64;
        let cy = uv_level.y.round() as i64;
        if cx < half
            || cy < half
            || cx + half > source.width() as i64
            || cy + half > source.height() as i64
        {
            return None;
        }

        let pixels = image::imageops::crop_imm(
            source,
            (cx - half) as u32,
            (cy - half) as u32,
            PATCH_SOURCE_SIZE,
            PATCH_SOURCE_SIZE,
        )
        .to_image();

        // One source-level pixel at the point's depth, expressed in world
        // coordinates. Used to build the affine warp in later frames.
        let p_cam = kf.pose.transform_point(world_pos);
        if p_cam.z <= 0.0 {
            return None;
        }
        let rot_wc = kf.pose.rotation.inverse();
        let pixel_right_w = rot_wc * Vector3::new(scale * p_cam.z / camera.fx, 0.0, 0.0);
        let pixel_down_w = rot_wc * Vector3::new(0.0, scale * p_cam.z / camera.fy, 0.0);

        Some(Self {
            level,
            pixels,
            center_offset: Vector2::new(uv_level.x - cx as f64, uv_level.y - cy as f64),
            pixel_right_w,
            pixel_down_w,
        })
    }

    /// Bilinear sample at an offset from the patch center, in source-level
    /// pixels. `None` when the sample would read outside the copied square.
    pub fn sample(&self, dx: f64, dy: f64) -> Option<f32> {
        let half = (PATCH_SOURCE_SIZE / 2) as f64;
        let x = half + self.center_offset.x + dx;
        let y = half + self.center_offset.y + dy;

        let x0 = x.floor();
        let y0 = y.floor();
        if x0 < 0.0
            || y0 < 0.0
            || x0 + 1.0 >= self.pixels.width() as f64
            || y0 + 1.0 >= self.pixels.height() as f64
        {
            return None;
        }

        let (xi, yi) = (x0 as u32, y0 as u32);
        let fx = (x - x0) as f32;
        let fy = (y - y0) as f32;

        let p00 = self.pixels.get_pixel(xi, yi).0[0] as f32;
        let p10 = self.pixels.get_pixel(xi + 1, yi).0[0] as f32;
        let p01 = self.pixels.get_pixel(xi, yi + 1).0[0] as f32;
        let p11 = self.pixels.get_pixel(xi + 1, yi + 1).0[0] as f32;

        let top = p00 * (1.0 - fx) + p10 * fx;
        let bottom = p01 * (1.0 - fx) + p11 * fx;
        Some(top * (1.0 - fy) + bottom * fy)
    }
}

/// A 3D map point with per-point tracking statistics.
///
/// Owned by the map; the mapping process creates and culls points, the
/// tracker only bumps the inlier/outlier counters.
#[derive(Debug, Clone)]
pub struct MapPoint {
    pub id: MapPointId,

    /// 3D position in world coordinates.
    pub position: Vector3<f64>,

    /// Reference-patch snapshot for template matching.
    pub patch: Arc<PatchSource>,

    /// KeyFrame the reference patch was cut from.
    pub source_kf: KeyFrameId,

    /// Times the pose refiner marked this point an M-estimator outlier.
    pub outlier_count: u32,

    /// Times the pose refiner kept this point as an inlier.
    pub inlier_count: u32,
}

impl MapPoint {
    pub fn new(
        id: MapPointId,
        position: Vector3<f64>,
        patch: Arc<PatchSource>,
        source_kf: KeyFrameId,
    ) -> Self {
        Self {
            id,
            position,
            patch,
            source_kf,
            outlier_count: 0,
            inlier_count: 0,
        }
    }
}
