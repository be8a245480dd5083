//! KeyFrame: an image pyramid, its camera pose, observed scene-depth
//! statistics and the measurement set recorded by the tracker.

use std::collections::HashMap;

use image::GrayImage;
use nalgebra::Vector2;

use crate::geometry::SE3;
use crate::map::MapPointId;

/// Number of pyramid levels. Level 0 is full resolution; each level above
/// halves the previous one.
pub const LEVELS: usize = 4;

/// Pixel scale of a pyramid level relative to level zero.
#[inline]
pub fn level_scale(level: usize) -> f64 {
    (1u32 << level) as f64
}

/// Map a position at `level` into level-zero pixel coordinates, accounting
/// for the half-pixel shift the 2x2-average half-sampling introduces.
#[inline]
pub fn level_zero_pos(p: Vector2<f64>, level: usize) -> Vector2<f64> {
    let s = level_scale(level);
    p * s + Vector2::repeat(s / 2.0 - 0.5)
}

/// Map a level-zero position into `level` pixel coordinates. Inverse of
/// [`level_zero_pos`].
#[inline]
pub fn level_pos(p0: Vector2<f64>, level: usize) -> Vector2<f64> {
    let s = level_scale(level);
    (p0 - Vector2::repeat(s / 2.0 - 0.5)) / s
}

/// Unique identifier for a KeyFrame within a Map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyFrameId(pub u64);

impl std::fmt::Display for KeyFrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// Result of a successful patch match for one map point in one keyframe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    /// Matched position in level-zero pixel coordinates.
    pub pos: Vector2<f64>,

    /// Pyramid level the match was made at.
    pub level: usize,

    /// Whether the match was refined to sub-pixel accuracy.
    pub sub_pix: bool,
}

/// An image pyramid with a pose and the measurements made against it.
///
/// The "current frame" keyframe is rebuilt every tracking call; it is only
/// persisted into the map when the orchestrator decides to add it.
#[derive(Debug, Clone)]
pub struct KeyFrame {
    /// Camera-from-world pose.
    pub pose: SE3,

    /// Half-sampled pyramid, `LEVELS` levels, level 0 full resolution.
    pub pyramid: Vec<GrayImage>,

    /// Mean of observed scene depth, used to scale the motion model's
    /// velocity gate. Defaults to 1.0 until enough points are tracked.
    pub scene_depth_mean: f64,

    /// Standard deviation of observed scene depth.
    pub scene_depth_sigma: f64,

    /// Measurements keyed by map point identity; unique per keyframe,
    /// insertion order irrelevant.
    pub measurements: HashMap<MapPointId, Measurement>,
}

impl KeyFrame {
    /// Build a keyframe from a full-resolution intensity image, generating
    /// the half-sampled pyramid.
    pub fn from_image(image: GrayImage, pose: SE3) -> Self {
        let mut pyramid = Vec::with_capacity(LEVELS);
        pyramid.push(image);
        for level in 1..LEVELS {
            let half = half_sample(&pyramid[level - 1]);
            pyramid.push(half);
        }

        Self {
            pose,
            pyramid,
            scene_depth_mean: 1.0,
            scene_depth_sigma: 1.0,
            measurements: HashMap::new(),
        }
    }

    /// World position of the camera center (inverse pose translation).
    pub fn camera_position(&self) -> nalgebra::Vector3<f64> {
        self.pose.inverse().translation
    }
}

/// 2x2-average half-sampling, the pyramid construction used throughout.
pub(crate) fn half_sample(image: &GrayImage) -> GrayImage {
    let (width, height) = image.dimensions();
    let new_w = (width / 2).max(1);
    let new_h = (height / 2).max(1);

    GrayImage::from_fn(new_w, new_h, |x, y| {
        let sx = (x * 2).min(width - 1);
        let sy = (y * 2).min(height - 1);
        let sx1 = (sx + 1).min(width - 1);
        let sy1 = (sy + 1).min(height - 1);

        let sum = image.get_pixel(sx, sy).0[0] as u32
            + image.get_pixel(sx1, sy).0[0] as u32
            + image.get_pixel(sx, sy1).0[0] as u32
            + image.get_pixel(sx1, sy1).0[0] as u32;
        image::Luma([((sum + 2) / 4) as u8])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_pyramid_dimensions_halve() {
        let image = GrayImage::from_pixel(64, 48, Luma([100]));
        let kf = KeyFrame::from_image(image, SE3::identity());

        assert_eq!(kf.pyramid.len(), LEVELS);
        assert_eq!(kf.pyramid[0].dimensions(), (64, 48));
        assert_eq!(kf.pyramid[1].dimensions(), (32, 24));
        assert_eq!(kf.pyramid[2].dimensions(), (16, 12));
        assert_eq!(kf.pyramid[3].dimensions(), (8, 6));
    }

    #[test]
    fn test_half_sample_preserves_constant_intensity() {
        let image = GrayImage::from_pixel(32, 32, Luma([173]));
        let kf = KeyFrame::from_image(image, SE3::identity());

        for level in &kf.pyramid {
            assert!(level.pixels().all(|p| p.0[0] == 173));
        }
    }

    #[test]
    fn test_level_scale_powers_of_two() {
        assert_eq!(level_scale(0), 1.0);
        assert_eq!(level_scale(3), 8.0);
    }

    #[test]
    fn test_level_pos_round_trip() {
        let p0 = Vector2::new(37.25, 18.5);
        for level in 0..LEVELS {
            let p = level_pos(p0, level);
            let back = level_zero_pos(p, level);
            assert!((back - p0).norm() < 1e-12);
        }
        // Level zero is the identity.
        assert_eq!(level_pos(p0, 0), p0);
    }
}
