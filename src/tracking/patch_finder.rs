//! Patch matcher: affine warp, search-level selection, coarse template
//! search and optional sub-pixel refinement for one map point in one frame.
//!
//! Every rejection here (bad warp, degenerate template, search miss,
//! non-convergence) silently drops the point for the current frame; none of
//! them is an error.

use image::GrayImage;
use nalgebra::{Matrix2, Matrix3, Vector2, Vector3};

use crate::camera::CameraModel;
use crate::geometry::SE3;
use crate::map::keyframe::{level_pos, level_scale, level_zero_pos, KeyFrame};
use crate::map::map_point::PatchSource;
use crate::map::LEVELS;

/// Side length of the matching template, in search-level pixels.
pub const TEMPLATE_SIZE: usize = 8;
const TEMPLATE_PIXELS: usize = TEMPLATE_SIZE * TEMPLATE_SIZE;

/// Template offsets run from -TEMPLATE_RADIUS to TEMPLATE_RADIUS - 1.
const TEMPLATE_RADIUS: i32 = (TEMPLATE_SIZE / 2) as i32;

/// Maximum zero-mean SSD per template pixel for a coarse match.
const MAX_SSD_PER_PIXEL: f32 = 500.0;

/// Minimum zero-mean energy per pixel; below this the template is too low
/// contrast to match reliably.
const MIN_TEMPLATE_VARIANCE: f32 = 10.0;

/// Sub-pixel iteration is converged once the positional update falls below
/// this many search-level pixels.
const SUB_PIX_CONVERGENCE: f64 = 0.03;

/// Per-point patch matching state, reused across frames through the
/// tracker's working-record arena.
#[derive(Debug, Clone)]
pub struct PatchFinder {
    level: usize,

    /// Affine warp from source-level pixels to search-level pixels.
    warp: Matrix2<f64>,
    warp_inverse: Matrix2<f64>,

    template: [f32; TEMPLATE_PIXELS],
    template_mean: f32,
    template_good: bool,

    /// Best coarse match, in search-level pixel coordinates.
    coarse_pos: Vector2<f64>,

    /// Sub-pixel refined match, in search-level pixel coordinates.
    sub_pix_pos: Vector2<f64>,

    /// Inverse-compositional alignment state (template gradients and the
    /// inverted 3x3 Gauss-Newton Hessian over x, y, mean-offset).
    grad_x: [f32; TEMPLATE_PIXELS],
    grad_y: [f32; TEMPLATE_PIXELS],
    hess_inv: Matrix3<f64>,
    sub_pix_ready: bool,
}

impl Default for PatchFinder {
    fn default() -> Self {
        Self {
            level: 0,
            warp: Matrix2::identity(),
            warp_inverse: Matrix2::identity(),
            template: [0.0; TEMPLATE_PIXELS],
            template_mean: 0.0,
            template_good: false,
            coarse_pos: Vector2::zeros(),
            sub_pix_pos: Vector2::zeros(),
            grad_x: [0.0; TEMPLATE_PIXELS],
            grad_y: [0.0; TEMPLATE_PIXELS],
            hess_inv: Matrix3::zeros(),
            sub_pix_ready: false,
        }
    }
}

impl PatchFinder {
    pub fn level(&self) -> usize {
        self.level
    }

    /// Compute the 2x2 affine warp from the point's reference patch into
    /// the current view and pick the pyramid level whose scale best matches
    /// the warp's area change.
    ///
    /// Returns `None` when the warp is degenerate, mirrored, or too extreme
    /// for reliable matching at any level.
    pub fn calc_search_level_and_warp(
        &mut self,
        patch: &PatchSource,
        pose: &SE3,
        camera: &CameraModel,
        world_pos: &Vector3<f64>,
    ) -> Option<usize> {
        let center = camera.project(&pose.transform_point(world_pos))?;
        let right = camera.project(&pose.transform_point(&(world_pos + patch.pixel_right_w)))?;
        let down = camera.project(&pose.transform_point(&(world_pos + patch.pixel_down_w)))?;

        // Columns: level-zero pixel motion per source-level pixel step.
        let warp0 = Matrix2::from_columns(&[right - center, down - center]);
        let det = warp0.determinant();
        if det <= 0.0 || !det.is_finite() {
            return None;
        }

        // Walk up the pyramid until the per-level patch area is near unity.
        let mut level = 0;
        let mut level_det = det;
        while level_det > 3.0 && level < LEVELS - 1 {
            level_det *= 0.25;
            level += 1;
        }
        if !(0.25..=3.0).contains(&level_det) {
            return None;
        }

        let warp = warp0 / level_scale(level);
        let warp_inverse = warp.try_inverse()?;

        self.level = level;
        self.warp = warp;
        self.warp_inverse = warp_inverse;
        self.template_good = false;
        self.sub_pix_ready = false;
        Some(level)
    }

    /// Build the matching template by warping the reference patch into the
    /// search level. Returns false when any warped sample escapes the
    /// copied source square or the result is too low contrast.
    pub fn make_template(&mut self, patch: &PatchSource) -> bool {
        let mut sum = 0.0f32;
        for dy in -TEMPLATE_RADIUS..TEMPLATE_RADIUS {
            for dx in -TEMPLATE_RADIUS..TEMPLATE_RADIUS {
                let src = self.warp_inverse * Vector2::new(dx as f64, dy as f64);
                let Some(value) = patch.sample(src.x, src.y) else {
                    self.template_good = false;
                    return false;
                };
                self.template[template_index(dx, dy)] = value;
                sum += value;
            }
        }

        self.template_mean = sum / TEMPLATE_PIXELS as f32;
        let energy: f32 = self
            .template
            .iter()
            .map(|&t| {
                let d = t - self.template_mean;
                d * d
            })
            .sum();

        self.template_good = energy >= MIN_TEMPLATE_VARIANCE * TEMPLATE_PIXELS as f32;
        self.template_good
    }

    pub fn template_bad(&self) -> bool {
        !self.template_good
    }

    /// Scan a square window of `range` search-level pixels around the
    /// predicted level-zero position for the best zero-mean SSD match.
    pub fn find_patch_coarse(
        &mut self,
        predicted: &Vector2<f64>,
        kf: &KeyFrame,
        range: usize,
    ) -> bool {
        let image = &kf.pyramid[self.level];
        let center = level_pos(*predicted, self.level);
        let cx = center.x.round() as i32;
        let cy = center.y.round() as i32;
        let range = range as i32;

        // Candidate centers must keep the whole template inside the image.
        let lo_x = (cx - range).max(TEMPLATE_RADIUS);
        let hi_x = (cx + range).min(image.width() as i32 - TEMPLATE_RADIUS);
        let lo_y = (cy - range).max(TEMPLATE_RADIUS);
        let hi_y = (cy + range).min(image.height() as i32 - TEMPLATE_RADIUS);
        if lo_x >= hi_x || lo_y >= hi_y {
            return false;
        }

        let mut best_ssd = f32::MAX;
        let mut best = Vector2::zeros();
        for y in lo_y..hi_y {
            for x in lo_x..hi_x {
                let ssd = self.zero_mean_ssd(image, x, y);
                if ssd < best_ssd {
                    best_ssd = ssd;
                    best = Vector2::new(x as f64, y as f64);
                }
            }
        }

        if best_ssd > MAX_SSD_PER_PIXEL * TEMPLATE_PIXELS as f32 {
            return false;
        }
        self.coarse_pos = best;
        true
    }

    /// Zero-mean SSD between the template and the image patch at (x, y).
    fn zero_mean_ssd(&self, image: &GrayImage, x: i32, y: i32) -> f32 {
        let mut sum = 0.0f32;
        let mut samples = [0.0f32; TEMPLATE_PIXELS];
        for dy in -TEMPLATE_RADIUS..TEMPLATE_RADIUS {
            for dx in -TEMPLATE_RADIUS..TEMPLATE_RADIUS {
                let v = image.get_pixel((x + dx) as u32, (y + dy) as u32).0[0] as f32;
                samples[template_index(dx, dy)] = v;
                sum += v;
            }
        }
        let mean = sum / TEMPLATE_PIXELS as f32;

        let mut ssd = 0.0f32;
        for i in 0..TEMPLATE_PIXELS {
            let d = (samples[i] - mean) - (self.template[i] - self.template_mean);
            ssd += d * d;
        }
        ssd
    }

    /// Matched position from the coarse search, in level-zero coordinates.
    pub fn coarse_pos_level_zero(&self) -> Vector2<f64> {
        level_zero_pos(self.coarse_pos, self.level)
    }

    /// Prepare inverse-compositional alignment: template gradients and the
    /// inverted Gauss-Newton Hessian over (x, y, mean-offset).
    pub fn make_sub_pix_template(&mut self, patch: &PatchSource) -> bool {
        let mut hess = Matrix3::zeros();
        for dy in -TEMPLATE_RADIUS..TEMPLATE_RADIUS {
            for dx in -TEMPLATE_RADIUS..TEMPLATE_RADIUS {
                let sample = |ox: f64, oy: f64| {
                    let src = self.warp_inverse * Vector2::new(dx as f64 + ox, dy as f64 + oy);
                    patch.sample(src.x, src.y)
                };
                let (Some(xp), Some(xm), Some(yp), Some(ym)) =
                    (sample(1.0, 0.0), sample(-1.0, 0.0), sample(0.0, 1.0), sample(0.0, -1.0))
                else {
                    self.sub_pix_ready = false;
                    return false;
                };

                let i = template_index(dx, dy);
                let gx = (xp - xm) * 0.5;
                let gy = (yp - ym) * 0.5;
                self.grad_x[i] = gx;
                self.grad_y[i] = gy;

                let j = Vector3::new(gx as f64, gy as f64, 1.0);
                hess += j * j.transpose();
            }
        }

        match hess.try_inverse() {
            Some(inv) => {
                self.hess_inv = inv;
                self.sub_pix_ready = true;
                true
            }
            None => {
                self.sub_pix_ready = false;
                false
            }
        }
    }

    /// Iterate the image-alignment update from the coarse position until
    /// convergence or the iteration bound. Non-convergence invalidates the
    /// match.
    pub fn iterate_sub_pix(&mut self, kf: &KeyFrame, max_its: usize) -> bool {
        if !self.sub_pix_ready {
            return false;
        }

        let image = &kf.pyramid[self.level];
        let mut pos = self.coarse_pos;
        let mut mean_offset = 0.0f64;

        for _ in 0..max_its {
            let mut rhs = Vector3::zeros();
            for dy in -TEMPLATE_RADIUS..TEMPLATE_RADIUS {
                for dx in -TEMPLATE_RADIUS..TEMPLATE_RADIUS {
                    let Some(value) =
                        sample_bilinear(image, pos.x + dx as f64, pos.y + dy as f64)
                    else {
                        return false;
                    };
                    let i = template_index(dx, dy);
                    let residual = value as f64 - self.template[i] as f64 - mean_offset;
                    rhs += residual
                        * Vector3::new(self.grad_x[i] as f64, self.grad_y[i] as f64, 1.0);
                }
            }

            let update = self.hess_inv * rhs;
            // Inverse compositional: the warp update applies to the
            // template, so the image-space position moves the other way.
            pos.x -= update.x;
            pos.y -= update.y;
            mean_offset += update.z;

            if update.x * update.x + update.y * update.y
                < SUB_PIX_CONVERGENCE * SUB_PIX_CONVERGENCE
            {
                self.sub_pix_pos = pos;
                return true;
            }
        }
        false
    }

    /// Refined position after sub-pixel iteration, in level-zero
    /// coordinates.
    pub fn sub_pix_pos_level_zero(&self) -> Vector2<f64> {
        level_zero_pos(self.sub_pix_pos, self.level)
    }
}

#[inline]
fn template_index(dx: i32, dy: i32) -> usize {
    ((dy + TEMPLATE_RADIUS) as usize) * TEMPLATE_SIZE + (dx + TEMPLATE_RADIUS) as usize
}

/// Bilinear sample; `None` once any tap would fall outside the image.
fn sample_bilinear(image: &GrayImage, x: f64, y: f64) -> Option<f32> {
    let x0 = x.floor();
    let y0 = y.floor();
    if x0 < 0.0 || y0 < 0.0 || x0 + 1.0 >= image.width() as f64 || y0 + 1.0 >= image.height() as f64
    {
        return None;
    }

    let (xi, yi) = (x0 as u32, y0 as u32);
    let fx = (x - x0) as f32;
    let fy = (y - y0) as f32;

    let p00 = image.get_pixel(xi, yi).0[0] as f32;
    let p10 = image.get_pixel(xi + 1, yi).0[0] as f32;
    let p01 = image.get_pixel(xi, yi + 1).0[0] as f32;
    let p11 = image.get_pixel(xi + 1, yi + 1).0[0] as f32;

    let top = p00 * (1.0 - fx) + p10 * fx;
    let bottom = p01 * (1.0 - fx) + p11 * fx;
    Some(top * (1.0 - fy) + bottom * fy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn textured_image(width: u32, height: u32, seed: u64) -> GrayImage {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let noise: Vec<u8> = (0..width * height).map(|_| rng.gen()).collect();
        // Smooth the noise slightly so bilinear sampling behaves.
        GrayImage::from_fn(width, height, |x, y| {
            let idx = |xx: u32, yy: u32| noise[(yy * width + xx) as usize] as u32;
            let x1 = (x + 1).min(width - 1);
            let y1 = (y + 1).min(height - 1);
            Luma([((idx(x, y) + idx(x1, y) + idx(x, y1) + idx(x1, y1)) / 4) as u8])
        })
    }

    fn shifted(image: &GrayImage, dx: i32, dy: i32) -> GrayImage {
        GrayImage::from_fn(image.width(), image.height(), |x, y| {
            let sx = (x as i32 - dx).clamp(0, image.width() as i32 - 1) as u32;
            let sy = (y as i32 - dy).clamp(0, image.height() as i32 - 1) as u32;
            *image.get_pixel(sx, sy)
        })
    }

    fn setup() -> (CameraModel, KeyFrame, Vector3<f64>, PatchSource) {
        let cam = CameraModel::new(120.0, 120.0, 80.0, 60.0, 160, 120);
        let kf = KeyFrame::from_image(textured_image(160, 120, 7), SE3::identity());
        let world = Vector3::new(0.0, 0.0, 2.0);
        let uv = cam.project(&world).unwrap();
        let patch = PatchSource::from_keyframe(&kf, &cam, 0, &uv, &world).unwrap();
        (cam, kf, world, patch)
    }

    #[test]
    fn test_identity_view_selects_level_zero() {
        let (cam, _kf, world, patch) = setup();
        let mut finder = PatchFinder::default();

        let level = finder
            .calc_search_level_and_warp(&patch, &SE3::identity(), &cam, &world)
            .unwrap();
        assert_eq!(level, 0);
    }

    #[test]
    fn test_closer_view_selects_coarser_level() {
        let (cam, _kf, world, patch) = setup();
        let mut finder = PatchFinder::default();

        // Move the camera most of the way toward the point: the patch
        // appears 4x larger per side, 16x by area, so the search moves two
        // levels up the pyramid.
        let pose = SE3 {
            rotation: nalgebra::UnitQuaternion::identity(),
            translation: Vector3::new(0.0, 0.0, -1.5),
        };
        let level = finder
            .calc_search_level_and_warp(&patch, &pose, &cam, &world)
            .unwrap();
        assert_eq!(level, 2);
    }

    #[test]
    fn test_point_behind_camera_rejected() {
        let (cam, _kf, world, patch) = setup();
        let mut finder = PatchFinder::default();

        let pose = SE3 {
            rotation: nalgebra::UnitQuaternion::identity(),
            translation: Vector3::new(0.0, 0.0, -5.0),
        };
        assert!(finder
            .calc_search_level_and_warp(&patch, &pose, &cam, &world)
            .is_none());
    }

    #[test]
    fn test_flat_template_is_bad() {
        let cam = CameraModel::new(120.0, 120.0, 80.0, 60.0, 160, 120);
        let kf = KeyFrame::from_image(GrayImage::from_pixel(160, 120, Luma([90])), SE3::identity());
        let world = Vector3::new(0.0, 0.0, 2.0);
        let uv = cam.project(&world).unwrap();
        let patch = PatchSource::from_keyframe(&kf, &cam, 0, &uv, &world).unwrap();

        let mut finder = PatchFinder::default();
        finder
            .calc_search_level_and_warp(&patch, &SE3::identity(), &cam, &world)
            .unwrap();
        assert!(!finder.make_template(&patch));
        assert!(finder.template_bad());
    }

    #[test]
    fn test_coarse_search_recovers_known_shift() {
        let (cam, kf, world, patch) = setup();
        let uv = cam.project(&world).unwrap();

        // The scene content moved 4 px right, 2 px down relative to the
        // prediction.
        let current = KeyFrame::from_image(shifted(&kf.pyramid[0], 4, 2), SE3::identity());

        let mut finder = PatchFinder::default();
        finder
            .calc_search_level_and_warp(&patch, &SE3::identity(), &cam, &world)
            .unwrap();
        assert!(finder.make_template(&patch));
        assert!(finder.find_patch_coarse(&uv, &current, 8));

        let found = finder.coarse_pos_level_zero();
        assert!((found.x - (uv.x + 4.0)).abs() <= 1.0, "found {found:?}");
        assert!((found.y - (uv.y + 2.0)).abs() <= 1.0, "found {found:?}");
    }

    #[test]
    fn test_coarse_search_misses_outside_range() {
        let (cam, kf, world, patch) = setup();
        let uv = cam.project(&world).unwrap();
        let current = KeyFrame::from_image(shifted(&kf.pyramid[0], 20, 0), SE3::identity());

        let mut finder = PatchFinder::default();
        finder
            .calc_search_level_and_warp(&patch, &SE3::identity(), &cam, &world)
            .unwrap();
        assert!(finder.make_template(&patch));
        // Shift is far beyond the window; random texture should not match.
        assert!(!finder.find_patch_coarse(&uv, &current, 5));
    }

    #[test]
    fn test_sub_pix_converges_near_coarse_match() {
        let (cam, kf, world, patch) = setup();
        let uv = cam.project(&world).unwrap();
        let current = KeyFrame::from_image(shifted(&kf.pyramid[0], 3, 1), SE3::identity());

        let mut finder = PatchFinder::default();
        finder
            .calc_search_level_and_warp(&patch, &SE3::identity(), &cam, &world)
            .unwrap();
        assert!(finder.make_template(&patch));
        assert!(finder.find_patch_coarse(&uv, &current, 8));
        assert!(finder.make_sub_pix_template(&patch));
        assert!(finder.iterate_sub_pix(&current, 10));

        let refined = finder.sub_pix_pos_level_zero();
        assert!((refined.x - (uv.x + 3.0)).abs() < 0.5, "refined {refined:?}");
        assert!((refined.y - (uv.y + 1.0)).abs() < 0.5, "refined {refined:?}");
    }
}
