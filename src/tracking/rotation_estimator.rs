//! Frame-to-frame rotation estimation from heavily downsampled images.
//!
//! Each incoming frame is reduced to a tiny blurred image. Aligning the
//! current one against the previous with a 2D similarity (shift plus
//! in-plane rotation plus brightness offset) gives a whole-image motion
//! that is lifted to a small 3D camera rotation and handed to the motion
//! model as a seed before patch search begins.

use image::GrayImage;
use imageproc::filter::gaussian_blur_f32;
use nalgebra::{Matrix4, Vector3, Vector4};

use crate::camera::CameraModel;
use crate::map::{half_sample, level_scale, KeyFrame, LEVELS};

/// Widest the reduced image is allowed to be, in pixels.
const SBI_MAX_WIDTH: u32 = 40;

/// Gauss-Newton iterations for the 2D alignment.
const ALIGN_ITERATIONS: usize = 6;

/// A downsampled, blurred copy of one frame, with image gradients for
/// alignment.
struct BlurryFrame {
    pixels: Vec<f32>,
    grad_x: Vec<f32>,
    grad_y: Vec<f32>,
    width: u32,
    height: u32,
    /// Full-resolution pixels per pixel of this image.
    scale: f64,
}

impl BlurryFrame {
    fn from_keyframe(kf: &KeyFrame, blur_sigma: f64) -> Self {
        let mut img = kf.pyramid[LEVELS - 1].clone();
        let mut scale = level_scale(LEVELS - 1);
        while img.width() > SBI_MAX_WIDTH {
            img = half_sample(&img);
            scale *= 2.0;
        }
        let blurred = gaussian_blur_f32(&img, blur_sigma as f32);
        let (width, height) = (blurred.width(), blurred.height());
        let pixels: Vec<f32> = blurred.as_raw().iter().map(|&p| p as f32).collect();

        let n = (width * height) as usize;
        let mut grad_x = vec![0.0f32; n];
        let mut grad_y = vec![0.0f32; n];
        let w = width as usize;
        for y in 1..(height as usize - 1) {
            for x in 1..(w - 1) {
                let i = y * w + x;
                grad_x[i] = 0.5 * (pixels[i + 1] - pixels[i - 1]);
                grad_y[i] = 0.5 * (pixels[i + w] - pixels[i - w]);
            }
        }

        Self {
            pixels,
            grad_x,
            grad_y,
            width,
            height,
            scale,
        }
    }

    fn sample(&self, x: f64, y: f64) -> Option<f32> {
        if x < 0.0 || y < 0.0 {
            return None;
        }
        let x0 = x.floor() as u32;
        let y0 = y.floor() as u32;
        if x0 + 1 >= self.width || y0 + 1 >= self.height {
            return None;
        }
        let fx = (x - x0 as f64) as f32;
        let fy = (y - y0 as f64) as f32;
        let w = self.width as usize;
        let i = y0 as usize * w + x0 as usize;
        let top = self.pixels[i] * (1.0 - fx) + self.pixels[i + 1] * fx;
        let bot = self.pixels[i + w] * (1.0 - fx) + self.pixels[i + w + 1] * fx;
        Some(top * (1.0 - fy) + bot * fy)
    }

    /// Aligns `moving` onto this frame. Returns the 2D motion
    /// `(dx, dy, theta)` in this frame's pixels such that
    /// `moving(W(x)) ~ self(x)` for the recovered warp `W`.
    fn align(&self, moving: &BlurryFrame) -> Option<Vector3<f64>> {
        let cx = (self.width as f64 - 1.0) * 0.5;
        let cy = (self.height as f64 - 1.0) * 0.5;
        // Parameters: x shift, y shift, in-plane angle, brightness offset.
        let mut params = Vector4::<f64>::zeros();

        for _ in 0..ALIGN_ITERATIONS {
            let (sin_t, cos_t) = params[2].sin_cos();
            let mut a = Matrix4::<f64>::zeros();
            let mut b = Vector4::<f64>::zeros();
            let w = self.width as usize;

            for y in 1..(self.height as usize - 1) {
                for x in 1..(w - 1) {
                    let rx = x as f64 - cx;
                    let ry = y as f64 - cy;
                    let wx = cos_t * rx - sin_t * ry + cx + params[0];
                    let wy = sin_t * rx + cos_t * ry + cy + params[1];
                    let Some(warped) = moving.sample(wx, wy) else {
                        continue;
                    };
                    let i = y * w + x;
                    let gx = self.grad_x[i] as f64;
                    let gy = self.grad_y[i] as f64;
                    let jac =
                        Vector4::new(gx, gy, gx * (-ry) + gy * rx, -1.0);
                    let residual = warped as f64 - self.pixels[i] as f64 - params[3];
                    a += jac * jac.transpose();
                    b += jac * residual;
                }
            }

            let update = a.cholesky()?.solve(&(-b));
            params += update;
            if update.fixed_rows::<2>(0).norm() < 1e-3 {
                break;
            }
        }

        Some(Vector3::new(params[0], params[1], params[2]))
    }
}

/// Holds the last two reduced frames and turns their 2D alignment into a
/// rotation seed.
pub struct RotationEstimator {
    blur_sigma: f64,
    previous: Option<BlurryFrame>,
    current: Option<BlurryFrame>,
}

impl RotationEstimator {
    pub fn new(blur_sigma: f64) -> Self {
        Self {
            blur_sigma,
            previous: None,
            current: None,
        }
    }

    /// Rotates the two-slot frame buffer, making `kf` the current frame.
    pub fn push_frame(&mut self, kf: &KeyFrame) {
        self.previous = self.current.take();
        self.current = Some(BlurryFrame::from_keyframe(kf, self.blur_sigma));
    }

    /// Drops any stored frames, so the next estimate waits for a fresh pair.
    pub fn reset(&mut self) {
        self.previous = None;
        self.current = None;
    }

    /// Estimates the camera rotation between the previous and current frame
    /// as an axis-angle vector, or `None` until two frames are available or
    /// if the alignment fails.
    pub fn estimate_rotation(&self, camera: &CameraModel) -> Option<Vector3<f64>> {
        let prev = self.previous.as_ref()?;
        let curr = self.current.as_ref()?;
        let motion = prev.align(curr)?;

        // Pixel shift of the image under a small rotation w:
        // du = fx * wy, dv = -fy * wx, plus wz about the axis. Invert at
        // full resolution.
        let du = motion[0] * prev.scale;
        let dv = motion[1] * prev.scale;
        Some(Vector3::new(
            -dv / camera.fy,
            du / camera.fx,
            motion[2],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::GrayImage;

    use crate::geometry::SE3;

    fn smooth_image(width: u32, height: u32, shift_x: f64, shift_y: f64) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            let fx = x as f64 - shift_x;
            let fy = y as f64 - shift_y;
            let v = 128.0 + 60.0 * (fx / 13.0).sin() + 40.0 * (fy / 9.0).cos();
            image::Luma([v.clamp(0.0, 255.0) as u8])
        })
    }

    fn camera() -> CameraModel {
        CameraModel::new(320.0, 320.0, 160.0, 120.0, 320, 240)
    }

    #[test]
    fn needs_two_frames() {
        let mut est = RotationEstimator::new(0.75);
        assert!(est.estimate_rotation(&camera()).is_none());
        let kf = KeyFrame::from_image(smooth_image(320, 240, 0.0, 0.0), SE3::identity());
        est.push_frame(&kf);
        assert!(est.estimate_rotation(&camera()).is_none());
        est.push_frame(&kf);
        assert!(est.estimate_rotation(&camera()).is_some());
    }

    #[test]
    fn pure_shift_recovers_rotation() {
        let cam = camera();
        let mut est = RotationEstimator::new(0.75);
        est.push_frame(&KeyFrame::from_image(smooth_image(320, 240, 0.0, 0.0), SE3::identity()));
        // Image content moves 16px right at full resolution, which a
        // camera yaw of 16 / fx radians produces.
        est.push_frame(&KeyFrame::from_image(smooth_image(320, 240, 16.0, 0.0), SE3::identity()));

        let w = est.estimate_rotation(&cam).unwrap();
        assert_relative_eq!(w[1], 16.0 / cam.fx, max_relative = 0.35);
        assert!(w[0].abs() < 0.02);
        assert!(w[2].abs() < 0.02);
    }

    #[test]
    fn vertical_shift_maps_to_x_axis() {
        let cam = camera();
        let mut est = RotationEstimator::new(0.75);
        est.push_frame(&KeyFrame::from_image(smooth_image(320, 240, 0.0, 0.0), SE3::identity()));
        est.push_frame(&KeyFrame::from_image(smooth_image(320, 240, 0.0, 16.0), SE3::identity()));

        let w = est.estimate_rotation(&cam).unwrap();
        assert!(w[0] < 0.0, "downward image motion is a negative x rotation");
        assert_relative_eq!(w[0], -16.0 / cam.fy, max_relative = 0.35);
    }

    #[test]
    fn reset_clears_frame_pair() {
        let mut est = RotationEstimator::new(0.75);
        let kf = KeyFrame::from_image(smooth_image(320, 240, 0.0, 0.0), SE3::identity());
        est.push_frame(&kf);
        est.push_frame(&kf);
        est.reset();
        assert!(est.estimate_rotation(&camera()).is_none());
    }
}
