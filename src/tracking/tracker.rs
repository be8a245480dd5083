//! Per-frame tracking orchestrator.
//!
//! `Tracker::track_frame` owns the whole per-frame pipeline: motion
//! prediction, the coarse and fine patch-search stages, robust pose
//! refinement, quality grading, keyframe submission and recovery. The map
//! is only locked twice per frame, briefly: a read lock to snapshot the
//! potentially-visible set and a write lock to commit outlier marks.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use image::GrayImage;
use nalgebra::{Vector3, Vector6};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::camera::CameraModel;
use crate::config::TrackerConfig;
use crate::error::TrackerError;
use crate::geometry::SE3;
use crate::io::TrajectoryWriter;
use crate::map::{level_scale, KeyFrame, MapPointId, Measurement, SharedMap, LEVELS};
use crate::mapping::{MapMaker, MappingMode};
use crate::tracking::motion_model::MotionModel;
use crate::tracking::pose_update::{WeightedLeastSquares, STABILIZING_PRIOR};
use crate::tracking::quality::{self, TrackingQuality};
use crate::tracking::rotation_estimator::RotationEstimator;
use crate::tracking::tracker_data::TrackerData;

/// Consecutive BAD frames before tracking is declared lost.
const MAX_LOST_FRAMES: u32 = 3;

/// Gauss-Newton iterations per optimization stage.
const GN_ITERATIONS: usize = 10;

/// Fine-stage iterations that re-project every point; the rest extrapolate
/// image positions linearly from the last update.
const NONLINEAR_ITERATIONS: [usize; 3] = [0, 4, 9];

/// Sigma-squared override for late coarse iterations.
const COARSE_OVERRIDE_SIGMA_SQUARED: f64 = 1.0;

/// Sigma-squared override for late fine iterations.
const FINE_OVERRIDE_SIGMA_SQUARED: f64 = 16.0;

/// Search radius in the fine stage, halved when the coarse stage already
/// tightened the pose.
const FINE_RANGE: usize = 10;
const FINE_RANGE_AFTER_COARSE: usize = 5;

/// Sub-pixel iterations for top-level points in the fine stage.
const FINE_TOP_LEVEL_SUB_PIX_ITS: usize = 8;

/// Minimum found patches before the frame's scene depth statistics replace
/// the previous estimate.
const MIN_DEPTH_MEASUREMENTS: usize = 20;

/// Frames that must pass after a keyframe submission before another one.
const MIN_FRAMES_BETWEEN_KEYFRAMES: u64 = 20;

/// Keyframes allowed in the mapping queue before submissions pause.
const MAX_KEYFRAME_QUEUE: usize = 3;

/// The per-frame camera tracker.
pub struct Tracker {
    camera: CameraModel,
    map: SharedMap,
    map_maker: Arc<dyn MapMaker>,
    config: TrackerConfig,

    /// The frame being tracked, as a keyframe candidate.
    current_kf: KeyFrame,

    /// Camera-from-world pose, refined in place during tracking.
    pose: SE3,

    /// Pose at the start of the frame, after motion prediction.
    start_pose: SE3,

    motion_model: MotionModel,
    rotation_estimator: RotationEstimator,

    quality: TrackingQuality,
    lost_frames: u32,
    frame_count: u64,
    last_keyframe_frame: u64,

    /// Set when a relocalization pose was just adopted; the next frame
    /// forces the coarse stage with doubled range and budget.
    just_recovered: bool,

    /// Per-level patch search statistics for the last frame.
    attempted: [usize; LEVELS],
    found: [usize; LEVELS],

    /// Human-readable status for the last frame.
    message: String,

    /// Per-point working state, reused across frames and pruned when points
    /// leave the map.
    arena: HashMap<MapPointId, TrackerData>,

    /// Points condemned or confirmed by the final refinement iteration,
    /// applied to the map in one short write section.
    outlier_marks: Vec<MapPointId>,
    inlier_marks: Vec<MapPointId>,

    rng: SmallRng,

    command_tx: Sender<String>,
    command_rx: Receiver<String>,

    /// Commands rejected while draining the queue for the last frame.
    rejected_commands: Vec<TrackerError>,

    trajectory: Option<TrajectoryWriter>,
}

impl Tracker {
    pub fn new(
        camera: CameraModel,
        map: SharedMap,
        map_maker: Arc<dyn MapMaker>,
        config: TrackerConfig,
    ) -> Result<Self> {
        let rng = match config.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        let trajectory = match &config.trajectory_path {
            Some(path) => Some(TrajectoryWriter::create(path)?),
            None => None,
        };
        let (command_tx, command_rx) = unbounded();
        let (width, height) = camera.image_size();
        let blank = GrayImage::new(width, height);

        Ok(Self {
            rotation_estimator: RotationEstimator::new(config.rotation_estimator_blur),
            camera,
            map,
            map_maker,
            config,
            current_kf: KeyFrame::from_image(blank, SE3::identity()),
            pose: SE3::identity(),
            start_pose: SE3::identity(),
            motion_model: MotionModel::new(),
            quality: TrackingQuality::Bad,
            lost_frames: 0,
            frame_count: 0,
            last_keyframe_frame: 0,
            just_recovered: false,
            attempted: [0; LEVELS],
            found: [0; LEVELS],
            message: String::new(),
            arena: HashMap::new(),
            outlier_marks: Vec::new(),
            inlier_marks: Vec::new(),
            rng,
            command_tx,
            command_rx,
            rejected_commands: Vec::new(),
            trajectory,
        })
    }

    /// Sender half of the command queue. Commands are drained once at the
    /// end of each frame; unknown ones are collected in
    /// [`Tracker::rejected_commands`].
    pub fn command_sender(&self) -> Sender<String> {
        self.command_tx.clone()
    }

    /// Typed errors for commands rejected during the last frame. Whether to
    /// log, ignore, or escalate them is the caller's decision.
    pub fn rejected_commands(&self) -> &[TrackerError] {
        &self.rejected_commands
    }

    pub fn pose(&self) -> &SE3 {
        &self.pose
    }

    /// Camera-from-world pose as an (axis-angle rotation, translation) pair.
    pub fn camera_pose(&self) -> (Vector3<f64>, Vector3<f64>) {
        (self.pose.rotation.scaled_axis(), self.pose.translation)
    }

    pub fn quality(&self) -> TrackingQuality {
        self.quality
    }

    /// Status line describing the last tracked frame.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Track one frame. The image must match the configured camera size.
    pub fn track_frame(&mut self, image: GrayImage) -> Result<TrackingQuality> {
        let (want_w, want_h) = self.camera.image_size();
        if image.width() != want_w || image.height() != want_h {
            return Err(TrackerError::FrameSizeMismatch {
                got_w: image.width(),
                got_h: image.height(),
                want_w,
                want_h,
            }
            .into());
        }

        self.frame_count += 1;
        self.message.clear();

        // The depth estimate persists across frames; a frame only replaces
        // it when enough points are found to recompute it.
        let depth_mean = self.current_kf.scene_depth_mean;
        let depth_sigma = self.current_kf.scene_depth_sigma;
        self.current_kf = KeyFrame::from_image(image, self.pose.clone());
        self.current_kf.scene_depth_mean = depth_mean;
        self.current_kf.scene_depth_sigma = depth_sigma;
        self.rotation_estimator.push_frame(&self.current_kf);

        let map_good = self.map.read().is_good();
        if map_good && self.lost_frames < MAX_LOST_FRAMES {
            self.map_maker.set_mode(MappingMode::Map);
            self.track_normally();
        } else {
            self.map_maker.set_mode(MappingMode::Relocalize);
            self.message.push_str("Attempting recovery. ");
            if self.attempt_recovery() {
                self.track_map();
                self.assess_quality();
                self.message.push_str("Recovered. ");
            } else {
                self.quality = TrackingQuality::Bad;
            }
        }

        if let Some(writer) = self.trajectory.as_mut() {
            writer.record(self.frame_count, self.quality, &self.pose)?;
        }
        self.drain_commands()?;
        Ok(self.quality)
    }

    /// The ordinary frame path: predict, track, update the motion model,
    /// grade the result, maybe submit a keyframe.
    fn track_normally(&mut self) {
        let seed = if self.config.use_rotation_estimator {
            self.rotation_estimator.estimate_rotation(&self.camera)
        } else {
            None
        };
        self.pose = self.motion_model.predict(&self.pose, seed.as_ref());
        self.start_pose = self.pose.clone();

        self.track_map();

        self.motion_model
            .update(&self.pose, &self.start_pose, self.current_kf.scene_depth_mean);
        self.assess_quality();

        let (num_points, num_keyframes) = {
            let map = self.map.read();
            (map.num_points(), map.num_keyframes())
        };
        let _ = write!(self.message, "Tracking map, quality {}. Found:", self.quality.as_str());
        for level in 0..LEVELS {
            let _ = write!(self.message, " {}/{}", self.found[level], self.attempted[level]);
        }
        let _ = write!(self.message, " Map: {}P, {}KF.", num_points, num_keyframes);

        if self.quality == TrackingQuality::Good
            && self.frame_count - self.last_keyframe_frame > MIN_FRAMES_BETWEEN_KEYFRAMES
            && self.map_maker.queue_size() < MAX_KEYFRAME_QUEUE
            && self.map_maker.need_new_keyframe(&self.current_kf)
        {
            self.last_keyframe_frame = self.frame_count;
            info!(frame = self.frame_count, "submitting new keyframe");
            self.message.push_str(" Adding keyframe.");
            self.map_maker.add_keyframe(self.current_kf.clone());
        }
    }

    /// Grade the frame and maintain the lost-frame counter. DODGY frames
    /// escalate to BAD when the camera has drifted far from every keyframe.
    fn assess_quality(&mut self) {
        self.quality = quality::assess(&self.attempted, &self.found, &self.config);
        if self.quality == TrackingQuality::Dodgy
            && self
                .map_maker
                .is_distance_to_nearest_keyframe_excessive(&self.current_kf)
        {
            self.quality = TrackingQuality::Bad;
        }
        match self.quality {
            TrackingQuality::Bad => self.lost_frames += 1,
            _ => self.lost_frames = 0,
        }
    }

    /// Two-stage patch search and pose refinement against the map.
    fn track_map(&mut self) {
        self.attempted = [0; LEVELS];
        self.found = [0; LEVELS];
        self.outlier_marks.clear();
        self.inlier_marks.clear();

        // Snapshot the potentially-visible set under one short read lock.
        // Patches are Arc-shared, so search needs no further map access.
        {
            let map = self.map.read();
            self.arena.retain(|id, _| map.contains_point(*id));
            for point in map.points() {
                let data = self.arena.entry(point.id).or_insert_with(|| {
                    TrackerData::new(point.id, point.position, Arc::clone(&point.patch))
                });
                data.prepare_for_frame(point.position);
            }
        }

        // Project every candidate and bucket it by its matched search level.
        let mut buckets: [Vec<MapPointId>; LEVELS] = Default::default();
        for data in self.arena.values_mut() {
            data.project(&self.pose, &self.camera);
            if !data.in_image {
                continue;
            }
            let Some(level) = data.finder.calc_search_level_and_warp(
                &data.patch,
                &self.pose,
                &self.camera,
                &data.world_pos,
            ) else {
                continue;
            };
            data.search_level = level;
            buckets[level].push(data.point_id);
        }
        for bucket in &mut buckets {
            bucket.shuffle(&mut self.rng);
        }

        let mut iteration_set: Vec<MapPointId> = Vec::new();

        // Coarse stage: a wide search over large-scale points only, skipped
        // when the camera is barely moving.
        let mut did_coarse = false;
        // A fresh relocalization always gets the wide search, even when the
        // coarse stage is otherwise disabled.
        let use_coarse = self.just_recovered
            || (!self.config.disable_coarse
                && self.motion_model.scaled_velocity_magnitude()
                    > self.config.coarse_min_velocity);
        let mut coarse_range = self.config.coarse_range;
        let mut coarse_max = self.config.coarse_max;
        if self.just_recovered {
            coarse_range *= 2;
            coarse_max *= 2;
        }
        self.just_recovered = false;

        if use_coarse
            && buckets[LEVELS - 1].len() + buckets[LEVELS - 2].len() > self.config.coarse_min
        {
            // Take up to the budget out of the top two buckets; whatever is
            // not selected stays bucketed for the fine stage.
            let mut candidates: Vec<MapPointId> = Vec::with_capacity(coarse_max);
            for level in [LEVELS - 1, LEVELS - 2] {
                let take = buckets[level].len().min(coarse_max - candidates.len());
                candidates.extend(buckets[level].drain(..take));
            }

            let found =
                self.search_for_points(&candidates, coarse_range, self.config.coarse_sub_pix_its);
            iteration_set = candidates;

            if found >= self.config.coarse_min {
                did_coarse = true;
                for iter in 0..GN_ITERATIONS {
                    let pose = self.pose.clone();
                    for id in &iteration_set {
                        let Some(data) = self.arena.get_mut(id) else {
                            continue;
                        };
                        if data.found {
                            data.project_and_derivs(&pose, &self.camera);
                            data.calc_jacobian();
                        }
                    }
                    let override_sigma = (iter > 5).then_some(COARSE_OVERRIDE_SIGMA_SQUARED);
                    let update = self.calc_pose_update(&iteration_set, override_sigma, false);
                    self.pose = SE3::exp(&update) * self.pose.clone();
                }
                debug!(found, "coarse stage converged");
            }
        }

        // Fine stage. Top-level points are all searched with sub-pixel
        // refinement; the rest share the remaining per-frame budget.
        let fine_range = if did_coarse {
            FINE_RANGE_AFTER_COARSE
        } else {
            FINE_RANGE
        };

        let top = std::mem::take(&mut buckets[LEVELS - 1]);
        if !top.is_empty() {
            let pose = self.pose.clone();
            for id in &top {
                if let Some(data) = self.arena.get_mut(id) {
                    data.project_and_derivs(&pose, &self.camera);
                }
            }
            self.search_for_points(&top, fine_range, FINE_TOP_LEVEL_SUB_PIX_ITS);
            iteration_set.extend(top);
        }

        let mut pooled: Vec<MapPointId> = Vec::new();
        for level in (1..LEVELS - 1).rev() {
            pooled.append(&mut buckets[level]);
        }
        pooled.append(&mut buckets[0]);
        let budget = self
            .config
            .max_patches_per_frame
            .saturating_sub(iteration_set.len());
        if pooled.len() > budget {
            pooled.shuffle(&mut self.rng);
            pooled.truncate(budget);
        }
        if did_coarse {
            let pose = self.pose.clone();
            for id in &pooled {
                if let Some(data) = self.arena.get_mut(id) {
                    data.project_and_derivs(&pose, &self.camera);
                }
            }
        }
        self.search_for_points(&pooled, fine_range, 0);
        iteration_set.extend(pooled);

        // Ten Gauss-Newton iterations. Re-projection is expensive, so most
        // iterations extrapolate the image positions linearly instead.
        let mut last_update = Vector6::<f64>::zeros();
        for iter in 0..GN_ITERATIONS {
            let nonlinear = NONLINEAR_ITERATIONS.contains(&iter);
            let pose = self.pose.clone();
            for id in &iteration_set {
                let Some(data) = self.arena.get_mut(id) else {
                    continue;
                };
                if !data.found {
                    continue;
                }
                if nonlinear {
                    data.project_and_derivs(&pose, &self.camera);
                    data.calc_jacobian();
                } else {
                    data.linear_update(&last_update);
                }
            }
            let override_sigma = (iter > 5).then_some(FINE_OVERRIDE_SIGMA_SQUARED);
            let update =
                self.calc_pose_update(&iteration_set, override_sigma, iter == GN_ITERATIONS - 1);
            self.pose = SE3::exp(&update) * self.pose.clone();
            last_update = update;
        }

        if !self.pose.is_finite() {
            warn!("refined pose is not finite, reverting to prediction");
            self.pose = self.start_pose.clone();
            return;
        }

        self.commit_frame(&iteration_set);
    }

    /// Record the frame's result: measurements and scene depth on the
    /// keyframe candidate, outlier marks into the map.
    fn commit_frame(&mut self, iteration_set: &[MapPointId]) {
        self.current_kf.pose = self.pose.clone();
        self.current_kf.measurements.clear();

        let mut depth_sum = 0.0;
        let mut depth_sum_squared = 0.0;
        let mut depth_count = 0usize;
        for id in iteration_set {
            let Some(data) = self.arena.get(id) else {
                continue;
            };
            if !data.found {
                continue;
            }
            self.current_kf.measurements.insert(
                *id,
                Measurement {
                    pos: data.found_pos,
                    level: data.search_level,
                    sub_pix: data.did_sub_pix,
                },
            );
            let z = data.cam_pos.z;
            depth_sum += z;
            depth_sum_squared += z * z;
            depth_count += 1;
        }
        if depth_count > MIN_DEPTH_MEASUREMENTS {
            let mean = depth_sum / depth_count as f64;
            let variance = (depth_sum_squared / depth_count as f64 - mean * mean).max(0.0);
            self.current_kf.scene_depth_mean = mean;
            self.current_kf.scene_depth_sigma = variance.sqrt();
        }

        if !self.outlier_marks.is_empty() || !self.inlier_marks.is_empty() {
            let mut map = self.map.write();
            for id in &self.outlier_marks {
                if let Some(point) = map.point_mut(*id) {
                    point.outlier_count += 1;
                }
            }
            for id in &self.inlier_marks {
                if let Some(point) = map.point_mut(*id) {
                    point.inlier_count += 1;
                }
            }
        }
    }

    /// Search the current frame for each listed point at its stored search
    /// level. Updates per-level statistics and returns how many were found.
    fn search_for_points(&mut self, ids: &[MapPointId], range: usize, sub_pix_its: usize) -> usize {
        let mut found_count = 0;
        for id in ids {
            let Some(data) = self.arena.get_mut(id) else {
                continue;
            };
            if !data.finder.make_template(&data.patch) {
                data.found = false;
                continue;
            }
            let level = data.finder.level();
            self.attempted[level] += 1;
            data.searched = true;

            if !data
                .finder
                .find_patch_coarse(&data.image_pos, &self.current_kf, range)
            {
                data.found = false;
                continue;
            }
            data.found = true;
            data.sqrt_inv_noise = 1.0 / level_scale(level);
            self.found[level] += 1;
            found_count += 1;

            if sub_pix_its > 0 {
                data.did_sub_pix = true;
                let converged = data.finder.make_sub_pix_template(&data.patch)
                    && data.finder.iterate_sub_pix(&self.current_kf, sub_pix_its);
                if !converged {
                    data.found = false;
                    self.found[level] -= 1;
                    found_count -= 1;
                    continue;
                }
                data.found_pos = data.finder.sub_pix_pos_level_zero();
            } else {
                data.did_sub_pix = false;
                data.found_pos = data.finder.coarse_pos_level_zero();
            }
        }
        found_count
    }

    /// One robustly-weighted Gauss-Newton step over the found points.
    ///
    /// Returns the null update when no point contributes, so callers can
    /// apply it unconditionally. On the final iteration, points whose
    /// weight the M-estimator drives to zero are queued as outliers.
    fn calc_pose_update(
        &mut self,
        ids: &[MapPointId],
        override_sigma_squared: Option<f64>,
        mark_outliers: bool,
    ) -> Vector6<f64> {
        let kind = self.config.m_estimator;

        let mut errors_squared = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(data) = self.arena.get_mut(id) else {
                continue;
            };
            if !data.found || !data.in_image {
                continue;
            }
            data.error_cov_scaled = data.sqrt_inv_noise * (data.found_pos - data.image_pos);
            errors_squared.push(data.error_cov_scaled.norm_squared());
        }

        let sigma_squared = match override_sigma_squared {
            Some(s) => s,
            None => match kind.find_sigma_squared(&errors_squared) {
                Some(s) => s,
                None => return Vector6::zeros(),
            },
        };

        let mut wls = WeightedLeastSquares::with_prior(STABILIZING_PRIOR);
        for id in ids {
            let Some(data) = self.arena.get_mut(id) else {
                continue;
            };
            if !data.found || !data.in_image {
                continue;
            }
            let weight = kind.weight(data.error_cov_scaled.norm_squared(), sigma_squared);
            if weight == 0.0 {
                if mark_outliers {
                    self.outlier_marks.push(*id);
                }
                continue;
            }
            if mark_outliers {
                self.inlier_marks.push(*id);
            }
            for row in 0..2 {
                let jac = data.sqrt_inv_noise * data.jacobian.row(row).transpose();
                wls.add_row(data.error_cov_scaled[row], &jac, weight);
            }
        }
        wls.solve().unwrap_or_else(Vector6::zeros)
    }

    /// Adopt a relocalization candidate pose if one is ready and plausible.
    fn attempt_recovery(&mut self) -> bool {
        self.map_maker.add_reloc_image(&self.current_kf);
        if !self.map_maker.new_reloc_pose_ready() {
            return false;
        }
        let pose = self.map_maker.last_reloc_pose();
        if !pose.is_finite() {
            warn!("relocalization candidate pose is not finite, rejected");
            return false;
        }
        let slot = self.map_maker.best_reloc_keyframe();
        {
            let map = self.map.read();
            let Some(kf) = map.keyframe_by_slot(slot) else {
                return false;
            };
            if self
                .map_maker
                .is_distance_to_reloc_keyframe_excessive(&pose, kf)
            {
                debug!(slot, "relocalization candidate too far from its keyframe");
                return false;
            }
        }
        self.pose = pose.clone();
        self.start_pose = pose;
        self.motion_model.reset();
        self.just_recovered = true;
        true
    }

    /// Ask the mapping process to reset and wait for it to finish, then
    /// clear all per-session tracking state.
    pub fn reset(&mut self) -> Result<()> {
        let done = self.map_maker.request_reset();
        done.recv().context("waiting for map reset to complete")?;

        self.pose = SE3::identity();
        self.start_pose = SE3::identity();
        self.motion_model.reset();
        self.rotation_estimator.reset();
        self.quality = TrackingQuality::Bad;
        self.lost_frames = 0;
        self.frame_count = 0;
        self.last_keyframe_frame = 0;
        self.just_recovered = false;
        self.attempted = [0; LEVELS];
        self.found = [0; LEVELS];
        self.arena.clear();
        self.message.clear();
        Ok(())
    }

    fn drain_commands(&mut self) -> Result<()> {
        self.rejected_commands.clear();
        while let Ok(command) = self.command_rx.try_recv() {
            match command.as_str() {
                "reset" => self.reset()?,
                other => self
                    .rejected_commands
                    .push(TrackerError::UnknownCommand(other.to_string())),
            }
        }
        Ok(())
    }
}
