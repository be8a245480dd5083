//! Tracker configuration.
//!
//! All tunables live in one immutable-per-session structure passed at
//! construction; `Tracker::reset` re-applies it but nothing reads scattered
//! global state. Defaults match the reference behavior.

use std::path::PathBuf;
use std::str::FromStr;

use tracing::warn;

use crate::tracking::m_estimator::MEstimatorKind;

/// Configuration for the tracking core.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Blur sigma for the global rotation estimator's small images.
    pub rotation_estimator_blur: f64,

    /// Whether the global rotation estimator seeds the motion model.
    pub use_rotation_estimator: bool,

    /// Minimum number of large-scale features for the coarse stage to run,
    /// and the minimum found count for its optimization to be trusted.
    pub coarse_min: usize,

    /// Maximum number of large-scale features used by the coarse stage.
    pub coarse_max: usize,

    /// Pixel search radius for coarse features, in search-level pixels.
    pub coarse_range: usize,

    /// Maximum sub-pixel iterations for coarse features.
    pub coarse_sub_pix_its: usize,

    /// Disable the coarse stage entirely (except right after recovery).
    pub disable_coarse: bool,

    /// Scene-depth-scaled velocity above which the coarse stage is used.
    pub coarse_min_velocity: f64,

    /// Global per-frame patch search budget for the fine stage.
    pub max_patches_per_frame: usize,

    /// Overall found-fraction above which tracking quality is GOOD.
    pub quality_good: f64,

    /// Large-scale found-fraction below which tracking quality is BAD.
    pub quality_lost: f64,

    /// Influence function used by the pose refiner.
    pub m_estimator: MEstimatorKind,

    /// Optional per-frame trajectory log (`frame;quality;x;y;z`).
    pub trajectory_path: Option<PathBuf>,

    /// Seed for the PVS shuffle and fine-stage down-sampling. `None` draws
    /// entropy at construction, making the shuffle nondeterministic.
    pub rng_seed: Option<u64>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            rotation_estimator_blur: 0.75,
            use_rotation_estimator: true,
            coarse_min: 20,
            coarse_max: 100,
            coarse_range: 20,
            coarse_sub_pix_its: 8,
            disable_coarse: false,
            coarse_min_velocity: 0.006,
            max_patches_per_frame: 1000,
            quality_good: 0.3,
            quality_lost: 0.1,
            m_estimator: MEstimatorKind::Tukey,
            trajectory_path: None,
            rng_seed: None,
        }
    }
}

impl TrackerConfig {
    /// Select the M-estimator by name. An unknown name is reported once and
    /// falls back to Tukey; the session continues.
    pub fn with_m_estimator_name(mut self, name: &str) -> Self {
        self.m_estimator = match MEstimatorKind::from_str(name) {
            Ok(kind) => kind,
            Err(err) => {
                warn!("{err}; defaulting to Tukey");
                MEstimatorKind::Tukey
            }
        };
        self
    }
}
