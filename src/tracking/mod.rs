//! The per-frame tracking pipeline.
//!
//! `tracker` orchestrates; the rest are its parts: patch search
//! (`patch_finder`, `tracker_data`), robust pose refinement
//! (`m_estimator`, `pose_update`), motion prediction (`motion_model`,
//! `rotation_estimator`) and result grading (`quality`).

pub mod m_estimator;
pub mod motion_model;
pub mod patch_finder;
pub mod pose_update;
pub mod quality;
pub mod rotation_estimator;
pub mod tracker;
pub mod tracker_data;

pub use m_estimator::MEstimatorKind;
pub use motion_model::MotionModel;
pub use quality::TrackingQuality;
pub use rotation_estimator::RotationEstimator;
pub use tracker::Tracker;
