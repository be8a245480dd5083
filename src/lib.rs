//! Per-frame visual tracking core of a keyframe-based monocular SLAM
//! system.
//!
//! Given a calibrated camera, a shared map of 3D points with reference
//! image patches, and a mapping process reachable through the [`mapping`]
//! trait boundary, [`tracking::Tracker`] estimates a 6-DoF camera pose for
//! every incoming video frame by warped patch search and robustly-weighted
//! Gauss-Newton refinement.

pub mod camera;
pub mod config;
pub mod error;
pub mod geometry;
pub mod io;
pub mod map;
pub mod mapping;
pub mod tracking;

pub use camera::CameraModel;
pub use config::TrackerConfig;
pub use error::TrackerError;
pub use tracking::{Tracker, TrackingQuality};
