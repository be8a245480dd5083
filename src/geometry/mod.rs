//! Geometry utilities: SE(3) transforms and Lie algebra helpers.

pub mod se3;
pub mod so3;

pub use se3::SE3;
pub use so3::skew;
