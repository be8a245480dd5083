//! File output for offline inspection of tracking runs.

pub mod trajectory;

pub use trajectory::TrajectoryWriter;
