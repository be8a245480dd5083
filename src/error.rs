//! Typed errors surfaced across the tracker's public boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    /// A command arrived on the command channel that the tracker does not
    /// understand. Reported to the caller instead of terminating.
    #[error("unhandled tracker command: {0}")]
    UnknownCommand(String),

    /// An M-estimator name that is not one of Tukey, Cauchy, Huber.
    #[error("invalid M-estimator {0:?}, choices are Tukey, Cauchy, Huber")]
    UnknownMEstimator(String),

    /// The incoming frame does not match the configured camera resolution.
    #[error("frame size {got_w}x{got_h} does not match configured {want_w}x{want_h}")]
    FrameSizeMismatch {
        got_w: u32,
        got_h: u32,
        want_w: u32,
        want_h: u32,
    },
}
