//! Asynchronous boundary to the mapping process.
//!
//! The mapping process runs on its own thread and owns map construction,
//! bundle adjustment and relocalization. The tracker talks to it through
//! this trait: submissions are fire-and-forget, results are non-blocking
//! polls, and reset completion is signalled over a channel so the tracker
//! can wait without busy-spinning.

use crossbeam_channel::Receiver;

use crate::geometry::SE3;
use crate::map::KeyFrame;

/// What the mapping process should spend its cycles on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingMode {
    /// Normal map maintenance: triangulation, bundle adjustment.
    Map,
    /// Tracking is lost; prioritize relocalization.
    Relocalize,
}

/// Capabilities the tracker consumes from the mapping process.
///
/// No lock is held across any of these calls; the tracker tolerates the
/// mapping process changing map state between its own pose commit and any
/// subsequent query.
pub trait MapMaker: Send + Sync {
    /// Ask the mapping process to reset itself and clear the map. The
    /// returned receiver fires exactly once when the reset has completed.
    fn request_reset(&self) -> Receiver<()>;

    /// Switch the mapping process between mapping and relocalization work.
    fn set_mode(&self, mode: MappingMode);

    /// Number of keyframes queued and not yet integrated.
    fn queue_size(&self) -> usize;

    /// Whether the mapping process wants this keyframe added to the map.
    fn need_new_keyframe(&self, kf: &KeyFrame) -> bool;

    /// Hand a keyframe over for integration. Fire-and-forget.
    fn add_keyframe(&self, kf: KeyFrame);

    /// Submit the current frame for relocalization. Fire-and-forget.
    fn add_reloc_image(&self, kf: &KeyFrame);

    /// Whether a relocalization candidate pose is ready to fetch.
    fn new_reloc_pose_ready(&self) -> bool;

    /// The most recent relocalization candidate pose.
    fn last_reloc_pose(&self) -> SE3;

    /// Insertion slot of the keyframe the candidate pose was matched to.
    fn best_reloc_keyframe(&self) -> usize;

    /// Whether a candidate pose is too far from its source keyframe to be
    /// trusted. Deliberately lenient: responsiveness over certainty.
    fn is_distance_to_reloc_keyframe_excessive(&self, pose: &SE3, kf: &KeyFrame) -> bool;

    /// Whether the given frame has drifted excessively far from every
    /// keyframe in the map. Used to escalate DODGY quality to BAD.
    fn is_distance_to_nearest_keyframe_excessive(&self, kf: &KeyFrame) -> bool;
}
