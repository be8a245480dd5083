//! The sparse map: MapPoints and KeyFrames behind a shared read/write lock.
//!
//! The mapping process owns the authoritative map (point creation, bundle
//! adjustment, culling); the tracker reads point snapshots for the PVS and
//! writes back per-point inlier/outlier counters and measurements. Neither
//! side holds the lock across calls into the other.

pub mod keyframe;
pub mod map_point;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

pub use keyframe::{level_scale, KeyFrame, KeyFrameId, Measurement, LEVELS};
pub(crate) use keyframe::half_sample;
pub use map_point::{MapPoint, MapPointId, PatchSource};

/// Shared handle to the map; lock sections are kept short on both sides.
pub type SharedMap = Arc<RwLock<Map>>;

/// Container for MapPoints and KeyFrames.
pub struct Map {
    points: HashMap<MapPointId, MapPoint>,
    keyframes: HashMap<KeyFrameId, KeyFrame>,

    /// KeyFrames in insertion order; relocalization refers to them by slot.
    keyframe_order: Vec<KeyFrameId>,

    next_point_id: u64,
    next_keyframe_id: u64,

    /// Whether the map is usable for tracking at all.
    good: bool,
}

impl Map {
    pub fn new() -> Self {
        Self {
            points: HashMap::new(),
            keyframes: HashMap::new(),
            keyframe_order: Vec::new(),
            next_point_id: 0,
            next_keyframe_id: 0,
            good: false,
        }
    }

    /// Fresh shared handle around an empty map.
    pub fn new_shared() -> SharedMap {
        Arc::new(RwLock::new(Self::new()))
    }

    pub fn is_good(&self) -> bool {
        self.good
    }

    pub fn set_good(&mut self, good: bool) {
        self.good = good;
    }

    /// Wipe all contents; the map becomes unusable until repopulated.
    pub fn clear(&mut self) {
        self.points.clear();
        self.keyframes.clear();
        self.keyframe_order.clear();
        self.good = false;
    }

    pub fn num_points(&self) -> usize {
        self.points.len()
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    pub fn points(&self) -> impl Iterator<Item = &MapPoint> {
        self.points.values()
    }

    pub fn point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.points.get(&id)
    }

    pub fn point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.points.get_mut(&id)
    }

    pub fn contains_point(&self, id: MapPointId) -> bool {
        self.points.contains_key(&id)
    }

    /// Insert a new point, assigning its id.
    pub fn add_point(
        &mut self,
        position: nalgebra::Vector3<f64>,
        patch: Arc<PatchSource>,
        source_kf: KeyFrameId,
    ) -> MapPointId {
        let id = MapPointId(self.next_point_id);
        self.next_point_id += 1;
        self.points.insert(id, MapPoint::new(id, position, patch, source_kf));
        id
    }

    pub fn remove_point(&mut self, id: MapPointId) -> Option<MapPoint> {
        self.points.remove(&id)
    }

    pub fn keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    /// KeyFrame by insertion slot, as relocalization candidates refer to it.
    pub fn keyframe_by_slot(&self, slot: usize) -> Option<&KeyFrame> {
        self.keyframe_order
            .get(slot)
            .and_then(|id| self.keyframes.get(id))
    }

    pub fn keyframe_ids(&self) -> impl Iterator<Item = &KeyFrameId> {
        self.keyframe_order.iter()
    }

    pub fn add_keyframe(&mut self, kf: KeyFrame) -> KeyFrameId {
        let id = KeyFrameId(self.next_keyframe_id);
        self.next_keyframe_id += 1;
        self.keyframes.insert(id, kf);
        self.keyframe_order.push(id);
        id
    }
}

impl Default for Map {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraModel;
    use crate::geometry::SE3;
    use image::{GrayImage, Luma};
    use nalgebra::Vector3;

    fn test_patch() -> Arc<PatchSource> {
        let cam = CameraModel::new(100.0, 100.0, 64.0, 48.0, 128, 96);
        let image = GrayImage::from_fn(128, 96, |x, y| Luma([((x * 3 + y) % 255) as u8]));
        let kf = KeyFrame::from_image(image, SE3::identity());
        let world = Vector3::new(0.0, 0.0, 2.0);
        let uv = cam.project(&world).unwrap();
        Arc::new(PatchSource::from_keyframe(&kf, &cam, 0, &uv, &world).unwrap())
    }

    #[test]
    fn test_point_ids_are_sequential_and_stable() {
        let mut map = Map::new();
        let patch = test_patch();
        let kf_id = KeyFrameId(0);

        let a = map.add_point(Vector3::new(0.0, 0.0, 1.0), patch.clone(), kf_id);
        let b = map.add_point(Vector3::new(0.0, 0.0, 2.0), patch.clone(), kf_id);
        assert_ne!(a, b);

        map.remove_point(a);
        let c = map.add_point(Vector3::new(0.0, 0.0, 3.0), patch, kf_id);
        // Removed ids are never reused.
        assert_ne!(c, a);
        assert!(map.point(a).is_none());
        assert!(map.point(b).is_some());
    }

    #[test]
    fn test_clear_makes_map_unusable() {
        let mut map = Map::new();
        map.set_good(true);
        assert!(map.is_good());

        map.clear();
        assert!(!map.is_good());
        assert_eq!(map.num_points(), 0);
    }

    #[test]
    fn test_keyframe_slots_follow_insertion_order() {
        let mut map = Map::new();
        let image = GrayImage::from_pixel(32, 32, Luma([0]));

        let first = map.add_keyframe(KeyFrame::from_image(image.clone(), SE3::identity()));
        let second = map.add_keyframe(KeyFrame::from_image(image, SE3::identity()));

        assert_eq!(map.keyframe_ids().copied().collect::<Vec<_>>(), vec![first, second]);
        assert!(map.keyframe_by_slot(1).is_some());
        assert!(map.keyframe_by_slot(2).is_none());
    }
}
