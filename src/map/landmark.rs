use std::collections::BTreeMap;

use nalgebra::Vector3;

use crate::map::types::LandmarkId;

/// A 3D visual landmark in world coordinates.
#[derive(Debug, Clone, Copy)]
pub struct Landmark {
    pub id: LandmarkId,
    pub position: Vector3<f64>,
}

/// Owner of all landmarks. Keyframe features point at entries here by id
/// only, so destroying or rewriting a landmark never dangles a reference.
#[derive(Debug, Default)]
pub struct LandmarkStore {
    landmarks: BTreeMap<LandmarkId, Landmark>,
    next_id: u64,
}

impl LandmarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a landmark at the given world position, returning its id.
    pub fn create(&mut self, position: Vector3<f64>) -> LandmarkId {
        let id = LandmarkId::new(self.next_id);
        self.next_id += 1;
        self.landmarks.insert(id, Landmark { id, position });
        id
    }

    pub fn get(&self, id: LandmarkId) -> Option<&Landmark> {
        self.landmarks.get(&id)
    }

    pub fn position_of(&self, id: LandmarkId) -> Option<Vector3<f64>> {
        self.landmarks.get(&id).map(|lm| lm.position)
    }

    pub fn set_position(&mut self, id: LandmarkId, position: Vector3<f64>) {
        if let Some(landmark) = self.landmarks.get_mut(&id) {
            landmark.position = position;
        }
    }

    pub fn len(&self) -> usize {
        self.landmarks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.landmarks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Landmark> {
        self.landmarks.values()
    }
}
