use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Quat, Vec3};

use super::{ComponentType, SyncState, SynchronizedComponent, TransformAuthority};
use crate::world::{EntityId, EntityRegistry};

/// Local-space position and orientation (quaternion stored x, y, z, w).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct TransformData {
    pub position: [f32; 3],
    pub orientation: [f32; 4],
}

impl Default for TransformData {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            orientation: Quat::IDENTITY.to_array(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Transform {
    sync: SyncState<TransformData>,
    world: Mat4,
}

impl Default for Transform {
    fn default() -> Self {
        Self::new(Vec3::ZERO, Quat::IDENTITY)
    }
}

impl Transform {
    pub fn new(position: Vec3, orientation: Quat) -> Self {
        let sync = SyncState::new(TransformData {
            position: position.to_array(),
            orientation: orientation.to_array(),
        });
        let mut transform = Self {
            sync,
            world: Mat4::IDENTITY,
        };
        transform.world = transform.local_matrix();
        transform
    }

    pub fn position(&self) -> Vec3 {
        Vec3::from_array(self.sync.data().position)
    }

    /// Normalized orientation; a degenerate quaternion reads as identity.
    pub fn orientation(&self) -> Quat {
        let q = Quat::from_array(self.sync.data().orientation);
        if q.length_squared() > f32::EPSILON {
            q.normalize()
        } else {
            Quat::IDENTITY
        }
    }

    pub fn set_position(&mut self, position: Vec3) -> bool {
        let mut data = *self.sync.data();
        data.position = position.to_array();
        self.sync.write(data)
    }

    pub fn set_orientation(&mut self, orientation: Quat) -> bool {
        let mut data = *self.sync.data();
        data.orientation = orientation.to_array();
        self.sync.write(data)
    }

    pub fn local_matrix(&self) -> Mat4 {
        Mat4::from_rotation_translation(self.orientation(), self.position())
    }

    /// Last world matrix computed by the hierarchy pass.
    pub fn world_matrix(&self) -> Mat4 {
        self.world
    }

    pub fn world_position(&self) -> Vec3 {
        self.world.w_axis.truncate()
    }

    pub(crate) fn set_world_matrix(&mut self, world: Mat4) {
        self.world = world;
    }
}

impl SynchronizedComponent for Transform {
    type Payload = TransformData;

    const TYPE: ComponentType = ComponentType::Transform;

    fn from_payload(payload: TransformData) -> Self {
        let mut transform = Self {
            sync: SyncState::received(payload),
            world: Mat4::IDENTITY,
        };
        transform.world = transform.local_matrix();
        transform
    }

    fn sync(&self) -> &SyncState<TransformData> {
        &self.sync
    }

    fn sync_mut(&mut self) -> &mut SyncState<TransformData> {
        &mut self.sync
    }

    fn locally_owned(registry: &EntityRegistry, entity: EntityId) -> bool {
        registry.has::<TransformAuthority>(entity)
    }
}
