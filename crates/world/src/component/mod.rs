//! Components attached to entities.
//!
//! Synchronized components wrap a fixed-layout [`bytemuck::Pod`] payload so a
//! batch of them serializes as one contiguous byte array next to a parallel
//! entity-id array. Internal components never leave the process.

mod internal;
mod mesh_renderer;
mod point_light;
mod relationship;
mod sync;
mod transform;

use std::fmt::Debug;

use bytemuck::Pod;

use crate::content::ContentStore;
use crate::world::{EntityId, EntityRegistry};

pub use internal::{Pointer, PointerFlags, PointerState, ScriptBinding, TransformAuthority, Uuid};
pub use mesh_renderer::{MeshRenderer, MeshRendererData};
pub use point_light::{PointLight, PointLightData};
pub use relationship::{Relationship, RelationshipData};
pub use sync::{SyncEntry, SyncRegistry};
pub use transform::{Transform, TransformData};

/// Wire tag of each synchronized component type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ComponentType {
    Transform = 1,
    MeshRenderer = 2,
    PointLight = 3,
    Relationship = 4,
}

impl ComponentType {
    pub const ALL: [ComponentType; 4] = [
        ComponentType::Transform,
        ComponentType::MeshRenderer,
        ComponentType::PointLight,
        ComponentType::Relationship,
    ];

    pub fn tag(self) -> u16 {
        self as u16
    }

    pub fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            1 => Some(Self::Transform),
            2 => Some(Self::MeshRenderer),
            3 => Some(Self::PointLight),
            4 => Some(Self::Relationship),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Transform => "Transform",
            Self::MeshRenderer => "MeshRenderer",
            Self::PointLight => "PointLight",
            Self::Relationship => "Relationship",
        }
    }
}

/// Wire payload plus a whole-component dirty flag.
#[derive(Debug, Clone, Copy)]
pub struct SyncState<P> {
    data: P,
    dirty: bool,
}

impl<P: Pod> SyncState<P> {
    /// Locally created state; starts dirty so the first broadcast carries it.
    pub fn new(data: P) -> Self {
        Self { data, dirty: true }
    }

    /// State that arrived from a peer and has nothing left to send.
    pub fn received(data: P) -> Self {
        Self { data, dirty: false }
    }

    pub fn data(&self) -> &P {
        &self.data
    }

    /// Overwrites the payload, flagging it dirty only when the bytes differ.
    pub fn write(&mut self, data: P) -> bool {
        if bytemuck::bytes_of(&self.data) == bytemuck::bytes_of(&data) {
            return false;
        }
        self.data = data;
        self.dirty = true;
        true
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }
}

/// A component replicated from the server to every joined client.
pub trait SynchronizedComponent: Sized + 'static {
    type Payload: Pod + Debug;

    const TYPE: ComponentType;

    /// Builds the component from a received payload. Must agree byte-for-byte
    /// with every other constructor that yields the same payload.
    fn from_payload(payload: Self::Payload) -> Self;

    fn sync(&self) -> &SyncState<Self::Payload>;

    fn sync_mut(&mut self) -> &mut SyncState<Self::Payload>;

    /// Re-resolves asset references after the payload changed.
    fn refresh(&mut self, _content: &dyn ContentStore) {}

    /// Whether incoming payloads for `entity` must be ignored because the
    /// local process owns this state.
    fn locally_owned(_registry: &EntityRegistry, _entity: EntityId) -> bool {
        false
    }

    fn data(&self) -> Self::Payload {
        *self.sync().data()
    }

    fn write_data(&mut self, payload: Self::Payload) -> bool {
        self.sync_mut().write(payload)
    }

    fn is_dirty(&self) -> bool {
        self.sync().is_dirty()
    }

    fn mark_clean(&mut self) {
        self.sync_mut().mark_clean();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};

    #[test]
    fn component_tags_round_trip() {
        for ty in ComponentType::ALL {
            assert_eq!(ComponentType::from_tag(ty.tag()), Some(ty));
        }
        assert_eq!(ComponentType::from_tag(0), None);
        assert_eq!(ComponentType::from_tag(99), None);
    }

    #[test]
    fn write_marks_dirty_only_on_change() {
        let mut state = SyncState::received([1u32, 2, 3]);
        assert!(!state.is_dirty());

        assert!(!state.write([1, 2, 3]));
        assert!(!state.is_dirty());

        assert!(state.write([1, 2, 4]));
        assert!(state.is_dirty());

        state.mark_clean();
        assert!(!state.is_dirty());
    }

    #[test]
    fn rewriting_read_data_is_a_no_op() {
        let mut transform = Transform::new(Vec3::new(1.0, 2.0, 3.0), Quat::from_rotation_y(0.5));
        transform.mark_clean();
        assert!(!transform.write_data(transform.data()));
        assert!(!transform.is_dirty());

        let mut light = PointLight::new(Vec3::ONE, Vec3::new(0.5, 0.25, 1.0));
        light.mark_clean();
        assert!(!light.write_data(light.data()));
        assert!(!light.is_dirty());

        let mut mesh = MeshRenderer::new(7, 9);
        mesh.mark_clean();
        assert!(!mesh.write_data(mesh.data()));
        assert!(!mesh.is_dirty());

        let mut relationship = Relationship::new(5);
        relationship.mark_clean();
        assert!(!relationship.write_data(relationship.data()));
        assert!(!relationship.is_dirty());
    }
}
