use std::f32::consts::FRAC_PI_2;

use glam::{Quat, Vec3};
use rkyv::rancor;
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};

use super::{Avatar, AvatarError, AvatarType};
use crate::component::{Pointer, Transform};
use crate::world::{EntityId, World};

#[derive(Debug, Clone, Copy, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct SpectatorPose {
    pub position: [f32; 3],
    pub pan: f32,
    pub tilt: f32,
}

/// Free-flying camera: position plus pan (yaw) and tilt (pitch).
#[derive(Debug, Clone, Default)]
pub struct SpectatorAvatar {
    position: Vec3,
    pan: f32,
    tilt: f32,
    entities: Vec<EntityId>,
}

impl SpectatorAvatar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn pan(&self) -> f32 {
        self.pan
    }

    pub fn tilt(&self) -> f32 {
        self.tilt
    }

    pub fn pose(&self) -> SpectatorPose {
        SpectatorPose {
            position: self.position.to_array(),
            pan: self.pan,
            tilt: self.tilt,
        }
    }

    /// Rotates by `pan`/`tilt` radians, then moves along the view (`truck`),
    /// sideways (`dolly`) and straight up (`boom`). Tilt stays within ±π/2.
    pub fn move_camera(&mut self, pan: f32, tilt: f32, truck: f32, dolly: f32, boom: f32) {
        self.pan += pan;
        self.tilt = (self.tilt + tilt).clamp(-FRAC_PI_2, FRAC_PI_2);

        let (pan_sin, pan_cos) = self.pan.sin_cos();
        let (tilt_sin, tilt_cos) = self.tilt.sin_cos();
        let forward = Vec3::new(pan_sin * tilt_cos, -tilt_sin, -pan_cos * tilt_cos);
        let side = Vec3::new(-pan_cos, 0.0, -pan_sin);

        self.position += forward * truck + side * dolly + Vec3::Y * boom;
    }

    pub fn orientation(&self) -> Quat {
        Quat::from_rotation_z(self.tilt) * Quat::from_rotation_y(self.pan)
    }

    fn apply_pose(&mut self, pose: SpectatorPose) -> Result<(), AvatarError> {
        let finite = pose.position.iter().all(|v| v.is_finite())
            && pose.pan.is_finite()
            && pose.tilt.is_finite();
        if !finite {
            return Err(AvatarError::NonFinite);
        }
        self.position = Vec3::from_array(pose.position);
        self.pan = pose.pan;
        self.tilt = pose.tilt.clamp(-FRAC_PI_2, FRAC_PI_2);
        Ok(())
    }
}

impl Avatar for SpectatorAvatar {
    fn avatar_type(&self) -> AvatarType {
        AvatarType::Spectator
    }

    fn serialize(&self) -> Result<Vec<u8>, AvatarError> {
        rkyv::to_bytes::<rancor::Error>(&self.pose())
            .map(|aligned| aligned.into_vec())
            .map_err(AvatarError::Encode)
    }

    fn deserialize(&mut self, bytes: &[u8]) -> Result<(), AvatarError> {
        let mut aligned = AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        let pose = rkyv::from_bytes::<SpectatorPose, rancor::Error>(&aligned)
            .map_err(AvatarError::Decode)?;
        self.apply_pose(pose)
    }

    fn attach(&mut self, world: &mut World) -> Result<Vec<EntityId>, AvatarError> {
        let entity = world.create_entity();
        let registry = world.registry_mut();
        registry.emplace(entity, Transform::new(self.position, self.orientation()))?;
        registry.emplace(entity, Pointer::new(self.position, Vec3::Z))?;
        self.entities = vec![entity];
        Ok(self.entities.clone())
    }

    fn sync_world(&mut self, world: &mut World) -> Result<(), AvatarError> {
        let orientation = self.orientation();
        for &entity in &self.entities {
            let registry = world.registry_mut();
            let transform = registry.get_or_emplace::<Transform>(entity)?;
            transform.set_position(self.position);
            transform.set_orientation(orientation);
            if let Some(pointer) = registry.get_mut::<Pointer>(entity) {
                pointer.origin = self.position;
            }
        }
        Ok(())
    }

    fn detach(&mut self, world: &mut World) -> Vec<EntityId> {
        let entities = std::mem::take(&mut self.entities);
        entities
            .into_iter()
            .filter(|&entity| world.destroy_entity(entity))
            .collect()
    }

    fn entities(&self) -> &[EntityId] {
        &self.entities
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::component::SynchronizedComponent;
    use crate::content::StaticContent;

    #[test]
    fn tilt_is_clamped() {
        let mut avatar = SpectatorAvatar::new();
        avatar.move_camera(0.0, 10.0, 0.0, 0.0, 0.0);
        assert_eq!(avatar.tilt(), FRAC_PI_2);
        avatar.move_camera(0.0, -20.0, 0.0, 0.0, 0.0);
        assert_eq!(avatar.tilt(), -FRAC_PI_2);
    }

    #[test]
    fn truck_moves_forward_along_negative_z() {
        let mut avatar = SpectatorAvatar::new();
        avatar.move_camera(0.0, 0.0, 2.0, 0.0, 1.0);
        assert!(avatar.position().abs_diff_eq(Vec3::new(0.0, 1.0, -2.0), 1e-5));
    }

    #[test]
    fn state_survives_serialization() {
        let mut source = SpectatorAvatar::new();
        source.move_camera(0.3, 0.2, 1.0, 0.5, 0.25);

        let mut mirror = SpectatorAvatar::new();
        mirror.deserialize(&source.serialize().unwrap()).unwrap();
        assert_eq!(mirror.pose(), source.pose());
    }

    #[test]
    fn rejects_garbage_and_non_finite_state() {
        let mut avatar = SpectatorAvatar::new();
        assert!(matches!(avatar.deserialize(&[1, 2, 3]), Err(AvatarError::Decode(_))));

        let mut bad = SpectatorAvatar::new();
        bad.position = Vec3::new(f32::NAN, 0.0, 0.0);
        assert!(matches!(
            avatar.deserialize(&bad.serialize().unwrap()),
            Err(AvatarError::NonFinite)
        ));
    }

    #[test]
    fn mirrors_into_world_entities() {
        let mut world = World::new(Arc::new(StaticContent::empty()));
        let mut avatar = SpectatorAvatar::new();
        let entities = avatar.attach(&mut world).unwrap();
        assert_eq!(entities.len(), 1);
        let entity = entities[0];
        world.mark_all_clean();

        avatar.move_camera(0.0, 0.0, 0.0, 0.0, 3.0);
        avatar.sync_world(&mut world).unwrap();
        let transform = world.registry().get::<Transform>(entity).unwrap();
        assert!(transform.is_dirty());
        assert_eq!(transform.position(), Vec3::new(0.0, 3.0, 0.0));

        assert_eq!(avatar.detach(&mut world), vec![entity]);
        assert!(!world.registry().valid(entity));
        assert!(avatar.entities().is_empty());
    }
}
