use std::collections::HashMap;

use glam::Vec3;

use skein::component::PointLight;
use skein::world::{EntityId, World};

const ORBIT_RADIUS: f32 = 1.5;
const ORBIT_SPEED: f32 = 0.6;

/// Moves every point light on a slow horizontal circle around the spot it
/// was first seen at.
#[derive(Debug, Default)]
pub struct LightOrbit {
    anchors: HashMap<EntityId, Vec3>,
    elapsed: f32,
}

impl LightOrbit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(&mut self, world: &mut World, dt: f32) {
        self.elapsed += dt;
        let registry = world.registry_mut();
        self.anchors.retain(|&entity, _| registry.has::<PointLight>(entity));

        for (index, entity) in registry.view::<PointLight>().into_iter().enumerate() {
            let Some(light) = registry.get_mut::<PointLight>(entity) else {
                continue;
            };
            let anchor = *self
                .anchors
                .entry(entity)
                .or_insert_with(|| light.position());

            let phase = self.elapsed * ORBIT_SPEED + index as f32;
            let (sin, cos) = phase.sin_cos();
            light.set_position(anchor + Vec3::new(cos, 0.0, sin) * ORBIT_RADIUS);
        }
    }
}
